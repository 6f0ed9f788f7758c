//! IP address management for overlay networks
//!
//! Provides:
//! - IP pool allocation from an IPv4 range
//! - Persisted tracking of allocated addresses per network
//! - Gateway and MAC derivation helpers

use crate::error::{Error, Result};
use crate::store::{Document, Store};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

/// Store prefix for allocation records
pub const ALLOCATION_PREFIX: &str = "/ipallocator/";

/// IP address pool for a network
///
/// The gateway (first usable address) is always reserved and never handed
/// out. Network and broadcast addresses are excluded by `Ipv4Net::hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpPool {
    /// Network subnet
    subnet: Ipv4Net,
    /// Set of allocated addresses
    allocated: BTreeSet<Ipv4Addr>,
}

impl IpPool {
    /// Create a new, empty IP pool from a subnet
    pub fn new(subnet: Ipv4Net) -> Result<Self> {
        first_usable(&subnet)?;
        Ok(Self {
            subnet: subnet.trunc(),
            allocated: BTreeSet::new(),
        })
    }

    /// Gateway address reserved for the bridge
    pub fn gateway(&self) -> Result<Ipv4Addr> {
        first_usable(&self.subnet)
    }

    /// Allocate the lowest free address
    pub fn allocate(&mut self) -> Option<Ipv4Addr> {
        let gateway = self.gateway().ok();
        let free = self
            .subnet
            .hosts()
            .find(|addr| Some(*addr) != gateway && !self.allocated.contains(addr))?;
        self.allocated.insert(free);
        Some(free)
    }

    /// Allocate a specific address, returning false if it is taken or out of range
    pub fn allocate_specific(&mut self, addr: Ipv4Addr) -> bool {
        if !self.is_available(&addr) {
            return false;
        }
        self.allocated.insert(addr)
    }

    /// Release an allocated address; unknown addresses are ignored
    pub fn release(&mut self, addr: &Ipv4Addr) {
        self.allocated.remove(addr);
    }

    /// Whether `addr` could be handed out right now
    pub fn is_available(&self, addr: &Ipv4Addr) -> bool {
        let usable = self.subnet.hosts().any(|h| h == *addr);
        usable && Some(*addr) != self.gateway().ok() && !self.allocated.contains(addr)
    }

    pub fn prefix_len(&self) -> u8 {
        self.subnet.prefix_len()
    }

    #[cfg(test)]
    pub fn allocated_count(&self) -> usize {
        self.allocated.len()
    }
}

fn first_usable(subnet: &Ipv4Net) -> Result<Ipv4Addr> {
    subnet
        .hosts()
        .next()
        .ok_or_else(|| Error::InvalidCidr(format!("{} is too small for a gateway", subnet)))
}

/// Gateway of a range in CIDR form: `192.168.1.0/24` gives `192.168.1.1/24`
pub fn default_gateway(cidr: &str) -> Result<String> {
    let net: Ipv4Net = cidr
        .parse()
        .map_err(|_| Error::InvalidCidr(cidr.to_string()))?;
    let gateway = first_usable(&net.trunc())?;
    Ok(format!("{}/{}", gateway, net.prefix_len()))
}

/// Deterministic locally-administered MAC for an endpoint address
pub fn mac_from_ipv4(ip: Ipv4Addr) -> String {
    let [a, b, c, d] = ip.octets();
    format!("02:42:{:02x}:{:02x}:{:02x}:{:02x}", a, b, c, d)
}

/// Persisted allocator for one network
///
/// Every allocate/release is a single read-modify-write on the store, so
/// concurrent callers (threads, tasks or processes sharing the store) are
/// serialised and never receive the same address.
#[derive(Clone)]
pub struct IpAllocator {
    store: Arc<dyn Store>,
    network_id: String,
    range: Ipv4Net,
}

impl IpAllocator {
    /// Create an allocator for a network's range
    pub fn new(store: Arc<dyn Store>, network_id: &str, range: Ipv4Net) -> Self {
        Self {
            store,
            network_id: network_id.to_string(),
            range,
        }
    }

    fn key(&self) -> String {
        format!("{}{}", ALLOCATION_PREFIX, self.network_id)
    }

    fn load_pool(&self, stored: Option<&serde_json::Value>) -> Result<IpPool> {
        let mut pool = IpPool::new(self.range)?;
        if let Some(value) = stored {
            let previous: IpPool = serde_json::from_value(value.clone())?;
            // Keep prior reservations even if the range changed since
            pool.allocated = previous.allocated;
        }
        Ok(pool)
    }

    /// Allocate an address, either the requested one or the lowest free one
    ///
    /// Returns the address and the range's prefix length.
    pub fn allocate_ip(&self, requested: Option<Ipv4Addr>) -> Result<(Ipv4Addr, u8)> {
        let mut allocated = None;

        self.store.update(&self.key(), &mut |stored| {
            let mut pool = self.load_pool(stored)?;

            let addr = match requested {
                Some(addr) => {
                    if !pool.allocate_specific(addr) {
                        return Err(Error::AddressUnavailable {
                            address: addr.to_string(),
                            network: self.network_id.clone(),
                        });
                    }
                    addr
                }
                None => pool
                    .allocate()
                    .ok_or_else(|| Error::RangeExhausted(self.network_id.clone()))?,
            };

            allocated = Some(addr);
            Ok(serde_json::to_value(&pool)?)
        })?;

        let addr = allocated.ok_or_else(|| Error::Store("allocation not recorded".into()))?;
        debug!(network_id = %self.network_id, %addr, "allocated address");
        Ok((addr, self.range.prefix_len()))
    }

    /// Release an address; releasing a free address is a no-op
    pub fn release_ip(&self, addr: Ipv4Addr) -> Result<()> {
        self.store
            .transact(true, &mut |doc| self.release_in(doc, addr))?;
        debug!(network_id = %self.network_id, %addr, "released address");
        Ok(())
    }

    /// Release an address inside a transaction the caller already runs
    pub fn release_in(&self, doc: &mut Document, addr: Ipv4Addr) -> Result<()> {
        let key = self.key();
        let mut pool = self.load_pool(doc.get(&key))?;
        pool.release(&addr);
        doc.insert(key, serde_json::to_value(&pool)?);
        Ok(())
    }

    /// Currently allocated addresses
    pub fn allocated(&self) -> Result<Vec<Ipv4Addr>> {
        let stored = self.store.get(&self.key())?;
        let pool = self.load_pool(stored.as_ref())?;
        Ok(pool.allocated.into_iter().collect())
    }
}
