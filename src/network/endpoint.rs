//! Endpoint records and their activation
//!
//! An endpoint reserves an address in its network's range. Activating it
//! wires a veth pair: one side enslaved to the network bridge, the other
//! moved into the caller's namespace carrying the endpoint's MAC and address.

use crate::error::{Error, Result};
use crate::names::NameGenerator;
use crate::network::driver::Driver;
use crate::network::ip::{IpAllocator, mac_from_ipv4};
use crate::network::lock::NetworkLocks;
use crate::network::netlink::{Netlink, parse_mac};
use crate::network::overlay::BRIDGE_NAME;
use crate::network::types::{Endpoint, NETWORK_ENDPOINT_PREFIX, Network, network_endpoint_key};
use crate::store::{self, Store};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Parameters for creating an endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EndpointCreate {
    /// Explicit address; the lowest free one is used otherwise
    #[serde(default)]
    pub ipv4_address: Option<Ipv4Addr>,
    /// Explicit MAC; derived from the address otherwise
    #[serde(default)]
    pub mac_address: Option<String>,
    #[serde(default)]
    pub activate: bool,
    /// Namespace to place the endpoint's interface in when activating
    #[serde(default)]
    pub target_netns: Option<PathBuf>,
}

/// Endpoint records of every network
///
/// Changes take the owning network's lock, the same one network deletion
/// and provisioning take.
pub struct EndpointRepository<D: Driver> {
    store: Arc<dyn Store>,
    driver: Arc<D>,
    names: Arc<NameGenerator>,
    locks: Arc<NetworkLocks>,
    hostname: String,
    host_ip: String,
}

impl<D: Driver> EndpointRepository<D> {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<D>,
        names: Arc<NameGenerator>,
        locks: Arc<NetworkLocks>,
        hostname: impl Into<String>,
        host_ip: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            names,
            locks,
            hostname: hostname.into(),
            host_ip: host_ip.into(),
        }
    }

    fn allocator(&self, network: &Network) -> Result<IpAllocator> {
        Ok(IpAllocator::new(
            Arc::clone(&self.store),
            &network.id,
            network.ip_net()?,
        ))
    }

    /// Current record of `network`, which may have been deleted meanwhile
    async fn reload(&self, network: &Network) -> Result<Network> {
        let key = network.storage_key();
        store::blocking(&self.store, move |db| store::load::<Network>(db, &key))
            .await?
            .ok_or_else(|| Error::NetworkNotFound(network.id.clone()))
    }

    /// Both records land in one write
    async fn persist(&self, endpoint: &Endpoint) -> Result<()> {
        let value = store::encode(endpoint)?;
        let entries = vec![
            (endpoint.storage_key(), value.clone()),
            (endpoint.network_storage_key(), value),
        ];
        store::blocking(&self.store, move |db| db.set_many(entries)).await
    }

    /// Reserve an address and persist a new endpoint, activating it if asked
    pub async fn create(&self, network: &Network, params: EndpointCreate) -> Result<Endpoint> {
        if let Some(mac) = &params.mac_address {
            parse_mac(mac)?;
        }
        let target = match (params.activate, params.target_netns) {
            (true, None) => {
                return Err(Error::InvalidRequest(
                    "activation requires a target namespace".into(),
                ));
            }
            (true, target) => target,
            (false, _) => None,
        };

        let _guard = self.locks.acquire(&network.id).await?;
        let network = self.reload(network).await?;

        let allocator = self.allocator(&network)?;
        let requested = params.ipv4_address;
        let (ip, prefix) = {
            let allocator = allocator.clone();
            tokio::task::spawn_blocking(move || allocator.allocate_ip(requested)).await??
        };

        let endpoint = Endpoint {
            id: self.names.id(),
            network_id: network.id.clone(),
            hostname: self.hostname.clone(),
            host_ip: self.host_ip.clone(),
            created_at: Utc::now(),
            target_veth_ip: format!("{}/{}", ip, prefix),
            target_veth_mac: params
                .mac_address
                .map(|m| m.to_ascii_lowercase())
                .unwrap_or_else(|| mac_from_ipv4(ip)),
            active: false,
            target_netns_path: None,
            veth_name: None,
        };

        if let Err(e) = self.persist(&endpoint).await {
            let released = tokio::task::spawn_blocking(move || allocator.release_ip(ip)).await;
            if let Err(release) = released.map_err(Error::from).and_then(|r| r) {
                warn!(network_id = %network.id, %ip, error = %release, "failed to release address");
            }
            return Err(e);
        }

        info!(
            network_id = %network.id,
            endpoint_id = %endpoint.id,
            address = %endpoint.target_veth_ip,
            "created endpoint"
        );

        match target {
            Some(target) => self.wire(&network, endpoint, &target).await,
            None => Ok(endpoint),
        }
    }

    /// Look up an endpoint of a network without side effects
    pub async fn exists(&self, network: &Network, endpoint_id: &str) -> Result<Option<Endpoint>> {
        let key = network_endpoint_key(&network.id, endpoint_id);
        store::blocking(&self.store, move |db| store::load(db, &key)).await
    }

    pub async fn get(&self, network: &Network, endpoint_id: &str) -> Result<Endpoint> {
        self.exists(network, endpoint_id)
            .await?
            .ok_or_else(|| Error::EndpointNotFound(endpoint_id.to_string()))
    }

    pub async fn list(&self, network: &Network) -> Result<Vec<Endpoint>> {
        let prefix = format!("{}{}/", NETWORK_ENDPOINT_PREFIX, network.id);
        store::blocking(&self.store, move |db| store::load_all(db, &prefix)).await
    }

    /// Attach an endpoint to the bridge and hand its interface to `target_netns`
    ///
    /// Already-active endpoints whose veth still exists are returned as is.
    pub async fn activate(
        &self,
        network: &Network,
        endpoint: Endpoint,
        target_netns: &Path,
    ) -> Result<Endpoint> {
        let _guard = self.locks.acquire(&network.id).await?;
        let network = self.reload(network).await?;
        self.wire(&network, endpoint, target_netns).await
    }

    /// Activation proper; the caller holds the network lock
    async fn wire(
        &self,
        network: &Network,
        mut endpoint: Endpoint,
        target_netns: &Path,
    ) -> Result<Endpoint> {
        if !network.is_provisioned() {
            return Err(Error::Namespace {
                network: network.id.clone(),
                message: "network has no namespace yet".into(),
            });
        }

        let ns = self
            .driver
            .namespace(Path::new(&network.ns_handle_path))
            .await?;

        if endpoint.active
            && let Some(veth) = &endpoint.veth_name
            && ns.link_by_name(veth).await?.is_some()
        {
            return Ok(endpoint);
        }

        let target = self.driver.namespace(target_netns).await?;
        let mac = parse_mac(&endpoint.target_veth_mac)?;
        let address = endpoint.address()?;
        let bridge = ns
            .require_link(BRIDGE_NAME)
            .await
            .map_err(|e| Error::overlay(&network.id, "find bridge", e))?;

        let (ns_side, peer) = self.names.veth_pair();
        ns.add_veth(&ns_side, &peer)
            .await
            .map_err(|e| Error::overlay(&network.id, "create veth", e))?;

        let wired = async {
            let link = ns.require_link(&ns_side).await?;
            ns.set_controller(link.index, bridge.index).await?;
            ns.set_up(link.index).await?;

            let peer_link = ns.require_link(&peer).await?;
            ns.move_to(peer_link.index, &target).await?;

            let peer_link = target.require_link(&peer).await?;
            target.set_mac(peer_link.index, mac).await?;
            target.add_address(peer_link.index, address).await?;
            target.set_up(peer_link.index).await
        }
        .await;

        if let Err(e) = wired {
            // Deleting our side takes the peer with it
            if let Ok(Some(link)) = ns.link_by_name(&ns_side).await {
                let _ = ns.delete_link(link.index).await;
            }
            return Err(Error::overlay(&network.id, "wire endpoint", e));
        }

        endpoint.active = true;
        endpoint.veth_name = Some(ns_side);
        endpoint.target_netns_path = Some(target_netns.display().to_string());
        self.persist(&endpoint).await?;

        info!(
            network_id = %network.id,
            endpoint_id = %endpoint.id,
            target = %target_netns.display(),
            "activated endpoint"
        );
        Ok(endpoint)
    }

    /// Remove an endpoint, its interfaces and its address reservation
    ///
    /// Both records and the address go in one transaction.
    pub async fn delete(&self, network: &Network, endpoint_id: &str) -> Result<Endpoint> {
        let _guard = self.locks.acquire(&network.id).await?;
        let network = self.reload(network).await?;
        let endpoint = self.get(&network, endpoint_id).await?;

        if let Some(veth) = &endpoint.veth_name
            && network.is_provisioned()
        {
            let ns = self
                .driver
                .namespace(Path::new(&network.ns_handle_path))
                .await?;
            if let Some(link) = ns.link_by_name(veth).await? {
                ns.delete_link(link.index).await?;
            }
        }

        let allocator = self.allocator(&network)?;
        let address = endpoint.address()?.addr();
        let keys = [endpoint.storage_key(), endpoint.network_storage_key()];
        store::blocking(&self.store, move |db| {
            db.transact(true, &mut |doc| {
                for key in &keys {
                    doc.remove(key);
                }
                allocator.release_in(doc, address)
            })
        })
        .await?;

        info!(network_id = %network.id, endpoint_id, %address, "deleted endpoint");
        Ok(endpoint)
    }
}
