//! Network records and their provisioning

use crate::error::{Error, Result};
use crate::names::NameGenerator;
use crate::network::driver::Driver;
use crate::network::ip::{ALLOCATION_PREFIX, default_gateway};
use crate::network::lock::NetworkLocks;
use crate::network::overlay;
use crate::network::types::{MAX_VNI, NETWORK_ENDPOINT_PREFIX, NETWORK_PREFIX, Network};
use crate::store::{self, Store};
use chrono::Utc;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Parameters for creating a network
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkCreate {
    pub name: String,
    /// Picked automatically when absent
    #[serde(default)]
    pub vxlan_vni: Option<u32>,
    /// Falls back to the agent's default range
    #[serde(default)]
    pub ip_range: Option<String>,
}

/// Persisted networks plus the namespace and overlay behind each
pub struct NetworkRepository<D: Driver> {
    store: Arc<dyn Store>,
    driver: Arc<D>,
    names: Arc<NameGenerator>,
    locks: Arc<NetworkLocks>,
    default_ip_range: String,
}

impl<D: Driver> NetworkRepository<D> {
    pub fn new(
        store: Arc<dyn Store>,
        driver: Arc<D>,
        names: Arc<NameGenerator>,
        default_ip_range: impl Into<String>,
    ) -> Self {
        Self {
            store,
            driver,
            names,
            locks: Arc::new(NetworkLocks::new()),
            default_ip_range: default_ip_range.into(),
        }
    }

    /// Share `locks` with other repositories and processes
    pub fn with_locks(mut self, locks: Arc<NetworkLocks>) -> Self {
        self.locks = locks;
        self
    }

    /// Locks endpoint changes must take alongside this repository
    pub fn locks(&self) -> Arc<NetworkLocks> {
        Arc::clone(&self.locks)
    }

    /// Persist a new network, then create its namespace and overlay
    ///
    /// The record is kept even when provisioning fails so a later `ensure`
    /// can finish the job.
    pub async fn create(&self, params: NetworkCreate) -> Result<Network> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err(Error::InvalidRequest("network name is required".into()));
        }

        let ip_range = params
            .ip_range
            .unwrap_or_else(|| self.default_ip_range.clone());
        let range: Ipv4Net = ip_range
            .parse()
            .map_err(|_| Error::InvalidCidr(ip_range.clone()))?;
        default_gateway(&ip_range)?;

        if let Some(vni) = params.vxlan_vni
            && (vni == 0 || vni > MAX_VNI)
        {
            return Err(Error::InvalidRequest(format!(
                "VNI {} is outside 1..={}",
                vni, MAX_VNI
            )));
        }

        let mut network = Network {
            id: self.names.id(),
            name: name.to_string(),
            vxlan_vni: 0,
            ip_range: range.trunc().to_string(),
            ns_handle_path: String::new(),
            created_at: Utc::now(),
        };

        // VNI selection and insert share one transaction so two creates
        // never end up on the same segment
        let requested = params.vxlan_vni;
        let network = store::blocking(&self.store, move |db| {
            db.transact(true, &mut |doc| {
                let used: BTreeSet<u32> = doc
                    .range(NETWORK_PREFIX.to_string()..)
                    .take_while(|(k, _)| k.starts_with(NETWORK_PREFIX))
                    .filter_map(|(_, v)| v.get("vxlan_vni").and_then(Value::as_u64))
                    .filter_map(|v| u32::try_from(v).ok())
                    .collect();

                network.vxlan_vni = match requested {
                    Some(vni) if used.contains(&vni) => {
                        return Err(Error::InvalidRequest(format!(
                            "VNI {} is already in use",
                            vni
                        )));
                    }
                    Some(vni) => vni,
                    None => (1..=MAX_VNI)
                        .find(|v| !used.contains(v))
                        .ok_or_else(|| Error::InvalidRequest("no free VNI left".into()))?,
                };

                doc.insert(network.storage_key(), store::encode(&network)?);
                Ok(())
            })?;
            Ok(network)
        })
        .await?;

        info!(
            network_id = %network.id,
            name = %network.name,
            vni = network.vxlan_vni,
            ip_range = %network.ip_range,
            "created network"
        );

        self.ensure(&network).await
    }

    pub async fn exists(&self, id: &str) -> Result<Option<Network>> {
        let key = format!("{}{}", NETWORK_PREFIX, id);
        store::blocking(&self.store, move |db| store::load(db, &key)).await
    }

    pub async fn get(&self, id: &str) -> Result<Network> {
        self.exists(id)
            .await?
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Network>> {
        store::blocking(&self.store, |db| store::load_all(db, NETWORK_PREFIX)).await
    }

    pub async fn save(&self, network: &Network) -> Result<()> {
        let key = network.storage_key();
        let value = store::encode(network)?;
        store::blocking(&self.store, move |db| db.set(&key, value)).await
    }

    /// Create the namespace if needed and converge its overlay
    ///
    /// Calls for the same network are serialised; different networks run
    /// independently. The stored record is reloaded once the lock is held,
    /// so a network deleted in the meantime is never provisioned again.
    /// Returns the record with its namespace path filled in.
    pub async fn ensure(&self, network: &Network) -> Result<Network> {
        let _guard = self.locks.acquire(&network.id).await?;
        let mut network = self.exists(&network.id).await?.ok_or_else(|| {
            debug!(network_id = %network.id, "network deleted before ensure");
            Error::NetworkNotFound(network.id.clone())
        })?;

        let handle = self.driver.create_namespace(&network.id).await?;
        let handle_path = handle.path.to_string_lossy().into_owned();

        if network.ns_handle_path != handle_path {
            network.ns_handle_path = handle_path;
            self.save(&network).await?;
        }

        let host = self.driver.host().await?;
        let netns = self
            .driver
            .namespace(&handle.path)
            .await
            .map_err(|e| Error::Namespace {
                network: network.id.clone(),
                message: e.to_string(),
            })?;

        overlay::ensure(&host, &netns, &network, &self.names).await?;
        Ok(network)
    }

    /// Remove a network with no endpoints left, together with its namespace
    ///
    /// The endpoint check runs under the network lock, which endpoint
    /// creation takes as well.
    pub async fn delete(&self, id: &str) -> Result<Network> {
        let guard = self.locks.acquire(id).await?;
        let network = self.get(id).await?;

        let prefix = format!("{}{}/", NETWORK_ENDPOINT_PREFIX, id);
        let endpoints = store::blocking(&self.store, move |db| db.list(&prefix)).await?;
        if !endpoints.is_empty() {
            return Err(Error::InvalidRequest(format!(
                "network '{}' still has {} endpoint(s)",
                id,
                endpoints.len()
            )));
        }

        if network.is_provisioned() {
            self.driver
                .remove_namespace(Path::new(&network.ns_handle_path))
                .await?;
        }

        let keys = [network.storage_key(), format!("{}{}", ALLOCATION_PREFIX, id)];
        store::blocking(&self.store, move |db| db.delete_many(&keys)).await?;

        drop(guard);
        self.locks.forget(id);

        info!(network_id = id, "deleted network");
        Ok(network)
    }

    /// Run `ensure` for every stored network, returning the failures
    pub async fn ensure_all(&self) -> Result<Vec<(String, Error)>> {
        let mut failures = Vec::new();
        for network in self.list().await? {
            if let Err(e) = self.ensure(&network).await {
                warn!(network_id = %network.id, error = %e, "ensure failed");
                failures.push((network.id, e));
            }
        }
        Ok(failures)
    }
}
