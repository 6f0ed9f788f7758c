//! Access to namespaces and their netlink handles

use crate::error::Result;
use crate::network::namespace::{NamespaceHandle, NamespaceManager};
use crate::network::netlink::{Netlink, RouteHandle};
use std::future::Future;
use std::path::Path;

/// Everything the provisioners need from the kernel
pub trait Driver: Send + Sync + 'static {
    type Link: Netlink;

    /// Create (or find) the namespace of a network
    fn create_namespace(
        &self,
        network_id: &str,
    ) -> impl Future<Output = Result<NamespaceHandle>> + Send;

    fn remove_namespace(&self, path: &Path) -> impl Future<Output = Result<()>> + Send;

    /// Handle on the agent's own namespace
    fn host(&self) -> impl Future<Output = Result<Self::Link>> + Send;

    /// Handle on the namespace at `path`
    fn namespace(&self, path: &Path) -> impl Future<Output = Result<Self::Link>> + Send;
}

/// Driver backed by real namespaces and rtnetlink
#[derive(Debug, Clone)]
pub struct LinuxDriver {
    namespaces: NamespaceManager,
}

impl LinuxDriver {
    pub fn new(namespaces: NamespaceManager) -> Self {
        Self { namespaces }
    }
}

impl Driver for LinuxDriver {
    type Link = RouteHandle;

    async fn create_namespace(&self, network_id: &str) -> Result<NamespaceHandle> {
        let manager = self.namespaces.clone();
        let network_id = network_id.to_string();
        tokio::task::spawn_blocking(move || manager.create(&network_id)).await?
    }

    async fn remove_namespace(&self, path: &Path) -> Result<()> {
        let manager = self.namespaces.clone();
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || manager.remove(&path)).await?
    }

    async fn host(&self) -> Result<RouteHandle> {
        RouteHandle::host()
    }

    async fn namespace(&self, path: &Path) -> Result<RouteHandle> {
        RouteHandle::open(path).await
    }
}
