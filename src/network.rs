//! Overlay network management
//!
//! Provides:
//! - Persistent network namespaces
//! - Netlink access to links and addresses, per namespace
//! - Idempotent bridge and VXLAN provisioning
//! - IP address allocation per network
//! - Per-network locks shared by both repositories
//! - Network and endpoint repositories

pub mod driver;
pub mod endpoint;
pub mod ip;
pub mod lock;
pub mod namespace;
pub mod netlink;
pub mod overlay;
pub mod repository;
pub mod types;

#[cfg(test)]
pub mod fake;

pub use driver::{Driver, LinuxDriver};
pub use endpoint::{EndpointCreate, EndpointRepository};
pub use lock::NetworkLocks;
pub use namespace::NamespaceManager;
pub use repository::{NetworkCreate, NetworkRepository};
pub use types::Network;
