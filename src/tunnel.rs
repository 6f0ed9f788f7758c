//! Namespace-crossing TCP tunnels
//!
//! Provides:
//! - Half-close aware byte relay shared by every hop
//! - Per-request session state machine
//! - Broker that hands upgraded connections to a worker process
//! - Worker that dials inside a namespace and calls back
//! - Client that exposes a tunnel on a local listener

pub mod broker;
pub mod client;
pub mod relay;
pub mod session;
pub mod worker;

pub use broker::{ProcessLauncher, TunnelBroker, WorkerArgs};
pub use client::{TunnelClient, TunnelRequest};

/// Value of the `Upgrade` header that switches a connect request to a tunnel
pub const UPGRADE_PROTOCOL: &str = "netferry-tunnel";
