//! Persisted network and endpoint records

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Store prefix for network records
pub const NETWORK_PREFIX: &str = "/networks/";
/// Store prefix for global endpoint records
pub const ENDPOINT_PREFIX: &str = "/endpoints/";
/// Store prefix for network-scoped endpoint records
pub const NETWORK_ENDPOINT_PREFIX: &str = "/network-endpoints/";

/// Largest VNI that fits in the 24-bit VXLAN header field
pub const MAX_VNI: u32 = (1 << 24) - 1;

/// An isolated overlay network backed by one namespace
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    pub vxlan_vni: u32,
    pub ip_range: String,
    /// Handle file of the network namespace, empty until it exists
    #[serde(default)]
    pub ns_handle_path: String,
    pub created_at: DateTime<Utc>,
}

impl Network {
    pub fn storage_key(&self) -> String {
        format!("{}{}", NETWORK_PREFIX, self.id)
    }

    /// Whether the namespace has been created
    pub fn is_provisioned(&self) -> bool {
        !self.ns_handle_path.is_empty()
    }

    /// Parsed IPv4 range
    pub fn ip_net(&self) -> Result<Ipv4Net> {
        self.ip_range
            .parse()
            .map_err(|_| Error::InvalidCidr(self.ip_range.clone()))
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, vni {})", self.name, self.id, self.vxlan_vni)
    }
}

/// One host's attachment point into a network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: String,
    pub network_id: String,
    pub hostname: String,
    pub host_ip: String,
    pub created_at: DateTime<Utc>,
    /// Address in CIDR form, e.g. `10.0.0.53/24`
    pub target_veth_ip: String,
    pub target_veth_mac: String,
    #[serde(default)]
    pub active: bool,
    /// Namespace the endpoint's interface was moved into on activation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_netns_path: Option<String>,
    /// Namespace-side veth enslaved to the bridge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub veth_name: Option<String>,
}

impl Endpoint {
    pub fn storage_key(&self) -> String {
        endpoint_key(&self.id)
    }

    pub fn network_storage_key(&self) -> String {
        network_endpoint_key(&self.network_id, &self.id)
    }

    /// Address and prefix of `target_veth_ip`
    pub fn address(&self) -> Result<Ipv4Net> {
        self.target_veth_ip
            .parse()
            .map_err(|_| Error::InvalidCidr(self.target_veth_ip.clone()))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} in {})", self.id, self.target_veth_ip, self.network_id)
    }
}

pub fn endpoint_key(endpoint_id: &str) -> String {
    format!("{}{}", ENDPOINT_PREFIX, endpoint_id)
}

pub fn network_endpoint_key(network_id: &str, endpoint_id: &str) -> String {
    format!("{}{}/{}", NETWORK_ENDPOINT_PREFIX, network_id, endpoint_id)
}
