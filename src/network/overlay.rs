//! Overlay provisioning inside a network namespace
//!
//! `ensure` converges a namespace towards:
//! - bridge `br0` carrying the network's gateway address
//! - VXLAN device `vxlan0` (VNI of the network, UDP 4789, MTU 1450) enslaved to `br0`
//! - `lo`, `br0` and `vxlan0` up
//!
//! Every step checks observed state first, so running it again on a fully or
//! partially provisioned namespace only fills in what is missing.

use crate::error::{Error, Result};
use crate::names::NameGenerator;
use crate::network::ip::default_gateway;
use crate::network::netlink::{Netlink, VxlanSpec};
use crate::network::types::Network;
use ipnet::Ipv4Net;
use tracing::{debug, info};

pub const BRIDGE_NAME: &str = "br0";
pub const VXLAN_NAME: &str = "vxlan0";
pub const LOOPBACK_NAME: &str = "lo";
pub const VXLAN_PORT: u16 = 4789;
/// 1500 minus VXLAN encapsulation overhead
pub const VXLAN_MTU: u32 = 1450;

/// Bring the overlay of `network` to its provisioned state
///
/// `host` is the agent's namespace, where the VXLAN device is created before
/// being moved into `netns`.
pub async fn ensure<N: Netlink>(
    host: &N,
    netns: &N,
    network: &Network,
    names: &NameGenerator,
) -> Result<()> {
    let id = network.id.as_str();
    let step = |name: &'static str| move |e: Error| Error::overlay(id, name, e);

    let links = netns.links().await.map_err(step("list links"))?;

    // 1. Bridge
    let bridge = match links.iter().find(|l| l.name == BRIDGE_NAME) {
        Some(bridge) => bridge.clone(),
        None => {
            netns
                .add_bridge(BRIDGE_NAME)
                .await
                .map_err(step("create bridge"))?;
            info!(network_id = id, "created bridge {}", BRIDGE_NAME);
            netns
                .require_link(BRIDGE_NAME)
                .await
                .map_err(step("create bridge"))?
        }
    };

    // 2. Gateway address
    let gateway: Ipv4Net = default_gateway(&network.ip_range)
        .map_err(step("gateway address"))?
        .parse()
        .map_err(|_| {
            Error::overlay(id, "gateway address", Error::InvalidCidr(network.ip_range.clone()))
        })?;
    let addresses = netns
        .addresses(bridge.index)
        .await
        .map_err(step("list addresses"))?;
    if !addresses.iter().any(|a| a.addr() == gateway.addr()) {
        netns
            .add_address(bridge.index, gateway)
            .await
            .map_err(step("add gateway address"))?;
        info!(network_id = id, %gateway, "added gateway address");
    }

    // 3. VXLAN device, created on the host then moved in
    if !links.iter().any(|l| l.name == VXLAN_NAME) {
        create_vxlan(host, netns, network, names).await?;
    }

    // 4. Enslave
    let vxlan = netns
        .require_link(VXLAN_NAME)
        .await
        .map_err(step("find vxlan"))?;
    if vxlan.controller != Some(bridge.index) {
        netns
            .set_controller(vxlan.index, bridge.index)
            .await
            .map_err(step("enslave vxlan"))?;
        debug!(network_id = id, "enslaved {} to {}", VXLAN_NAME, BRIDGE_NAME);
    }

    // 5. Links up, in order
    for name in [LOOPBACK_NAME, BRIDGE_NAME, VXLAN_NAME] {
        let link = netns.require_link(name).await.map_err(step("link up"))?;
        netns.set_up(link.index).await.map_err(step("link up"))?;
    }

    debug!(network_id = id, vni = network.vxlan_vni, "overlay ensured");
    Ok(())
}

async fn create_vxlan<N: Netlink>(
    host: &N,
    netns: &N,
    network: &Network,
    names: &NameGenerator,
) -> Result<()> {
    let id = network.id.as_str();
    let step = |name: &'static str| move |e: Error| Error::overlay(id, name, e);

    let spec = VxlanSpec {
        name: names.vxlan_host_name(),
        vni: network.vxlan_vni,
        port: VXLAN_PORT,
        learning: true,
        proxy: true,
        l2miss: true,
        l3miss: true,
    };

    host.add_vxlan(&spec).await.map_err(step("create vxlan"))?;
    let created = host
        .require_link(&spec.name)
        .await
        .map_err(step("create vxlan"))?;
    host.set_mtu(created.index, VXLAN_MTU)
        .await
        .map_err(step("set vxlan mtu"))?;
    host.move_to(created.index, netns)
        .await
        .map_err(step("move vxlan"))?;

    let moved = netns
        .require_link(&spec.name)
        .await
        .map_err(step("move vxlan"))?;
    netns
        .rename(moved.index, VXLAN_NAME)
        .await
        .map_err(step("rename vxlan"))?;

    info!(
        network_id = id,
        vni = network.vxlan_vni,
        "created {} (host name {})",
        VXLAN_NAME,
        spec.name
    );
    Ok(())
}
