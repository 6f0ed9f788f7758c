//! Link and address operations against one network namespace
//!
//! `Netlink` is the seam the overlay and endpoint code is written against.
//! `RouteHandle` implements it with rtnetlink sockets; a socket opened for a
//! namespace stays bound to that namespace for its whole life, so callers
//! never switch their own thread into it.

use crate::error::{Error, Result};
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use nix::sched::{CloneFlags, setns};
use std::fs::File;
use std::future::Future;
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use tokio::sync::oneshot;

/// Kind of a link as reported by the kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Bridge,
    Vxlan,
    Veth,
    Other,
}

/// A network interface inside one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: LinkKind,
    /// Index of the bridge this link is enslaved to
    pub controller: Option<u32>,
}

/// Parameters of a VXLAN device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub learning: bool,
    pub proxy: bool,
    pub l2miss: bool,
    pub l3miss: bool,
}

/// Operations on the links of a single network namespace
pub trait Netlink: Send + Sync {
    fn links(&self) -> impl Future<Output = Result<Vec<Link>>> + Send;

    /// IPv4 addresses configured on a link
    fn addresses(&self, index: u32) -> impl Future<Output = Result<Vec<Ipv4Net>>> + Send;

    fn add_bridge(&self, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn add_vxlan(&self, spec: &VxlanSpec) -> impl Future<Output = Result<()>> + Send;

    fn add_veth(&self, name: &str, peer: &str) -> impl Future<Output = Result<()>> + Send;

    fn add_address(&self, index: u32, addr: Ipv4Net) -> impl Future<Output = Result<()>> + Send;

    fn set_mtu(&self, index: u32, mtu: u32) -> impl Future<Output = Result<()>> + Send;

    fn set_mac(&self, index: u32, mac: [u8; 6]) -> impl Future<Output = Result<()>> + Send;

    /// Move a link from this namespace into `target`'s namespace
    fn move_to(&self, index: u32, target: &Self) -> impl Future<Output = Result<()>> + Send;

    fn rename(&self, index: u32, name: &str) -> impl Future<Output = Result<()>> + Send;

    fn set_controller(&self, index: u32, controller: u32)
    -> impl Future<Output = Result<()>> + Send;

    fn set_up(&self, index: u32) -> impl Future<Output = Result<()>> + Send;

    fn delete_link(&self, index: u32) -> impl Future<Output = Result<()>> + Send;

    /// Look up a link by name
    fn link_by_name(&self, name: &str) -> impl Future<Output = Result<Option<Link>>> + Send {
        async move {
            let links = self.links().await?;
            Ok(links.into_iter().find(|l| l.name == name))
        }
    }

    /// Look up a link by name, failing if it does not exist
    fn require_link(&self, name: &str) -> impl Future<Output = Result<Link>> + Send {
        async move {
            self.link_by_name(name)
                .await?
                .ok_or_else(|| Error::Netlink(format!("link '{}' not found", name)))
        }
    }
}

/// Parse `xx:xx:xx:xx:xx:xx` into raw bytes
pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let mut out = [0u8; 6];
    let parts: Vec<&str> = mac.split(':').collect();
    if parts.len() != 6 {
        return Err(Error::InvalidRequest(format!("invalid MAC address '{}'", mac)));
    }
    for (byte, part) in out.iter_mut().zip(parts) {
        *byte = u8::from_str_radix(part, 16)
            .map_err(|_| Error::InvalidRequest(format!("invalid MAC address '{}'", mac)))?;
    }
    Ok(out)
}

fn netlink_err(e: rtnetlink::Error) -> Error {
    Error::Netlink(e.to_string())
}

fn link_from_message(msg: &LinkMessage) -> Link {
    let mut name = String::new();
    let mut kind = LinkKind::Other;
    let mut controller = None;

    for attr in &msg.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = n.clone(),
            LinkAttribute::Controller(idx) if *idx != 0 => controller = Some(*idx),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(k) = info {
                        kind = match k {
                            InfoKind::Bridge => LinkKind::Bridge,
                            InfoKind::Vxlan => LinkKind::Vxlan,
                            InfoKind::Veth => LinkKind::Veth,
                            _ => LinkKind::Other,
                        };
                    }
                }
            }
            _ => {}
        }
    }

    Link {
        index: msg.header.index,
        name,
        kind,
        controller,
    }
}

/// rtnetlink-backed handle bound to one namespace
pub struct RouteHandle {
    handle: rtnetlink::Handle,
    /// Namespace file, kept open so links can be moved into it
    netns: Option<File>,
}

impl RouteHandle {
    /// Handle on the namespace the agent itself runs in
    pub fn host() -> Result<Self> {
        let (connection, handle, _) = rtnetlink::new_connection()?;
        tokio::spawn(connection);
        Ok(Self {
            handle,
            netns: None,
        })
    }

    /// Handle on the namespace behind `path`
    ///
    /// The socket is created on a short-lived dedicated thread that joins the
    /// namespace and exits right after, leaving runtime threads untouched.
    pub async fn open(path: &Path) -> Result<Self> {
        let netns = File::open(path).map_err(|e| {
            Error::Netlink(format!("Failed to open namespace {}: {}", path.display(), e))
        })?;
        let thread_ns = netns.try_clone()?;
        let runtime = tokio::runtime::Handle::current();
        let (tx, rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("netferry-nl".into())
            .spawn(move || {
                let result = setns(&thread_ns, CloneFlags::CLONE_NEWNET)
                    .map_err(|e| Error::Netlink(format!("setns failed: {}", e)))
                    .and_then(|_| {
                        let _guard = runtime.enter();
                        rtnetlink::new_connection().map_err(Error::from)
                    });
                let _ = tx.send(result);
            })?;

        let (connection, handle, _) = rx
            .await
            .map_err(|_| Error::Netlink("namespace thread exited early".into()))??;
        tokio::spawn(connection);

        Ok(Self {
            handle,
            netns: Some(netns),
        })
    }
}

impl Netlink for RouteHandle {
    async fn links(&self) -> Result<Vec<Link>> {
        let mut stream = self.handle.link().get().execute();
        let mut links = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(netlink_err)? {
            links.push(link_from_message(&msg));
        }
        Ok(links)
    }

    async fn addresses(&self, index: u32) -> Result<Vec<Ipv4Net>> {
        let mut stream = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut out = Vec::new();
        while let Some(msg) = stream.try_next().await.map_err(netlink_err)? {
            for attr in &msg.attributes {
                if let AddressAttribute::Address(IpAddr::V4(v4)) = attr
                    && let Ok(net) = Ipv4Net::new(*v4, msg.header.prefix_len)
                    && !out.contains(&net)
                {
                    out.push(net);
                }
            }
        }
        Ok(out)
    }

    async fn add_bridge(&self, name: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<()> {
        self.handle
            .link()
            .add()
            .vxlan(spec.name.clone(), spec.vni)
            .port(spec.port)
            .learning(spec.learning)
            .proxy(spec.proxy)
            .l2miss(spec.l2miss)
            .l3miss(spec.l3miss)
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn add_address(&self, index: u32, addr: Ipv4Net) -> Result<()> {
        self.handle
            .address()
            .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn set_mac(&self, index: u32, mac: [u8; 6]) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .address(mac.to_vec())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn move_to(&self, index: u32, target: &Self) -> Result<()> {
        let fd = target
            .netns
            .as_ref()
            .ok_or_else(|| Error::Netlink("target handle has no namespace file".into()))?
            .as_raw_fd();
        self.handle
            .link()
            .set(index)
            .setns_by_fd(fd)
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn rename(&self, index: u32, name: &str) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn set_controller(&self, index: u32, controller: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .controller(controller)
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(netlink_err)
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(netlink_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("02:42:0a:00:00:35").unwrap(),
            [0x02, 0x42, 0x0a, 0x00, 0x00, 0x35]
        );
        assert!(parse_mac("02:42:0a:00:00").is_err());
        assert!(parse_mac("02:42:0a:00:00:zz").is_err());
    }

    #[tokio::test]
    #[ignore] // Requires CAP_NET_ADMIN
    async fn test_host_handle_lists_loopback() {
        let host = RouteHandle::host().unwrap();
        let lo = host.link_by_name("lo").await.unwrap();
        assert!(lo.is_some());
    }
}
