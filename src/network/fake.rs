//! In-memory kernel for provisioning tests
//!
//! A `FakeNetlink` is one namespace inside a shared world; links can be
//! moved between siblings of the same world, as with real namespaces.

use crate::error::{Error, Result};
use crate::network::driver::Driver;
use crate::network::namespace::NamespaceHandle;
use crate::network::netlink::{Link, LinkKind, Netlink, VxlanSpec};
use ipnet::Ipv4Net;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// A mutating call made against a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    AddBridge(String),
    AddVxlan(String),
    AddVeth(String, String),
    AddAddress(String, Ipv4Net),
    SetMtu(String, u32),
    SetMac(String),
    MoveOut(String),
    Rename(String),
    SetController(String),
    SetUp(String),
    Delete(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub link: Link,
    pub up: bool,
    pub mtu: u32,
    pub mac: Option<[u8; 6]>,
    pub addresses: Vec<Ipv4Net>,
    pub vxlan: Option<VxlanSpec>,
    pub peer: Option<u32>,
}

impl FakeLink {
    fn new(index: u32, name: &str, kind: LinkKind) -> Self {
        Self {
            link: Link {
                index,
                name: name.to_string(),
                kind,
                controller: None,
            },
            up: false,
            mtu: 1500,
            mac: None,
            addresses: Vec::new(),
            vxlan: None,
            peer: None,
        }
    }
}

#[derive(Debug, Default)]
struct World {
    namespaces: HashMap<usize, BTreeMap<u32, FakeLink>>,
    ops: HashMap<usize, Vec<Op>>,
    next_ns: usize,
    next_index: u32,
    fail: Option<&'static str>,
}

impl World {
    fn add_namespace(&mut self) -> usize {
        let ns = self.next_ns;
        self.next_ns += 1;
        let mut links = BTreeMap::new();
        links.insert(1, FakeLink::new(1, "lo", LinkKind::Other));
        self.namespaces.insert(ns, links);
        ns
    }

    fn alloc_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn check(&mut self, op: &'static str) -> Result<()> {
        if self.fail == Some(op) {
            self.fail = None;
            return Err(Error::Netlink(format!("{}: injected failure", op)));
        }
        Ok(())
    }

    fn links(&mut self, ns: usize) -> &mut BTreeMap<u32, FakeLink> {
        self.namespaces.entry(ns).or_default()
    }

    fn has_name(&mut self, ns: usize, name: &str) -> bool {
        self.links(ns).values().any(|l| l.link.name == name)
    }

    fn link_mut(&mut self, ns: usize, index: u32) -> Result<&mut FakeLink> {
        self.links(ns)
            .get_mut(&index)
            .ok_or_else(|| Error::Netlink(format!("No such device: index {}", index)))
    }

    fn record(&mut self, ns: usize, op: Op) {
        self.ops.entry(ns).or_default().push(op);
    }
}

/// One namespace of an in-memory kernel
#[derive(Debug, Clone)]
pub struct FakeNetlink {
    world: Arc<Mutex<World>>,
    ns: usize,
}

impl Default for FakeNetlink {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNetlink {
    /// A namespace in a fresh world
    pub fn new() -> Self {
        let mut world = World {
            next_index: 1,
            ..World::default()
        };
        let ns = world.add_namespace();
        Self {
            world: Arc::new(Mutex::new(world)),
            ns,
        }
    }

    /// A new, empty namespace in the same world
    pub fn sibling(&self) -> Self {
        let ns = self.lock().add_namespace();
        Self {
            world: Arc::clone(&self.world),
            ns,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub fn link(&self, name: &str) -> Option<FakeLink> {
        self.lock()
            .links(self.ns)
            .values()
            .find(|l| l.link.name == name)
            .cloned()
    }

    pub fn link_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .lock()
            .links(self.ns)
            .values()
            .map(|l| l.link.name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn snapshot(&self) -> Vec<FakeLink> {
        self.lock().links(self.ns).values().cloned().collect()
    }

    pub fn ops(&self) -> Vec<Op> {
        self.lock().ops.get(&self.ns).cloned().unwrap_or_default()
    }

    pub fn clear_ops(&self) {
        self.lock().ops.remove(&self.ns);
    }

    /// Delete a link behind the agent's back
    pub fn remove_link(&self, name: &str) {
        self.lock()
            .links(self.ns)
            .retain(|_, l| l.link.name != name);
    }

    pub fn clear_addresses(&self, name: &str) {
        let mut world = self.lock();
        for link in world.links(self.ns).values_mut() {
            if link.link.name == name {
                link.addresses.clear();
            }
        }
    }

    pub fn release_controller(&self, name: &str) {
        let mut world = self.lock();
        for link in world.links(self.ns).values_mut() {
            if link.link.name == name {
                link.link.controller = None;
            }
        }
    }

    /// Make the next call of `op` fail
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail = Some(op);
    }

    fn add_link(&self, op: &'static str, link_op: Op, links: Vec<FakeLink>) -> Result<()> {
        let mut world = self.lock();
        world.check(op)?;
        for link in &links {
            if world.has_name(self.ns, &link.link.name) {
                return Err(Error::Netlink(format!("File exists: {}", link.link.name)));
            }
        }
        for link in links {
            world.links(self.ns).insert(link.link.index, link);
        }
        world.record(self.ns, link_op);
        Ok(())
    }

    fn modify(
        &self,
        op: &'static str,
        index: u32,
        f: impl FnOnce(&mut FakeLink) -> Result<Op>,
    ) -> Result<()> {
        let mut world = self.lock();
        world.check(op)?;
        let link = world.link_mut(self.ns, index)?;
        let recorded = f(link)?;
        world.record(self.ns, recorded);
        Ok(())
    }
}

impl Netlink for FakeNetlink {
    async fn links(&self) -> Result<Vec<Link>> {
        let mut world = self.lock();
        world.check("links")?;
        Ok(world.links(self.ns).values().map(|l| l.link.clone()).collect())
    }

    async fn addresses(&self, index: u32) -> Result<Vec<Ipv4Net>> {
        let mut world = self.lock();
        world.check("addresses")?;
        Ok(world.link_mut(self.ns, index)?.addresses.clone())
    }

    async fn add_bridge(&self, name: &str) -> Result<()> {
        let index = self.lock().alloc_index();
        let link = FakeLink::new(index, name, LinkKind::Bridge);
        self.add_link("add_bridge", Op::AddBridge(name.into()), vec![link])
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<()> {
        let index = self.lock().alloc_index();
        let mut link = FakeLink::new(index, &spec.name, LinkKind::Vxlan);
        link.vxlan = Some(spec.clone());
        self.add_link("add_vxlan", Op::AddVxlan(spec.name.clone()), vec![link])
    }

    async fn add_veth(&self, name: &str, peer: &str) -> Result<()> {
        let (a, b) = {
            let mut world = self.lock();
            (world.alloc_index(), world.alloc_index())
        };
        let mut first = FakeLink::new(a, name, LinkKind::Veth);
        first.peer = Some(b);
        let mut second = FakeLink::new(b, peer, LinkKind::Veth);
        second.peer = Some(a);
        self.add_link(
            "add_veth",
            Op::AddVeth(name.into(), peer.into()),
            vec![first, second],
        )
    }

    async fn add_address(&self, index: u32, addr: Ipv4Net) -> Result<()> {
        self.modify("add_address", index, |link| {
            if link.addresses.contains(&addr) {
                return Err(Error::Netlink("File exists".into()));
            }
            link.addresses.push(addr);
            Ok(Op::AddAddress(link.link.name.clone(), addr))
        })
    }

    async fn set_mtu(&self, index: u32, mtu: u32) -> Result<()> {
        self.modify("set_mtu", index, |link| {
            link.mtu = mtu;
            Ok(Op::SetMtu(link.link.name.clone(), mtu))
        })
    }

    async fn set_mac(&self, index: u32, mac: [u8; 6]) -> Result<()> {
        self.modify("set_mac", index, |link| {
            link.mac = Some(mac);
            Ok(Op::SetMac(link.link.name.clone()))
        })
    }

    async fn move_to(&self, index: u32, target: &Self) -> Result<()> {
        if !Arc::ptr_eq(&self.world, &target.world) {
            return Err(Error::Netlink("target namespace is unreachable".into()));
        }
        let mut world = self.lock();
        world.check("move_to")?;
        let mut link = world
            .links(self.ns)
            .remove(&index)
            .ok_or_else(|| Error::Netlink(format!("No such device: index {}", index)))?;
        if world.has_name(target.ns, &link.link.name) {
            let name = link.link.name.clone();
            world.links(self.ns).insert(index, link);
            return Err(Error::Netlink(format!("File exists: {}", name)));
        }
        // Moving resets the device like the kernel does
        link.up = false;
        link.link.controller = None;
        link.addresses.clear();
        let name = link.link.name.clone();
        world.links(target.ns).insert(index, link);
        world.record(self.ns, Op::MoveOut(name));
        Ok(())
    }

    async fn rename(&self, index: u32, name: &str) -> Result<()> {
        let mut world = self.lock();
        world.check("rename")?;
        if world.has_name(self.ns, name) {
            return Err(Error::Netlink(format!("File exists: {}", name)));
        }
        world.link_mut(self.ns, index)?.link.name = name.to_string();
        world.record(self.ns, Op::Rename(name.into()));
        Ok(())
    }

    async fn set_controller(&self, index: u32, controller: u32) -> Result<()> {
        let mut world = self.lock();
        world.check("set_controller")?;
        let is_bridge = world
            .links(self.ns)
            .get(&controller)
            .is_some_and(|l| l.link.kind == LinkKind::Bridge);
        if !is_bridge {
            return Err(Error::Netlink(format!("No such bridge: index {}", controller)));
        }
        let link = world.link_mut(self.ns, index)?;
        link.link.controller = Some(controller);
        let name = link.link.name.clone();
        world.record(self.ns, Op::SetController(name));
        Ok(())
    }

    async fn set_up(&self, index: u32) -> Result<()> {
        self.modify("set_up", index, |link| {
            link.up = true;
            Ok(Op::SetUp(link.link.name.clone()))
        })
    }

    async fn delete_link(&self, index: u32) -> Result<()> {
        let mut world = self.lock();
        world.check("delete_link")?;
        let link = world
            .links(self.ns)
            .remove(&index)
            .ok_or_else(|| Error::Netlink(format!("No such device: index {}", index)))?;
        // Deleting one end of a veth pair destroys the other
        if let Some(peer) = link.peer {
            for links in world.namespaces.values_mut() {
                links.remove(&peer);
            }
        }
        world.record(self.ns, Op::Delete(link.link.name));
        Ok(())
    }
}

/// Driver over a `FakeNetlink` world
#[derive(Debug)]
pub struct FakeDriver {
    pub host: FakeNetlink,
    namespaces: Mutex<HashMap<PathBuf, FakeNetlink>>,
    fail_create: Mutex<bool>,
}

impl Default for FakeDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeDriver {
    pub fn new() -> Self {
        Self {
            host: FakeNetlink::new(),
            namespaces: Mutex::new(HashMap::new()),
            fail_create: Mutex::new(false),
        }
    }

    /// Register a namespace created outside the agent, e.g. a container's
    pub fn add_namespace(&self, path: &Path) -> FakeNetlink {
        let ns = self.host.sibling();
        self.namespaces
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), ns.clone());
        ns
    }

    pub fn get(&self, path: &Path) -> Option<FakeNetlink> {
        self.namespaces.lock().unwrap().get(path).cloned()
    }

    pub fn fail_namespace_creation(&self) {
        *self.fail_create.lock().unwrap() = true;
    }
}

impl Driver for FakeDriver {
    type Link = FakeNetlink;

    async fn create_namespace(&self, network_id: &str) -> Result<NamespaceHandle> {
        if std::mem::take(&mut *self.fail_create.lock().unwrap()) {
            return Err(Error::Namespace {
                network: network_id.to_string(),
                message: "Operation not permitted".into(),
            });
        }
        let path = PathBuf::from("/fake/netns").join(network_id);
        let mut namespaces = self.namespaces.lock().unwrap();
        let created = !namespaces.contains_key(&path);
        if created {
            namespaces.insert(path.clone(), self.host.sibling());
        }
        Ok(NamespaceHandle { path, created })
    }

    async fn remove_namespace(&self, path: &Path) -> Result<()> {
        self.namespaces.lock().unwrap().remove(path);
        Ok(())
    }

    async fn host(&self) -> Result<FakeNetlink> {
        Ok(self.host.clone())
    }

    async fn namespace(&self, path: &Path) -> Result<FakeNetlink> {
        self.get(path).ok_or_else(|| {
            Error::Netlink(format!("Failed to open namespace {}: not found", path.display()))
        })
    }
}
