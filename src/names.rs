//! Random names for records, devices and sockets

use rand::rngs::{StdRng, SysRng};
use rand::{RngExt, SeedableRng};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Host-side prefix of a VXLAN device before it is moved into its namespace
pub const VXLAN_HOST_PREFIX: &str = "vxlan-";

/// Source of random identifiers
///
/// Owns its generator so tests can seed it.
#[derive(Debug)]
pub struct NameGenerator {
    rng: Mutex<StdRng>,
}

impl Default for NameGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl NameGenerator {
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::try_from_rng(&mut SysRng).expect("failed to seed from OS RNG")),
        }
    }

    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn with_rng<T>(&self, f: impl FnOnce(&mut StdRng) -> T) -> T {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut rng)
    }

    fn hex(&self, bytes: usize) -> String {
        let mut buf = vec![0u8; bytes];
        self.with_rng(|rng| rng.fill(buf.as_mut_slice()));
        hex::encode(buf)
    }

    /// Record identifier: 32 hex characters
    pub fn id(&self) -> String {
        self.hex(16)
    }

    /// Temporary host-side VXLAN name, e.g. `vxlan-04217`
    pub fn vxlan_host_name(&self) -> String {
        let n = self.with_rng(|rng| rng.random_range(0..100_000u32));
        format!("{}{:05}", VXLAN_HOST_PREFIX, n)
    }

    /// Names for a veth pair; both fit the 15 byte interface name limit
    pub fn veth_pair(&self) -> (String, String) {
        let suffix = self.hex(4);
        (format!("nfv{}", suffix), format!("nfp{}", suffix))
    }

    /// Fresh rendezvous socket path under `dir`
    pub fn rendezvous_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!("netferry-connect-{}.sock", self.hex(8)))
    }
}
