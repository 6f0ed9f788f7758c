//! Persistent network namespaces
//!
//! A namespace is kept alive by bind-mounting its nsfs inode onto a file
//! under the namespace directory, the same layout `ip netns add` produces.
//! Creating one twice yields the existing handle.

use crate::error::{Error, Result};
use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sched::{CloneFlags, unshare};
use nix::sys::statfs::{NSFS_MAGIC, statfs};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Handle to a persistent namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamespaceHandle {
    pub path: PathBuf,
    /// False when the namespace already existed
    pub created: bool,
}

/// Creates and removes namespaces under one directory
#[derive(Debug, Clone)]
pub struct NamespaceManager {
    dir: PathBuf,
}

impl NamespaceManager {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path the namespace of `network_id` lives at
    pub fn handle_path(&self, network_id: &str) -> Result<PathBuf> {
        if network_id.is_empty() || network_id.contains('/') || network_id.starts_with('.') {
            return Err(Error::Namespace {
                network: network_id.to_string(),
                message: "invalid network id".into(),
            });
        }
        Ok(self.dir.join(network_id))
    }

    /// Create the namespace for a network, or return the existing one
    pub fn create(&self, network_id: &str) -> Result<NamespaceHandle> {
        let path = self.handle_path(network_id)?;
        let ns_err = |message: String| Error::Namespace {
            network: network_id.to_string(),
            message,
        };

        if is_namespace(&path) {
            debug!(network_id, path = %path.display(), "namespace already exists");
            return Ok(NamespaceHandle {
                path,
                created: false,
            });
        }

        fs::create_dir_all(&self.dir)
            .map_err(|e| ns_err(format!("Failed to create {}: {}", self.dir.display(), e)))?;

        // Mount target; a leftover plain file from an interrupted create is reused
        OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| ns_err(format!("Failed to create {}: {}", path.display(), e)))?;

        let target = path.clone();
        let result = std::thread::Builder::new()
            .name("netferry-netns".into())
            .spawn(move || -> nix::Result<()> {
                // Only this thread moves into the new namespace
                unshare(CloneFlags::CLONE_NEWNET)?;
                mount(
                    Some("/proc/thread-self/ns/net"),
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND,
                    None::<&str>,
                )
            })
            .map_err(|e| ns_err(format!("Failed to spawn namespace thread: {}", e)))?
            .join()
            .map_err(|_| ns_err("namespace thread panicked".into()))?;

        if let Err(errno) = result {
            let _ = fs::remove_file(&path);
            return Err(ns_err(format!("Failed to create namespace: {}", errno)));
        }

        info!(network_id, path = %path.display(), "created network namespace");
        Ok(NamespaceHandle {
            path,
            created: true,
        })
    }

    /// Unmount and delete a namespace handle; missing handles are ignored
    pub fn remove(&self, path: &Path) -> Result<()> {
        if is_namespace(path) {
            umount2(path, MntFlags::MNT_DETACH).map_err(|e| Error::Namespace {
                network: path.display().to_string(),
                message: format!("Failed to unmount: {}", e),
            })?;
        }
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Whether `path` is a mounted namespace handle
pub fn is_namespace(path: &Path) -> bool {
    statfs(path)
        .map(|stat| stat.filesystem_type() == NSFS_MAGIC)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_path_rejects_bad_ids() {
        let manager = NamespaceManager::new("/run/netferry/netns");
        assert_eq!(
            manager.handle_path("abc123").unwrap(),
            PathBuf::from("/run/netferry/netns/abc123")
        );
        assert!(manager.handle_path("").is_err());
        assert!(manager.handle_path("../etc").is_err());
        assert!(manager.handle_path("a/b").is_err());
    }

    #[test]
    fn test_plain_file_is_not_a_namespace() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plain");
        fs::write(&path, b"").unwrap();
        assert!(!is_namespace(&path));
        assert!(!is_namespace(&dir.path().join("missing")));
    }

    #[test]
    fn test_remove_missing_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NamespaceManager::new(dir.path());
        manager.remove(&dir.path().join("gone")).unwrap();
    }

    #[test]
    #[ignore] // Requires root
    fn test_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = NamespaceManager::new(dir.path());

        let first = manager.create("nftest").unwrap();
        assert!(first.created);
        assert!(is_namespace(&first.path));

        let second = manager.create("nftest").unwrap();
        assert!(!second.created);
        assert_eq!(first.path, second.path);

        manager.remove(&first.path).unwrap();
        assert!(!first.path.exists());
    }
}
