//! Per-network mutual exclusion
//!
//! Tasks inside one process queue on an async mutex per network. When a lock
//! directory is configured, the holder also takes an exclusive flock on
//! `<dir>/<network>.lock`, which keeps the agent and CLI invocations from
//! provisioning the same network at the same time.

use crate::error::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Held while a network is being changed; dropping it unlocks
pub struct NetworkGuard {
    _file: Option<Flock<File>>,
    _local: OwnedMutexGuard<()>,
}

#[derive(Debug, Default)]
pub struct NetworkLocks {
    dir: Option<PathBuf>,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl NetworkLocks {
    /// Locks that only exclude tasks of this process
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks that also exclude other processes using the same directory
    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            locks: Mutex::default(),
        }
    }

    fn entry(&self, network_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(network_id.to_string()).or_default())
    }

    fn file_path(&self, network_id: &str) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.lock", network_id)))
    }

    /// Wait until `network_id` is free and take it
    pub async fn acquire(&self, network_id: &str) -> Result<NetworkGuard> {
        let local = self.entry(network_id).lock_owned().await;

        let file = match self.file_path(network_id) {
            Some(path) => Some(tokio::task::spawn_blocking(move || lock_file(&path)).await??),
            None => None,
        };

        Ok(NetworkGuard {
            _file: file,
            _local: local,
        })
    }

    /// Drop the bookkeeping of a deleted network
    ///
    /// Waiters that already hold the old mutex still get it; they find the
    /// record gone once they reload it.
    pub fn forget(&self, network_id: &str) {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(network_id);

        if let Some(path) = self.file_path(network_id)
            && let Err(e) = fs::remove_file(&path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            debug!(path = %path.display(), error = %e, "failed to remove lock file");
        }
    }

    #[cfg(test)]
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

fn lock_file(path: &Path) -> Result<Flock<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::Store(format!("Failed to create {}: {}", parent.display(), e))
        })?;
    }

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(path)
        .map_err(|e| Error::Store(format!("Failed to open lock {}: {}", path.display(), e)))?;

    Flock::lock(file, FlockArg::LockExclusive).map_err(|(_, errno)| {
        Error::Store(format!("Failed to lock {}: {}", path.display(), errno))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_network_waits_for_holder() {
        let locks = Arc::new(NetworkLocks::new());
        let guard = locks.acquire("net1").await.unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("net1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // Other networks are not held up
        locks.acquire("net2").await.unwrap();

        drop(guard);
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_lock_file_excludes_other_instances() {
        let dir = tempfile::tempdir().unwrap();
        // Two instances model two processes sharing the directory
        let agent = NetworkLocks::with_dir(dir.path());
        let cli = Arc::new(NetworkLocks::with_dir(dir.path()));

        let guard = agent.acquire("net1").await.unwrap();
        assert!(dir.path().join("net1.lock").exists());

        let waiter = {
            let cli = Arc::clone(&cli);
            tokio::spawn(async move { cli.acquire("net1").await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_forget_drops_entry_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let locks = NetworkLocks::with_dir(dir.path());

        drop(locks.acquire("net1").await.unwrap());
        drop(locks.acquire("net2").await.unwrap());
        assert_eq!(locks.tracked(), 2);

        locks.forget("net1");
        assert_eq!(locks.tracked(), 1);
        assert!(!dir.path().join("net1.lock").exists());
        assert!(dir.path().join("net2.lock").exists());

        // Forgetting twice is harmless
        locks.forget("net1");
    }
}
