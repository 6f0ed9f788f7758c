//! Key-value persistence for networks, endpoints and allocations
//!
//! Provides:
//! - `Store` trait with atomic multi-key writes and read-modify-write
//! - `FileStore` backed by one JSON document guarded by flock(2)
//! - `MemoryStore` for tests and ephemeral agents

use crate::error::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Whole store contents, keyed by path-like strings
pub type Document = BTreeMap<String, Value>;

/// A key-value store where every operation runs as one transaction
pub trait Store: Send + Sync {
    /// Run `f` against the document. When `write` is set and `f` succeeds,
    /// the mutated document is persisted; on error nothing is written.
    fn transact(&self, write: bool, f: &mut dyn FnMut(&mut Document) -> Result<()>) -> Result<()>;

    fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut out = None;
        self.transact(false, &mut |doc| {
            out = doc.get(key).cloned();
            Ok(())
        })?;
        Ok(out)
    }

    fn set(&self, key: &str, value: Value) -> Result<()> {
        self.set_many(vec![(key.to_string(), value)])
    }

    /// Write several keys atomically: either all land or none do
    fn set_many(&self, entries: Vec<(String, Value)>) -> Result<()> {
        self.transact(true, &mut |doc| {
            for (key, value) in &entries {
                doc.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn delete_many(&self, keys: &[String]) -> Result<()> {
        self.transact(true, &mut |doc| {
            for key in keys {
                doc.remove(key);
            }
            Ok(())
        })
    }

    /// All entries whose key starts with `prefix`, in key order
    fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>> {
        let mut out = Vec::new();
        self.transact(false, &mut |doc| {
            out = doc
                .range(prefix.to_string()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Ok(())
        })?;
        Ok(out)
    }

    /// Atomic read-modify-write of a single key
    fn update(
        &self,
        key: &str,
        f: &mut dyn FnMut(Option<&Value>) -> Result<Value>,
    ) -> Result<Value> {
        let mut out = Value::Null;
        self.transact(true, &mut |doc| {
            let next = f(doc.get(key))?;
            doc.insert(key.to_string(), next.clone());
            out = next;
            Ok(())
        })?;
        Ok(out)
    }
}

/// Decode a stored value into a typed record
pub fn load<T: DeserializeOwned>(store: &dyn Store, key: &str) -> Result<Option<T>> {
    store
        .get(key)?
        .map(serde_json::from_value::<T>)
        .transpose()
        .map_err(Error::from)
}

/// Decode every record under a prefix
pub fn load_all<T: DeserializeOwned>(store: &dyn Store, prefix: &str) -> Result<Vec<T>> {
    store
        .list(prefix)?
        .into_iter()
        .map(|(_, v)| serde_json::from_value::<T>(v).map_err(Error::from))
        .collect()
}

/// Encode a typed record for storage
pub fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(Error::from)
}

/// Run a store operation on the blocking pool
///
/// `FileStore` transactions wait on flock(2) and fsync, so async callers
/// never run them on a runtime worker.
pub async fn blocking<T, F>(store: &Arc<dyn Store>, op: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce(&dyn Store) -> Result<T> + Send + 'static,
{
    let store = Arc::clone(store);
    tokio::task::spawn_blocking(move || op(&*store)).await?
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryStore {
    doc: Mutex<Document>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Store for MemoryStore {
    fn transact(&self, write: bool, f: &mut dyn FnMut(&mut Document) -> Result<()>) -> Result<()> {
        let mut doc = self
            .doc
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))?;

        if write {
            // Work on a copy so a failing closure leaves no partial write
            let mut scratch = doc.clone();
            f(&mut scratch)?;
            *doc = scratch;
            Ok(())
        } else {
            let mut scratch = doc.clone();
            f(&mut scratch)
        }
    }
}

/// Store persisted as a single JSON file
///
/// Every transaction holds an exclusive flock on `<file>.lock`, so the agent
/// and CLI invocations against the same state file never interleave.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    guard: Mutex<()>,
}

impl FileStore {
    /// Open (or lazily create) a file store
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Store(format!("Failed to create {}: {}", parent.display(), e))
            })?;
        }

        let mut lock_path = path.as_os_str().to_owned();
        lock_path.push(".lock");

        Ok(Self {
            path: path.to_path_buf(),
            lock_path: PathBuf::from(lock_path),
            guard: Mutex::new(()),
        })
    }

    fn read_document(&self) -> Result<Document> {
        match fs::read(&self.path) {
            Ok(bytes) if bytes.is_empty() => Ok(Document::new()),
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                Error::Store(format!("Corrupt store {}: {}", self.path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Document::new()),
            Err(e) => Err(Error::Store(format!(
                "Failed to read {}: {}",
                self.path.display(),
                e
            ))),
        }
    }

    fn write_document(&self, doc: &Document) -> Result<()> {
        let mut tmp_path = self.path.as_os_str().to_owned();
        tmp_path.push(".tmp");
        let tmp_path = PathBuf::from(tmp_path);

        let bytes = serde_json::to_vec_pretty(doc)?;
        let mut file = File::create(&tmp_path).map_err(|e| {
            Error::Store(format!("Failed to create {}: {}", tmp_path.display(), e))
        })?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            Error::Store(format!(
                "Failed to replace {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl Store for FileStore {
    fn transact(&self, write: bool, f: &mut dyn FnMut(&mut Document) -> Result<()>) -> Result<()> {
        let _local = self
            .guard
            .lock()
            .map_err(|_| Error::Store("file store lock poisoned".into()))?;

        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| {
                Error::Store(format!(
                    "Failed to open lock {}: {}",
                    self.lock_path.display(),
                    e
                ))
            })?;

        // Released when dropped at the end of the transaction
        let _flock = Flock::lock(lock_file, FlockArg::LockExclusive).map_err(|(_, errno)| {
            Error::Store(format!(
                "Failed to lock {}: {}",
                self.lock_path.display(),
                errno
            ))
        })?;

        let mut doc = self.read_document()?;
        f(&mut doc)?;

        if write {
            self.write_document(&doc)?;
        }

        Ok(())
    }
}
