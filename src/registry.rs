//! Durable storage-key → owner mapping
//!
//! Every mutation rewrites the whole snapshot to disk before it returns, so a
//! successful reply to a client is never ahead of what is persisted.

use crate::error::RegistryError;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Separator between owner and filename inside a storage key
pub const KEY_SEPARATOR: char = '_';

/// The single place storage keys are built.
pub fn storage_key(owner: &str, filename: &str) -> String {
    format!("{owner}{KEY_SEPARATOR}{filename}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub storage_key: String,
    pub owner: String,
}

impl FileRecord {
    /// Display filename: the storage key with its `owner_` prefix removed.
    pub fn filename(&self) -> &str {
        self.storage_key
            .strip_prefix(self.owner.as_str())
            .and_then(|rest| rest.strip_prefix(KEY_SEPARATOR))
            .unwrap_or(&self.storage_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    NotFound,
}

pub struct Registry {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl Registry {
    /// Load the snapshot at `path`, or start empty if it does not exist yet.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read_to_string(&path) {
            Ok(data) if data.trim().is_empty() => BTreeMap::new(),
            Ok(data) => serde_json::from_str(&data).map_err(|source| RegistryError::Parse {
                path: path.display().to_string(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(source) => {
                return Err(RegistryError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    pub fn put(&self, key: &str, owner: &str) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), owner.to_string());
        if let Err(e) = persist(&self.path, &entries) {
            // memory must not run ahead of disk
            match previous {
                Some(p) => entries.insert(key.to_string(), p),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<Removal, RegistryError> {
        let mut entries = self.entries.lock();
        let Some(owner) = entries.remove(key) else {
            return Ok(Removal::NotFound);
        };
        if let Err(e) = persist(&self.path, &entries) {
            entries.insert(key.to_string(), owner);
            return Err(e);
        }
        Ok(Removal::Removed)
    }

    /// Consistent snapshot of every record, ordered by storage key.
    pub fn list_all(&self) -> Vec<FileRecord> {
        self.entries
            .lock()
            .iter()
            .map(|(k, o)| FileRecord {
                storage_key: k.clone(),
                owner: o.clone(),
            })
            .collect()
    }

    /// Drop every entry whose key is not in `existing_keys`. Returns the dropped keys.
    pub fn reconcile_with_storage(
        &self,
        existing_keys: &HashSet<String>,
    ) -> Result<Vec<String>, RegistryError> {
        let mut entries = self.entries.lock();
        let missing: Vec<String> = entries
            .keys()
            .filter(|k| !existing_keys.contains(*k))
            .cloned()
            .collect();
        for k in &missing {
            entries.remove(k);
        }
        persist(&self.path, &entries)?;
        Ok(missing)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Run `f` against the registry on the blocking pool. Mutations fsync the
/// snapshot, which must not stall the runtime threads serving other sockets.
pub async fn run_blocking<T, F>(registry: &Arc<Registry>, f: F) -> Result<T, RegistryError>
where
    F: FnOnce(&Registry) -> Result<T, RegistryError> + Send + 'static,
    T: Send + 'static,
{
    let registry = Arc::clone(registry);
    tokio::task::spawn_blocking(move || f(&registry))
        .await
        .map_err(|e| RegistryError::Persist(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

/// File names present directly in `dir`, used as the set of existing storage keys.
pub fn scan_storage(dir: &Path) -> std::io::Result<HashSet<String>> {
    let mut keys = HashSet::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            keys.insert(entry.file_name().to_string_lossy().to_string());
        }
    }
    Ok(keys)
}

// atomic write
fn persist(path: &Path, entries: &BTreeMap<String, String>) -> Result<(), RegistryError> {
    let data = serde_json::to_vec_pretty(entries)?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&dir).map_err(RegistryError::Persist)?;
    let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(RegistryError::Persist)?;
    tmp.write_all(&data).map_err(RegistryError::Persist)?;
    tmp.as_file().sync_all().map_err(RegistryError::Persist)?;
    tmp.persist(path).map_err(|e| RegistryError::Persist(e.error))?;
    Ok(())
}
