//! Flat, capacity-limited key-value store and the fallback backend built on it.
//!
//! `FlatStore` has string keys and string values with a byte capacity, the
//! same shape as browser local storage. It persists as a single JSON object
//! that is rewritten on every change. Legacy records live here too, under
//! their original flat keys.
//!
//! `FlatBackend` implements the collection contract on top of it by
//! namespacing keys as `"<collection>/<kind>:<key>"`, where the kind is `n`
//! for numeric keys and `s` for text keys. It has no secondary index, so
//! `get_unsynced` scans.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::debug;
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKey};
use super::schema::CollectionSpec;
use super::traits::{Backend, BackendKind};
use crate::error::{OffsyncError, Result};

/// Default capacity, matching the usual local storage quota.
pub const DEFAULT_FLAT_CAPACITY: usize = 5 * 1024 * 1024;

/// Prefix of bookkeeping slots that belong to no collection.
pub(crate) const META_PREFIX: &str = "__meta__/";

/// String key-value store with a byte capacity.
pub struct FlatStore {
    path: Option<PathBuf>,
    capacity: usize,
    items: Mutex<BTreeMap<String, String>>,
}

impl std::fmt::Debug for FlatStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlatStore")
            .field("path", &self.path)
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl FlatStore {
    /// Open (or create) a file-backed store.
    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let items = if path.exists() {
            let content = fs::read_to_string(&path)?;
            if content.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&content)?
            }
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            capacity,
            items: Mutex::new(items),
        })
    }

    /// A store that lives only as long as the process.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity,
            items: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently used (keys plus values).
    pub fn used_bytes(&self) -> Result<usize> {
        let items = self.lock()?;
        Ok(Self::size_of(&items))
    }

    pub fn get_item(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lock()?.get(key).cloned())
    }

    pub fn set_item(&self, key: &str, value: &str) -> Result<()> {
        self.update(|items| {
            items.insert(key.to_string(), value.to_string());
            Ok(())
        })
    }

    pub fn remove_item(&self, key: &str) -> Result<bool> {
        self.update(|items| Ok(items.remove(key).is_some()))
    }

    /// All entries whose key starts with `prefix`, in key order.
    pub fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let items = self.lock()?;
        Ok(items
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    /// Apply a batch of changes atomically.
    ///
    /// The closure works on a copy; if it fails or the result exceeds the
    /// capacity, nothing changes.
    pub fn update<T>(&self, f: impl FnOnce(&mut BTreeMap<String, String>) -> Result<T>) -> Result<T> {
        let mut items = self.lock()?;
        let mut draft = items.clone();
        let out = f(&mut draft)?;

        let size = Self::size_of(&draft);
        if size > self.capacity {
            return Err(OffsyncError::QuotaExceeded(format!(
                "flat store would hold {} bytes, capacity is {}",
                size, self.capacity
            )));
        }

        if let Some(path) = &self.path {
            Self::persist(path, &draft)?;
        }
        *items = draft;
        Ok(out)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, String>>> {
        self.items.lock().map_err(|e| OffsyncError::Storage(e.to_string()))
    }

    fn size_of(items: &BTreeMap<String, String>) -> usize {
        items.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    /// Write to a sibling temp file, then rename over the original.
    fn persist(path: &Path, items: &BTreeMap<String, String>) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(items)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// A record as stored in the flat store, with its insertion sequence.
#[derive(Debug, Serialize, Deserialize)]
struct FlatEntry {
    seq: u64,
    record: Record,
}

/// Collection contract over a `FlatStore`.
pub struct FlatBackend {
    store: Arc<FlatStore>,
}

impl FlatBackend {
    pub fn new(store: Arc<FlatStore>) -> Self {
        Self { store }
    }

    fn record_key(collection: &str, key: &RecordKey) -> String {
        format!("{}/{}", collection, key.storage_key())
    }

    fn next_key_slot(collection: &str) -> String {
        format!("{}{}/next_key", META_PREFIX, collection)
    }

    fn next_seq_slot(collection: &str) -> String {
        format!("{}{}/next_seq", META_PREFIX, collection)
    }

    fn read_counter(items: &BTreeMap<String, String>, slot: &str) -> Result<i64> {
        match items.get(slot) {
            Some(v) => v
                .parse()
                .map_err(|_| OffsyncError::Storage(format!("corrupt counter at {}", slot))),
            None => Ok(1),
        }
    }

    /// Entries of one collection sorted by insertion sequence.
    fn entries(&self, collection: &str) -> Result<Vec<(String, FlatEntry)>> {
        let prefix = format!("{}/", collection);
        let mut entries = Vec::new();
        for (k, v) in self.store.entries_with_prefix(&prefix)? {
            let entry: FlatEntry = serde_json::from_str(&v)?;
            entries.push((k, entry));
        }
        entries.sort_by_key(|(_, e)| e.seq);
        Ok(entries)
    }
}

impl Backend for FlatBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Fallback
    }

    fn put(&self, spec: &CollectionSpec, key: Option<RecordKey>, mut record: Record) -> Result<RecordKey> {
        self.store.update(|items| {
            let key_slot = Self::next_key_slot(&spec.name);
            let next_key = Self::read_counter(items, &key_slot)?;

            let key = match key {
                Some(key) => {
                    if let Some(n) = key.as_auto() {
                        if n >= next_key {
                            items.insert(key_slot, (n + 1).to_string());
                        }
                    }
                    key
                }
                None => {
                    items.insert(key_slot, (next_key + 1).to_string());
                    RecordKey::Auto(next_key)
                }
            };

            let slot = Self::record_key(&spec.name, &key);
            let existing = match items.get(&slot) {
                Some(v) => Some(serde_json::from_str::<FlatEntry>(v)?),
                None => None,
            };

            let seq = match &existing {
                Some(entry) => entry.seq,
                None => {
                    let seq_slot = Self::next_seq_slot(&spec.name);
                    let seq = Self::read_counter(items, &seq_slot)?;
                    items.insert(seq_slot, (seq + 1).to_string());
                    seq as u64
                }
            };

            record.prepare_write(&spec.name, key.clone(), existing.and_then(|e| e.record.created_at));
            items.insert(slot, serde_json::to_string(&FlatEntry { seq, record })?);
            Ok(key)
        })
    }

    fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Record>> {
        match self.store.get_item(&Self::record_key(collection, key))? {
            Some(v) => {
                let entry: FlatEntry = serde_json::from_str(&v)?;
                Ok(Some(entry.record))
            }
            None => Ok(None),
        }
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        Ok(self.entries(collection)?.into_iter().map(|(_, e)| e.record).collect())
    }

    fn get_unsynced(&self, collection: &str) -> Result<Vec<Record>> {
        Ok(self
            .entries(collection)?
            .into_iter()
            .map(|(_, e)| e.record)
            .filter(|r| !r.synced)
            .collect())
    }

    fn mark_synced(
        &self,
        collection: &str,
        key: &RecordKey,
        server_id: Option<&str>,
        expected: Option<&serde_json::Value>,
    ) -> Result<bool> {
        let slot = Self::record_key(collection, key);
        self.store.update(|items| {
            let Some(v) = items.get(&slot) else {
                return Ok(false);
            };
            let mut entry: FlatEntry = serde_json::from_str(v)?;
            if !entry.record.apply_synced(server_id, expected) {
                return Ok(false);
            }
            items.insert(slot.clone(), serde_json::to_string(&entry)?);
            Ok(true)
        })
    }

    fn delete(&self, collection: &str, key: &RecordKey) -> Result<bool> {
        self.store.remove_item(&Self::record_key(collection, key))
    }

    fn clear(&self, collection: &str) -> Result<usize> {
        let prefix = format!("{}/", collection);
        let removed = self.store.update(|items| {
            let keys: Vec<String> = items.keys().filter(|k| k.starts_with(&prefix)).cloned().collect();
            for k in &keys {
                items.remove(k);
            }
            Ok(keys.len())
        })?;
        debug!("Cleared {} records from fallback collection {}", removed, collection);
        Ok(removed)
    }

    fn count(&self, collection: &str) -> Result<usize> {
        Ok(self.store.entries_with_prefix(&format!("{}/", collection))?.len())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
