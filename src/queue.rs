//! Offline queue - remote writes waiting for connectivity
//!
//! Each entry is a record in the `offline_queue` collection whose payload is a
//! serialized `QueueEntry`. Entries leave the queue only after the remote
//! service acknowledged them. The queue is bounded; when full, the oldest
//! entries are evicted first.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::store::{LocalStore, OFFLINE_QUEUE, Record, RecordKey};

/// Default maximum number of queued entries
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

/// The local record a queued write came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRef {
    pub collection: String,
    pub key: RecordKey,
}

/// A deferred remote write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Remote operation name (`/api/<endpoint>`)
    pub endpoint: String,

    /// The original save payload
    pub data: Value,

    /// Most recent delivery failure
    #[serde(default)]
    pub last_error: Option<String>,

    /// Failed delivery attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Earliest time (ms since epoch) a timer drain should retry
    #[serde(default)]
    pub next_attempt_at: Option<i64>,

    /// Local record to mark synced once delivered
    #[serde(default)]
    pub source: Option<SourceRef>,
}

impl QueueEntry {
    pub fn new(endpoint: impl Into<String>, data: Value, source: Option<SourceRef>) -> Self {
        Self {
            endpoint: endpoint.into(),
            data,
            last_error: None,
            attempts: 0,
            next_attempt_at: None,
            source,
        }
    }

    /// Whether a timer drain at `now_ms` should try this entry.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.next_attempt_at.map(|at| at <= now_ms).unwrap_or(true)
    }
}

/// A queue entry together with its key in the `offline_queue` collection.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedEntry {
    pub key: RecordKey,
    pub entry: QueueEntry,
    pub enqueued_at: Option<String>,
}

/// Bounded queue of deferred remote writes.
#[derive(Debug)]
pub struct OfflineQueue {
    store: Arc<LocalStore>,
    capacity: usize,
    evicted: AtomicU64,
}

impl OfflineQueue {
    pub fn new(store: Arc<LocalStore>, capacity: usize) -> Self {
        Self {
            store,
            capacity: capacity.max(1),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total entries evicted because the queue was full.
    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::SeqCst)
    }

    /// Append a write. Evicts the oldest entries if the queue overflows.
    pub async fn enqueue(&self, endpoint: &str, data: Value, source: Option<SourceRef>) -> Result<RecordKey> {
        let entry = QueueEntry::new(endpoint, data, source);
        let key = self
            .store
            .put(OFFLINE_QUEUE, Record::new(serde_json::to_value(&entry)?))
            .await?;

        let len = self.store.count(OFFLINE_QUEUE).await?;
        if len > self.capacity {
            self.evict_oldest(len - self.capacity, &key).await?;
        }

        Ok(key)
    }

    async fn evict_oldest(&self, excess: usize, keep: &RecordKey) -> Result<()> {
        let oldest: Vec<Record> = self
            .store
            .get_all(OFFLINE_QUEUE)
            .await?
            .into_iter()
            .filter(|r| r.key.as_ref() != Some(keep))
            .take(excess)
            .collect();

        for record in oldest {
            if let Some(key) = record.key {
                self.store.delete(OFFLINE_QUEUE, &key).await?;
                self.evicted.fetch_add(1, Ordering::SeqCst);
                let endpoint = record.payload.get("endpoint").and_then(Value::as_str).unwrap_or("?");
                warn!(
                    "Offline queue full ({} entries), evicted oldest entry {} for endpoint {}",
                    self.capacity, key, endpoint
                );
            }
        }
        Ok(())
    }

    /// Undelivered entries in enqueue order. Unreadable entries are skipped.
    pub async fn pending(&self) -> Result<Vec<QueuedEntry>> {
        let records = self.store.get_unsynced(OFFLINE_QUEUE).await?;
        let mut entries = Vec::with_capacity(records.len());

        for record in records {
            let Some(key) = record.key else {
                continue;
            };
            match serde_json::from_value::<QueueEntry>(record.payload) {
                Ok(entry) => entries.push(QueuedEntry {
                    key,
                    entry,
                    enqueued_at: record.created_at,
                }),
                Err(e) => warn!("Skipping unreadable offline queue entry {}: {}", key, e),
            }
        }

        Ok(entries)
    }

    /// Record a failed delivery and when to try next.
    pub async fn record_failure(&self, key: &RecordKey, error: &str, next_attempt_at: Option<i64>) -> Result<()> {
        let Some(record) = self.store.get(OFFLINE_QUEUE, key).await? else {
            return Ok(());
        };

        let mut entry: QueueEntry = serde_json::from_value(record.payload)?;
        entry.attempts += 1;
        entry.last_error = Some(error.to_string());
        entry.next_attempt_at = next_attempt_at;

        let mut updated = Record::with_key(key.clone(), serde_json::to_value(&entry)?);
        updated.created_at = record.created_at;
        self.store.put(OFFLINE_QUEUE, updated).await?;
        Ok(())
    }

    /// Remove a delivered entry.
    pub async fn remove(&self, key: &RecordKey) -> Result<bool> {
        self.store.delete(OFFLINE_QUEUE, key).await
    }

    pub async fn len(&self) -> Result<usize> {
        self.store.count(OFFLINE_QUEUE).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}
