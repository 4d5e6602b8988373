//! API persistence facade - the one call application code uses to persist
//!
//! `save` always writes locally first. The remote attempt that follows is
//! best effort: any remote failure turns into a queued write and a
//! `SaveOutcome::QueuedOffline` result, never an error.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::Result;
use crate::queue::{OfflineQueue, SourceRef};
use crate::remote::{Remote, fetch_with_timeout, save_with_timeout};
use crate::store::{LocalStore, Record, RecordKey};
use crate::sync::NetworkMonitor;

/// Result of a `save`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SaveOutcome {
    /// The remote service acknowledged the write
    Synced {
        key: RecordKey,
        server_id: Option<String>,
        response: Value,
    },
    /// Stored locally; delivery deferred to the sync scheduler
    QueuedOffline {
        key: RecordKey,
        /// `None` if the queue write itself failed
        queue_key: Option<RecordKey>,
        reason: String,
    },
}

impl SaveOutcome {
    /// Key of the local record.
    pub fn key(&self) -> &RecordKey {
        match self {
            SaveOutcome::Synced { key, .. } => key,
            SaveOutcome::QueuedOffline { key, .. } => key,
        }
    }

    pub fn is_synced(&self) -> bool {
        matches!(self, SaveOutcome::Synced { .. })
    }

    pub fn is_queued(&self) -> bool {
        matches!(self, SaveOutcome::QueuedOffline { .. })
    }
}

/// Local-first save with deferred remote delivery.
pub struct ApiFacade {
    store: Arc<LocalStore>,
    queue: Arc<OfflineQueue>,
    remote: Arc<dyn Remote>,
    network: Arc<NetworkMonitor>,
    timeout: Duration,
}

impl std::fmt::Debug for ApiFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiFacade")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl ApiFacade {
    pub fn new(
        store: Arc<LocalStore>,
        queue: Arc<OfflineQueue>,
        remote: Arc<dyn Remote>,
        network: Arc<NetworkMonitor>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            remote,
            network,
            timeout,
        }
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Persist `payload` into `collection` and deliver it to `endpoint`.
    ///
    /// Fails only when the local write fails (quota, storage, unknown
    /// collection). Remote failures are queued.
    pub async fn save(&self, endpoint: &str, payload: Value, collection: &str) -> Result<SaveOutcome> {
        let key = match self.store.put(collection, Record::new(payload.clone())).await {
            Ok(key) => key,
            Err(e) => {
                if e.is_local_durability() {
                    warn!("Local write to {} failed, nothing was saved or sent: {}", collection, e);
                }
                return Err(e);
            }
        };
        debug!("Saved {}/{} locally", collection, key);

        if !self.network.is_online() {
            return Ok(self.defer(endpoint, payload, collection, key, "offline".to_string()).await);
        }

        match save_with_timeout(self.remote.as_ref(), endpoint, &payload, self.timeout).await {
            Ok(ack) => {
                match self
                    .store
                    .mark_synced_if(collection, &key, ack.server_id.clone(), payload)
                    .await
                {
                    Ok(true) => {}
                    Ok(false) => debug!(
                        "Remote accepted {}/{} but the record was rewritten meanwhile, leaving it unsynced",
                        collection, key
                    ),
                    Err(e) => warn!("Remote accepted {}/{} but marking it synced failed: {}", collection, key, e),
                }
                Ok(SaveOutcome::Synced {
                    key,
                    server_id: ack.server_id,
                    response: ack.body,
                })
            }
            Err(err) => Ok(self.defer(endpoint, payload, collection, key, err.to_string()).await),
        }
    }

    async fn defer(
        &self,
        endpoint: &str,
        payload: Value,
        collection: &str,
        key: RecordKey,
        reason: String,
    ) -> SaveOutcome {
        let source = SourceRef {
            collection: collection.to_string(),
            key: key.clone(),
        };

        let queue_key = match self.queue.enqueue(endpoint, payload, Some(source)).await {
            Ok(queue_key) => {
                debug!("Queued {} for {} ({})", key, endpoint, reason);
                Some(queue_key)
            }
            Err(e) => {
                warn!("Could not queue {}/{} for {}: {}", collection, key, endpoint, e);
                None
            }
        };

        SaveOutcome::QueuedOffline { key, queue_key, reason }
    }

    /// `GET /api/<endpoint>`. No local fallback.
    pub async fn get(&self, endpoint: &str) -> Result<Value> {
        Ok(fetch_with_timeout(self.remote.as_ref(), endpoint, self.timeout).await?)
    }
}
