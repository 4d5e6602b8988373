//! `LocalStore`: the backend-agnostic, asynchronous store adapter.
//!
//! The first call to `open` (explicit or implied by any other operation)
//! tries to open the structured store. Concurrent callers share that single
//! in-flight attempt. If it fails, the adapter settles on the flat fallback
//! for the rest of its lifetime.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use log::{info, warn};
use tokio::sync::{Mutex, OnceCell};

use super::flat::{FlatBackend, FlatStore};
use super::record::{Record, RecordKey};
use super::schema::{CollectionSpec, Schema};
use super::sqlite::SqliteBackend;
use super::traits::{Backend, BackendKind};
use crate::error::{OffsyncError, Result};

/// How a `LocalStore` should be opened.
#[derive(Debug, Clone)]
pub struct StoreOptions {
    /// SQLite database path. `None` means no structured store is available
    /// in this environment.
    pub db_path: Option<PathBuf>,
    /// Optional size cap for the structured store.
    pub max_db_bytes: Option<u64>,
    pub schema: Schema,
}

impl StoreOptions {
    pub fn structured(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: Some(db_path.into()),
            max_db_bytes: None,
            schema: Schema::default(),
        }
    }

    /// Options with no structured store, so every operation uses the fallback.
    pub fn fallback_only() -> Self {
        Self {
            db_path: None,
            max_db_bytes: None,
            schema: Schema::default(),
        }
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = schema;
        self
    }

    pub fn with_max_db_bytes(mut self, bytes: u64) -> Self {
        self.max_db_bytes = Some(bytes);
        self
    }
}

/// Collection-scoped store with transparent fallback.
pub struct LocalStore {
    options: StoreOptions,
    flat: Arc<FlatStore>,
    backend: OnceCell<Arc<dyn Backend>>,
    open_attempts: AtomicUsize,
    call_order: Arc<Mutex<()>>,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("options", &self.options)
            .field("backend", &self.backend.get().map(|b| b.kind()))
            .finish_non_exhaustive()
    }
}

impl LocalStore {
    /// Create an unopened store. `flat` doubles as the fallback and as the
    /// source of legacy records.
    pub fn new(options: StoreOptions, flat: Arc<FlatStore>) -> Self {
        Self {
            options,
            flat,
            backend: OnceCell::new(),
            open_attempts: AtomicUsize::new(0),
            call_order: Arc::new(Mutex::new(())),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.options.schema
    }

    /// The flat store used for fallback and legacy data.
    pub fn flat(&self) -> &Arc<FlatStore> {
        &self.flat
    }

    /// Open the store. Idempotent and single-flight.
    pub async fn open(&self) -> BackendKind {
        self.backend().await.kind()
    }

    /// Which backend is active, if the store has been opened.
    pub fn backend_kind(&self) -> Option<BackendKind> {
        self.backend.get().map(|b| b.kind())
    }

    /// How many times the structured store open was attempted.
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    async fn backend(&self) -> Arc<dyn Backend> {
        self.backend
            .get_or_init(|| async {
                self.open_attempts.fetch_add(1, Ordering::SeqCst);
                match self.open_structured().await {
                    Ok(backend) => {
                        info!("Local store opened on structured backend");
                        backend
                    }
                    Err(e) => {
                        warn!("Structured store unavailable, using fallback store: {}", e);
                        Arc::new(FlatBackend::new(self.flat.clone())) as Arc<dyn Backend>
                    }
                }
            })
            .await
            .clone()
    }

    async fn open_structured(&self) -> Result<Arc<dyn Backend>> {
        let Some(path) = self.options.db_path.clone() else {
            return Err(OffsyncError::StoreUnavailable(
                "no structured store configured".to_string(),
            ));
        };
        let schema = self.options.schema.clone();
        let max_db_bytes = self.options.max_db_bytes;

        let backend = tokio::task::spawn_blocking(move || SqliteBackend::open(&path, &schema, max_db_bytes))
            .await
            .map_err(|e| OffsyncError::StoreUnavailable(format!("open task failed: {}", e)))??;

        Ok(Arc::new(backend))
    }

    fn spec(&self, collection: &str) -> Result<CollectionSpec> {
        self.options.schema.collection(collection).cloned()
    }

    /// Run a backend call on the blocking pool.
    ///
    /// Calls complete in the order they were issued. The turn is held by the
    /// blocking task itself, so a caller that stops waiting does not let the
    /// next call overtake a write that is still running.
    async fn run<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Backend) -> Result<T> + Send + 'static,
    {
        let backend = self.backend().await;
        let turn = self.call_order.clone().lock_owned().await;
        tokio::task::spawn_blocking(move || {
            let _turn = turn;
            f(backend.as_ref())
        })
        .await
        .map_err(|e| OffsyncError::Storage(format!("store task failed: {}", e)))?
    }

    /// Insert or overwrite a record, returning its key.
    pub async fn put(&self, collection: &str, record: Record) -> Result<RecordKey> {
        let spec = self.spec(collection)?;
        let key = spec.resolve_key(&record)?;
        self.run(move |b| b.put(&spec, key, record)).await
    }

    pub async fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Record>> {
        let collection = self.spec(collection)?.name;
        let key = key.clone();
        self.run(move |b| b.get(&collection, &key)).await
    }

    /// All records of a collection in first-insertion order.
    pub async fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        let collection = self.spec(collection)?.name;
        self.run(move |b| b.get_all(&collection)).await
    }

    /// Records still waiting for remote acknowledgement.
    pub async fn get_unsynced(&self, collection: &str) -> Result<Vec<Record>> {
        let collection = self.spec(collection)?.name;
        self.run(move |b| b.get_unsynced(&collection)).await
    }

    /// Mark a record as acknowledged by the remote service.
    ///
    /// Returns false, without error, when the record no longer exists or was
    /// already synced.
    pub async fn mark_synced(&self, collection: &str, key: &RecordKey, server_id: Option<String>) -> Result<bool> {
        let collection = self.spec(collection)?.name;
        let key = key.clone();
        self.run(move |b| b.mark_synced(&collection, &key, server_id.as_deref(), None)).await
    }

    /// Mark a record synced only if its stored payload still equals
    /// `delivered`.
    ///
    /// Returns false when the record was rewritten after `delivered` was sent,
    /// leaving the newer write unsynced.
    pub async fn mark_synced_if(
        &self,
        collection: &str,
        key: &RecordKey,
        server_id: Option<String>,
        delivered: serde_json::Value,
    ) -> Result<bool> {
        let collection = self.spec(collection)?.name;
        let key = key.clone();
        self.run(move |b| b.mark_synced(&collection, &key, server_id.as_deref(), Some(&delivered)))
            .await
    }

    pub async fn delete(&self, collection: &str, key: &RecordKey) -> Result<bool> {
        let collection = self.spec(collection)?.name;
        let key = key.clone();
        self.run(move |b| b.delete(&collection, &key)).await
    }

    pub async fn clear(&self, collection: &str) -> Result<usize> {
        let collection = self.spec(collection)?.name;
        self.run(move |b| b.clear(&collection)).await
    }

    pub async fn count(&self, collection: &str) -> Result<usize> {
        let collection = self.spec(collection)?.name;
        self.run(move |b| b.count(&collection)).await
    }

    /// Release the backend. Only meaningful once opened.
    pub async fn close(&self) -> Result<()> {
        match self.backend.get() {
            Some(backend) => {
                let backend = backend.clone();
                tokio::task::spawn_blocking(move || backend.close())
                    .await
                    .map_err(|e| OffsyncError::Storage(format!("close task failed: {}", e)))?
            }
            None => Ok(()),
        }
    }
}
