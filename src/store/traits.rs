//! Backend trait shared by the structured and fallback stores.

use super::record::{Record, RecordKey};
use super::schema::CollectionSpec;
use crate::error::Result;

/// Which backend a `LocalStore` ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Indexed SQLite store
    Structured,
    /// Capacity-limited flat key-value store
    Fallback,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Structured => "structured",
            BackendKind::Fallback => "fallback",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Collection-scoped storage contract.
///
/// Implementations are synchronous; `LocalStore` runs them on the blocking
/// pool. Callers have already checked the collection against the schema.
pub trait Backend: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Insert or overwrite. `key` of `None` asks the backend to assign the
    /// next surrogate for the collection.
    fn put(&self, spec: &CollectionSpec, key: Option<RecordKey>, record: Record) -> Result<RecordKey>;

    /// Get a record by key.
    fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Record>>;

    /// All records in first-insertion order.
    fn get_all(&self, collection: &str) -> Result<Vec<Record>>;

    /// Records with `synced == false`, in first-insertion order.
    fn get_unsynced(&self, collection: &str) -> Result<Vec<Record>>;

    /// Mark a record synced. Returns false if it is missing, already synced,
    /// or `expected` is given and the stored payload differs from it.
    fn mark_synced(
        &self,
        collection: &str,
        key: &RecordKey,
        server_id: Option<&str>,
        expected: Option<&serde_json::Value>,
    ) -> Result<bool>;

    /// Delete a record. Returns false if it did not exist.
    fn delete(&self, collection: &str, key: &RecordKey) -> Result<bool>;

    /// Remove every record of a collection, returning how many were removed.
    fn clear(&self, collection: &str) -> Result<usize>;

    /// Number of records in a collection.
    fn count(&self, collection: &str) -> Result<usize>;

    /// Release underlying resources. Further calls fail.
    fn close(&self) -> Result<()>;
}
