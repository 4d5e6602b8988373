//! Local persistence for offsync.
//!
//! Records are written to a structured SQLite store with a secondary index on
//! `synced`. When that store cannot be opened, the same contract is served by
//! a capacity-limited flat key-value store:
//! - **SQLite database**: indexed, one table for all collections
//! - **Flat store**: `"<collection>/<kind>:<key>"` entries in a single JSON file
//!
//! # Example
//!
//! ```ignore
//! use offsync::store::{FlatStore, LocalStore, Record, StoreOptions};
//! use std::sync::Arc;
//!
//! let flat = Arc::new(FlatStore::open("/tmp/offsync/flat.json", 5 * 1024 * 1024)?);
//! let store = LocalStore::new(StoreOptions::structured("/tmp/offsync/offsync.db"), flat);
//!
//! let key = store.put("uploads", Record::new(serde_json::json!({"name": "a.pdf"}))).await?;
//! let pending = store.get_unsynced("uploads").await?;
//! ```

mod flat;
mod local;
mod record;
mod schema;
mod sqlite;
mod traits;

pub use flat::{DEFAULT_FLAT_CAPACITY, FlatBackend, FlatStore};
pub(crate) use flat::META_PREFIX;
pub use local::{LocalStore, StoreOptions};
pub use record::{Record, RecordKey, now_iso, now_ms};
pub use schema::{CollectionSpec, KeyMode, OFFLINE_QUEUE, SCHEMA_VERSION, Schema};
pub use sqlite::SqliteBackend;
pub use traits::{Backend, BackendKind};
