//! Structured backend: SQLite with a secondary index on `synced`.
//!
//! All collections share one `records` table keyed by `(collection, key)`.
//! The full record is kept as JSON in `json_data`; `synced` and `created_at`
//! are duplicated into columns so they can be indexed. Surrogate key counters
//! live in the `collections` table.

use std::path::Path;
use std::sync::Mutex;

use log::{debug, info};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};

use super::record::{Record, RecordKey};
use super::schema::{CollectionSpec, KeyMode, Schema};
use super::traits::{Backend, BackendKind};
use crate::error::{OffsyncError, Result};

/// SQLite-backed structured store.
pub struct SqliteBackend {
    conn: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for SqliteBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteBackend").finish_non_exhaustive()
    }
}

impl SqliteBackend {
    /// Open or create the database at `path` and bring its schema up to date.
    ///
    /// Any failure is reported as `StoreUnavailable` so the caller can fall
    /// back to the flat store.
    pub fn open(path: &Path, schema: &Schema, max_db_bytes: Option<u64>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                OffsyncError::StoreUnavailable(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let conn = Connection::open(path)
            .map_err(|e| OffsyncError::StoreUnavailable(format!("cannot open {}: {}", path.display(), e)))?;

        Self::from_connection(conn, schema, max_db_bytes)
    }

    /// Open a throwaway in-memory database.
    pub fn open_in_memory(schema: &Schema) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| OffsyncError::StoreUnavailable(e.to_string()))?;
        Self::from_connection(conn, schema, None)
    }

    fn from_connection(conn: Connection, schema: &Schema, max_db_bytes: Option<u64>) -> Result<Self> {
        Self::init_schema(&conn, schema).map_err(|e| OffsyncError::StoreUnavailable(e.to_string()))?;

        if let Some(limit) = max_db_bytes {
            let page_size: i64 = conn
                .query_row("PRAGMA page_size", [], |row| row.get(0))
                .map_err(|e| OffsyncError::StoreUnavailable(e.to_string()))?;
            let pages = (limit as i64 / page_size.max(1)).max(1);
            conn.execute_batch(&format!("PRAGMA max_page_count = {}", pages))
                .map_err(|e| OffsyncError::StoreUnavailable(e.to_string()))?;
            debug!("Structured store capped at {} pages of {} bytes", pages, page_size);
        }

        Ok(Self {
            conn: Mutex::new(Some(conn)),
        })
    }

    /// Create tables, indexes and collection rows; refuse newer schemas.
    fn init_schema(conn: &Connection, schema: &Schema) -> Result<()> {
        let stored: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if stored > schema.version {
            return Err(OffsyncError::StoreUnavailable(format!(
                "database schema version {} is newer than supported version {}",
                stored, schema.version
            )));
        }

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS collections (
                name TEXT PRIMARY KEY,
                key_path TEXT,
                next_key INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS records (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                collection TEXT NOT NULL,
                key TEXT NOT NULL,
                synced INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                json_data TEXT NOT NULL,
                UNIQUE (collection, key)
            );

            CREATE INDEX IF NOT EXISTS idx_records_synced ON records(collection, synced);
            "#,
        )?;

        for spec in &schema.collections {
            let key_path = match &spec.key {
                KeyMode::Auto => None,
                KeyMode::Path(field) => Some(field.as_str()),
            };
            conn.execute(
                "INSERT OR IGNORE INTO collections (name, key_path) VALUES (?1, ?2)",
                params![spec.name, key_path],
            )?;
        }

        if stored == 1 {
            let rewritten = Self::encode_key_kinds(conn)?;
            debug!("Rewrote {} record keys with their kind prefix", rewritten);
        }

        if stored < schema.version {
            conn.execute_batch(&format!("PRAGMA user_version = {}", schema.version))?;
            info!("Upgraded structured store schema from v{} to v{}", stored, schema.version);
        }

        Ok(())
    }

    /// Version 1 stored bare keys, so `1` and `"1"` shared a row. Rewrite
    /// every key into its `RecordKey::storage_key` form.
    fn encode_key_kinds(conn: &Connection) -> Result<usize> {
        let tx = conn.unchecked_transaction()?;
        let rows: Vec<(i64, String)> = {
            let mut stmt = tx.prepare("SELECT id, json_data FROM records")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect::<std::result::Result<_, _>>()?
        };

        let mut rewritten = 0;
        for (id, json) in rows {
            let record: Record = serde_json::from_str(&json)?;
            if let Some(key) = record.key {
                rewritten += tx.execute(
                    "UPDATE records SET key = ?2 WHERE id = ?1",
                    params![id, key.storage_key()],
                )?;
            }
        }

        tx.commit()?;
        Ok(rewritten)
    }

    /// Run `f` with exclusive access to the connection.
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|e| OffsyncError::Storage(e.to_string()))?;
        let conn = guard
            .as_mut()
            .ok_or_else(|| OffsyncError::Storage("structured store is closed".to_string()))?;
        f(conn).map_err(map_quota)
    }

    fn query_records(conn: &Connection, sql: &str, collection: &str) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([collection], |row| {
            let json: String = row.get(0)?;
            Ok(json)
        })?;

        let mut records = Vec::new();
        for row in rows {
            let json = row?;
            let record: Record = serde_json::from_str(&json)?;
            records.push(record);
        }

        Ok(records)
    }
}

/// Map SQLite's "database or disk is full" to a quota failure.
fn map_quota(err: OffsyncError) -> OffsyncError {
    match err {
        OffsyncError::Sqlite(e) if e.sqlite_error_code() == Some(ErrorCode::DiskFull) => {
            OffsyncError::QuotaExceeded(e.to_string())
        }
        other => other,
    }
}

impl Backend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Structured
    }

    fn put(&self, spec: &CollectionSpec, key: Option<RecordKey>, mut record: Record) -> Result<RecordKey> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;

            let key = match key {
                Some(key) => {
                    if let Some(n) = key.as_auto() {
                        tx.execute(
                            "UPDATE collections SET next_key = MAX(next_key, ?2) WHERE name = ?1",
                            params![spec.name, n + 1],
                        )?;
                    }
                    key
                }
                None => {
                    let next: i64 = tx.query_row(
                        "SELECT next_key FROM collections WHERE name = ?1",
                        [&spec.name],
                        |row| row.get(0),
                    )?;
                    tx.execute(
                        "UPDATE collections SET next_key = ?2 WHERE name = ?1",
                        params![spec.name, next + 1],
                    )?;
                    RecordKey::Auto(next)
                }
            };

            let key_text = key.storage_key();
            let existing_created_at: Option<String> = tx
                .query_row(
                    "SELECT created_at FROM records WHERE collection = ?1 AND key = ?2",
                    params![spec.name, key_text],
                    |row| row.get(0),
                )
                .optional()?;

            record.prepare_write(&spec.name, key.clone(), existing_created_at);
            let json_data = serde_json::to_string(&record)?;

            tx.execute(
                r#"
                INSERT INTO records (collection, key, synced, created_at, json_data)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (collection, key) DO UPDATE SET
                    synced = excluded.synced,
                    json_data = excluded.json_data
                "#,
                params![
                    spec.name,
                    key_text,
                    record.synced,
                    record.created_at.as_deref().unwrap_or_default(),
                    json_data,
                ],
            )?;

            tx.commit()?;
            Ok(key)
        })
    }

    fn get(&self, collection: &str, key: &RecordKey) -> Result<Option<Record>> {
        self.with_conn(|conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT json_data FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection, key.storage_key()],
                    |row| row.get(0),
                )
                .optional()?;

            match json {
                Some(json) => Ok(Some(serde_json::from_str(&json)?)),
                None => Ok(None),
            }
        })
    }

    fn get_all(&self, collection: &str) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            Self::query_records(
                conn,
                "SELECT json_data FROM records WHERE collection = ?1 ORDER BY id",
                collection,
            )
        })
    }

    fn get_unsynced(&self, collection: &str) -> Result<Vec<Record>> {
        self.with_conn(|conn| {
            Self::query_records(
                conn,
                "SELECT json_data FROM records INDEXED BY idx_records_synced \
                 WHERE collection = ?1 AND synced = 0 ORDER BY id",
                collection,
            )
        })
    }

    fn mark_synced(
        &self,
        collection: &str,
        key: &RecordKey,
        server_id: Option<&str>,
        expected: Option<&serde_json::Value>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let key_text = key.storage_key();

            let json: Option<String> = tx
                .query_row(
                    "SELECT json_data FROM records WHERE collection = ?1 AND key = ?2",
                    params![collection, key_text],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(json) = json else {
                return Ok(false);
            };

            let mut record: Record = serde_json::from_str(&json)?;
            if !record.apply_synced(server_id, expected) {
                return Ok(false);
            }

            tx.execute(
                "UPDATE records SET synced = 1, json_data = ?3 WHERE collection = ?1 AND key = ?2",
                params![collection, key_text, serde_json::to_string(&record)?],
            )?;
            tx.commit()?;
            Ok(true)
        })
    }

    fn delete(&self, collection: &str, key: &RecordKey) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM records WHERE collection = ?1 AND key = ?2",
                params![collection, key.storage_key()],
            )?;
            Ok(removed > 0)
        })
    }

    fn clear(&self, collection: &str) -> Result<usize> {
        self.with_conn(|conn| Ok(conn.execute("DELETE FROM records WHERE collection = ?1", [collection])?))
    }

    fn count(&self, collection: &str) -> Result<usize> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE collection = ?1",
                [collection],
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.conn.lock().map_err(|e| OffsyncError::Storage(e.to_string()))?;
        if let Some(conn) = guard.take() {
            conn.close().map_err(|(_, e)| OffsyncError::Sqlite(e))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_backend() -> SqliteBackend {
        SqliteBackend::open_in_memory(&Schema::default()).unwrap()
    }

    fn uploads() -> CollectionSpec {
        CollectionSpec::auto("uploads")
    }

    #[test]
    fn test_open_creates_database_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("offsync.db");
        let _backend = SqliteBackend::open(&path, &Schema::default(), None).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_open_directory_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let result = SqliteBackend::open(temp_dir.path(), &Schema::default(), None);
        assert!(matches!(result, Err(OffsyncError::StoreUnavailable(_))));
    }

    #[test]
    fn test_open_newer_schema_is_unavailable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offsync.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch("PRAGMA user_version = 99").unwrap();
        }
        let result = SqliteBackend::open(&path, &Schema::default(), None);
        assert!(matches!(result, Err(OffsyncError::StoreUnavailable(_))));
    }

    #[test]
    fn test_upgrade_from_bare_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offsync.db");
        {
            let backend = SqliteBackend::open(&path, &Schema::default(), None).unwrap();
            backend.put(&uploads(), None, Record::new(json!({"n": 1}))).unwrap();
            let vault = CollectionSpec::keyed_by("vault", "hash");
            backend
                .put(&vault, Some(RecordKey::from("abc")), Record::new(json!({"hash": "abc"})))
                .unwrap();
            backend.close().unwrap();
        }
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "UPDATE records SET key = '1' WHERE collection = 'uploads';
                 UPDATE records SET key = 'abc' WHERE collection = 'vault';
                 PRAGMA user_version = 1;",
            )
            .unwrap();
        }

        let backend = SqliteBackend::open(&path, &Schema::default(), None).unwrap();
        assert_eq!(backend.get("uploads", &RecordKey::Auto(1)).unwrap().unwrap().payload["n"], 1);
        assert!(backend.get("vault", &RecordKey::from("abc")).unwrap().is_some());
        assert!(backend.get("uploads", &RecordKey::from("1")).unwrap().is_none());
    }

    #[test]
    fn test_auto_keys_increment() {
        let backend = create_test_backend();
        let k1 = backend.put(&uploads(), None, Record::new(json!({"n": 1}))).unwrap();
        let k2 = backend.put(&uploads(), None, Record::new(json!({"n": 2}))).unwrap();
        assert_eq!(k1, RecordKey::Auto(1));
        assert_eq!(k2, RecordKey::Auto(2));
    }

    #[test]
    fn test_explicit_auto_key_bumps_counter() {
        let backend = create_test_backend();
        backend.put(&uploads(), Some(RecordKey::Auto(10)), Record::new(json!({}))).unwrap();
        let next = backend.put(&uploads(), None, Record::new(json!({}))).unwrap();
        assert_eq!(next, RecordKey::Auto(11));
    }

    #[test]
    fn test_put_and_get() {
        let backend = create_test_backend();
        let key = backend.put(&uploads(), None, Record::new(json!({"name": "a.pdf"}))).unwrap();

        let record = backend.get("uploads", &key).unwrap().unwrap();
        assert_eq!(record.payload["name"], "a.pdf");
        assert_eq!(record.collection, "uploads");
        assert!(!record.synced);
        assert!(record.created_at.is_some());
    }

    #[test]
    fn test_get_not_found() {
        let backend = create_test_backend();
        assert!(backend.get("uploads", &RecordKey::Auto(1)).unwrap().is_none());
    }

    #[test]
    fn test_overwrite_keeps_created_at_and_resets_synced() {
        let backend = create_test_backend();
        let spec = CollectionSpec::keyed_by("vault", "hash");
        let key = RecordKey::from("abc");

        backend.put(&spec, Some(key.clone()), Record::new(json!({"v": 1}))).unwrap();
        let first = backend.get("vault", &key).unwrap().unwrap();
        backend.mark_synced("vault", &key, Some("srv-1"), None).unwrap();

        backend.put(&spec, Some(key.clone()), Record::new(json!({"v": 2}))).unwrap();
        let second = backend.get("vault", &key).unwrap().unwrap();

        assert_eq!(second.payload["v"], 2);
        assert_eq!(second.created_at, first.created_at);
        assert!(!second.synced);
        assert!(second.server_id.is_none());
        assert_eq!(backend.count("vault").unwrap(), 1);
    }

    #[test]
    fn test_get_all_keeps_first_insertion_order() {
        let backend = create_test_backend();
        let spec = CollectionSpec::keyed_by("documents", "id");
        for id in ["b", "a", "c"] {
            backend.put(&spec, Some(RecordKey::from(id)), Record::new(json!({"id": id}))).unwrap();
        }
        backend.put(&spec, Some(RecordKey::from("b")), Record::new(json!({"id": "b", "v": 2}))).unwrap();

        let ids: Vec<String> = backend
            .get_all("documents")
            .unwrap()
            .into_iter()
            .map(|r| r.key.unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_get_unsynced_uses_index() {
        let backend = create_test_backend();
        let k1 = backend.put(&uploads(), None, Record::new(json!({"n": 1}))).unwrap();
        backend.put(&uploads(), None, Record::new(json!({"n": 2}))).unwrap();
        backend.mark_synced("uploads", &k1, None, None).unwrap();

        let unsynced = backend.get_unsynced("uploads").unwrap();
        assert_eq!(unsynced.len(), 1);
        assert_eq!(unsynced[0].payload["n"], 2);
    }

    #[test]
    fn test_mark_synced_twice_is_noop() {
        let backend = create_test_backend();
        let key = backend.put(&uploads(), None, Record::new(json!({}))).unwrap();

        assert!(backend.mark_synced("uploads", &key, Some("srv-1"), None).unwrap());
        let after_first = backend.get("uploads", &key).unwrap().unwrap();
        assert!(!backend.mark_synced("uploads", &key, Some("srv-2"), None).unwrap());
        let after_second = backend.get("uploads", &key).unwrap().unwrap();

        assert_eq!(after_first, after_second);
        assert_eq!(after_second.server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_mark_synced_missing_record() {
        let backend = create_test_backend();
        assert!(!backend.mark_synced("uploads", &RecordKey::Auto(9), None, None).unwrap());
    }

    #[test]
    fn test_mark_synced_skips_rewritten_payload() {
        let backend = create_test_backend();
        let spec = CollectionSpec::keyed_by("vault", "hash");
        let key = RecordKey::from("k");
        backend.put(&spec, Some(key.clone()), Record::new(json!({"hash": "k", "rev": 1}))).unwrap();
        backend.put(&spec, Some(key.clone()), Record::new(json!({"hash": "k", "rev": 2}))).unwrap();

        let delivered = json!({"hash": "k", "rev": 1});
        assert!(!backend.mark_synced("vault", &key, Some("srv-1"), Some(&delivered)).unwrap());
        let record = backend.get("vault", &key).unwrap().unwrap();
        assert!(!record.synced);
        assert_eq!(record.payload["rev"], 2);
        assert_eq!(backend.get_unsynced("vault").unwrap().len(), 1);

        let current = json!({"hash": "k", "rev": 2});
        assert!(backend.mark_synced("vault", &key, Some("srv-2"), Some(&current)).unwrap());
        assert_eq!(backend.get("vault", &key).unwrap().unwrap().server_id.as_deref(), Some("srv-2"));
    }

    #[test]
    fn test_numeric_and_text_keys_do_not_collide() {
        let backend = create_test_backend();
        let spec = CollectionSpec::keyed_by("documents", "id");
        backend.put(&spec, Some(RecordKey::Auto(1)), Record::new(json!({"id": 1}))).unwrap();
        backend.put(&spec, Some(RecordKey::from("1")), Record::new(json!({"id": "1"}))).unwrap();

        assert_eq!(backend.count("documents").unwrap(), 2);
        let numeric = backend.get("documents", &RecordKey::Auto(1)).unwrap().unwrap();
        let text = backend.get("documents", &RecordKey::from("1")).unwrap().unwrap();
        assert_eq!(numeric.key, Some(RecordKey::Auto(1)));
        assert_eq!(numeric.payload["id"], 1);
        assert_eq!(text.key, Some(RecordKey::from("1")));
        assert_eq!(text.payload["id"], "1");

        assert!(backend.delete("documents", &RecordKey::from("1")).unwrap());
        assert!(backend.get("documents", &RecordKey::Auto(1)).unwrap().is_some());
    }

    #[test]
    fn test_delete_clear_count() {
        let backend = create_test_backend();
        let k1 = backend.put(&uploads(), None, Record::new(json!({}))).unwrap();
        backend.put(&uploads(), None, Record::new(json!({}))).unwrap();
        backend.put(&uploads(), None, Record::new(json!({}))).unwrap();

        assert!(backend.delete("uploads", &k1).unwrap());
        assert!(!backend.delete("uploads", &k1).unwrap());
        assert_eq!(backend.count("uploads").unwrap(), 2);

        assert_eq!(backend.clear("uploads").unwrap(), 2);
        assert_eq!(backend.count("uploads").unwrap(), 0);
    }

    #[test]
    fn test_collections_are_isolated() {
        let backend = create_test_backend();
        backend.put(&uploads(), Some(RecordKey::Auto(1)), Record::new(json!({"in": "uploads"}))).unwrap();
        backend
            .put(&CollectionSpec::auto("evidence"), Some(RecordKey::Auto(1)), Record::new(json!({"in": "evidence"})))
            .unwrap();

        assert_eq!(backend.get("uploads", &RecordKey::Auto(1)).unwrap().unwrap().payload["in"], "uploads");
        assert_eq!(backend.get("evidence", &RecordKey::Auto(1)).unwrap().unwrap().payload["in"], "evidence");
        backend.clear("uploads").unwrap();
        assert_eq!(backend.count("evidence").unwrap(), 1);
    }

    #[test]
    fn test_persistence_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offsync.db");

        {
            let backend = SqliteBackend::open(&path, &Schema::default(), None).unwrap();
            backend.put(&uploads(), None, Record::new(json!({"name": "kept"}))).unwrap();
            backend.close().unwrap();
        }

        {
            let backend = SqliteBackend::open(&path, &Schema::default(), None).unwrap();
            let record = backend.get("uploads", &RecordKey::Auto(1)).unwrap().unwrap();
            assert_eq!(record.payload["name"], "kept");
            let next = backend.put(&uploads(), None, Record::new(json!({}))).unwrap();
            assert_eq!(next, RecordKey::Auto(2));
        }
    }

    #[test]
    fn test_closed_backend_rejects_calls() {
        let backend = create_test_backend();
        backend.close().unwrap();
        assert!(matches!(backend.count("uploads"), Err(OffsyncError::Storage(_))));
    }

    #[test]
    fn test_quota_exceeded_when_database_full() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("offsync.db");
        let backend = SqliteBackend::open(&path, &Schema::default(), Some(64 * 1024)).unwrap();

        let blob = "x".repeat(8 * 1024);
        let mut last = Ok(RecordKey::Auto(0));
        for _ in 0..64 {
            last = backend.put(&uploads(), None, Record::new(json!({"blob": blob})));
            if last.is_err() {
                break;
            }
        }
        assert!(matches!(last, Err(OffsyncError::QuotaExceeded(_))));
    }
}
