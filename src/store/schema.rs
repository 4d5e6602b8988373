//! Collection schema: which collections exist, how they are keyed and indexed.

use serde::{Deserialize, Serialize};

use super::record::{Record, RecordKey};
use crate::error::{OffsyncError, Result};

/// Current schema version. Bump when collections are added or the stored
/// layout changes. Version 2 stores keys with their kind prefix.
pub const SCHEMA_VERSION: i64 = 2;

/// Name of the collection holding deferred remote writes.
pub const OFFLINE_QUEUE: &str = "offline_queue";

/// How records in a collection get their key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyMode {
    /// Store-assigned surrogate keys
    Auto,
    /// Natural key read from this payload field
    Path(String),
}

/// A named partition of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSpec {
    pub name: String,
    pub key: KeyMode,
    /// Secondary indexes. `synced` is always present.
    pub indexes: Vec<String>,
}

impl CollectionSpec {
    /// An auto-keyed collection.
    pub fn auto(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyMode::Auto,
            indexes: vec!["synced".to_string()],
        }
    }

    /// A collection keyed by a payload field.
    pub fn keyed_by(name: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: KeyMode::Path(field.into()),
            indexes: vec!["synced".to_string()],
        }
    }

    /// Work out the key a write should land under.
    ///
    /// Returns `Ok(None)` when the store must assign a surrogate.
    pub fn resolve_key(&self, record: &Record) -> Result<Option<RecordKey>> {
        if let Some(key) = &record.key {
            return Ok(Some(key.clone()));
        }
        match &self.key {
            KeyMode::Auto => Ok(None),
            KeyMode::Path(field) => record
                .payload
                .get(field)
                .and_then(RecordKey::from_json)
                .map(Some)
                .ok_or_else(|| {
                    OffsyncError::InvalidKey(format!(
                        "collection '{}' requires payload field '{}'",
                        self.name, field
                    ))
                }),
        }
    }

    /// Payload field holding the natural key, if any.
    pub fn key_path(&self) -> Option<&str> {
        match &self.key {
            KeyMode::Auto => None,
            KeyMode::Path(field) => Some(field),
        }
    }
}

/// The full set of collections a store is opened with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub version: i64,
    pub collections: Vec<CollectionSpec>,
}

impl Default for Schema {
    fn default() -> Self {
        Self {
            version: SCHEMA_VERSION,
            collections: vec![
                CollectionSpec::auto("uploads"),
                CollectionSpec::keyed_by("documents", "id"),
                CollectionSpec::auto("submissions"),
                CollectionSpec::auto(OFFLINE_QUEUE),
                CollectionSpec::auto("records"),
                CollectionSpec::keyed_by("vault", "hash"),
                CollectionSpec::auto("evidence"),
                CollectionSpec::auto("provenance"),
                CollectionSpec::auto("sbom"),
                CollectionSpec::auto("gfp"),
            ],
        }
    }
}

impl Schema {
    /// Look up a collection by name.
    pub fn collection(&self, name: &str) -> Result<&CollectionSpec> {
        self.collections
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| OffsyncError::UnknownCollection(name.to_string()))
    }

    /// Add or replace a collection definition.
    pub fn with_collection(mut self, spec: CollectionSpec) -> Self {
        self.collections.retain(|c| c.name != spec.name);
        self.collections.push(spec);
        self
    }

    /// All collection names in definition order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.collections.iter().map(|c| c.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_schema_has_required_collections() {
        let schema = Schema::default();
        for name in ["uploads", "documents", "submissions", OFFLINE_QUEUE, "vault", "records"] {
            assert!(schema.collection(name).is_ok(), "missing {}", name);
        }
        assert_eq!(schema.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_every_collection_indexes_synced() {
        let schema = Schema::default();
        assert!(schema.collections.iter().all(|c| c.indexes.iter().any(|i| i == "synced")));
    }

    #[test]
    fn test_unknown_collection() {
        let schema = Schema::default();
        assert!(matches!(
            schema.collection("charts"),
            Err(OffsyncError::UnknownCollection(name)) if name == "charts"
        ));
    }

    #[test]
    fn test_resolve_key_auto() {
        let spec = CollectionSpec::auto("uploads");
        assert_eq!(spec.resolve_key(&Record::new(json!({}))).unwrap(), None);
        assert_eq!(
            spec.resolve_key(&Record::with_key(5, json!({}))).unwrap(),
            Some(RecordKey::Auto(5))
        );
    }

    #[test]
    fn test_resolve_key_from_path() {
        let spec = CollectionSpec::keyed_by("vault", "hash");
        let key = spec.resolve_key(&Record::new(json!({"hash": "abc"}))).unwrap();
        assert_eq!(key, Some(RecordKey::from("abc")));
    }

    #[test]
    fn test_resolve_key_missing_path_field() {
        let spec = CollectionSpec::keyed_by("vault", "hash");
        let err = spec.resolve_key(&Record::new(json!({"other": 1}))).unwrap_err();
        assert!(matches!(err, OffsyncError::InvalidKey(_)));
    }

    #[test]
    fn test_with_collection_replaces() {
        let schema = Schema::default().with_collection(CollectionSpec::keyed_by("uploads", "name"));
        assert_eq!(schema.collection("uploads").unwrap().key_path(), Some("name"));
        assert_eq!(schema.names().filter(|n| *n == "uploads").count(), 1);
    }
}
