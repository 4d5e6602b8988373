//! Record types stored in every collection.
//!
//! A `Record` wraps an arbitrary JSON payload with the bookkeeping the sync
//! path needs: a key, the first-write timestamp and the delivery state.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of a record within its collection.
///
/// Natural keys come from the caller (or from a payload field), surrogate keys
/// are assigned by the store's per-collection counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordKey {
    /// Store-assigned auto-incrementing surrogate
    Auto(i64),
    /// Caller-supplied natural key
    Text(String),
}

impl RecordKey {
    /// Build a key from a JSON value found in a payload.
    ///
    /// Integers become surrogate-style keys, strings natural keys. Anything
    /// else cannot key a record.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(s) if !s.is_empty() => Some(RecordKey::Text(s.clone())),
            serde_json::Value::Number(n) => n.as_i64().map(RecordKey::Auto),
            _ => None,
        }
    }

    /// The numeric value of a surrogate key.
    pub fn as_auto(&self) -> Option<i64> {
        match self {
            RecordKey::Auto(n) => Some(*n),
            RecordKey::Text(_) => None,
        }
    }

    /// Key as stored by the backends. The kind is encoded so that `Auto(1)`
    /// and `Text("1")` address different records.
    pub(crate) fn storage_key(&self) -> String {
        match self {
            RecordKey::Auto(n) => format!("n:{}", n),
            RecordKey::Text(s) => format!("s:{}", s),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Auto(n) => write!(f, "{}", n),
            RecordKey::Text(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RecordKey {
    fn from(n: i64) -> Self {
        RecordKey::Auto(n)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        RecordKey::Text(s.to_string())
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        RecordKey::Text(s)
    }
}

/// The unit of persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Record {
    /// Owning collection (filled in by the store on write)
    #[serde(default)]
    pub collection: String,

    /// Primary key; `None` until the store assigns one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<RecordKey>,

    /// Business data
    pub payload: serde_json::Value,

    /// RFC 3339 timestamp of the first write
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,

    /// True once the remote service acknowledged the record
    #[serde(default)]
    pub synced: bool,

    /// Identifier assigned by the remote service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

impl Record {
    /// Create an unsynced record for the given payload.
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            collection: String::new(),
            key: None,
            payload,
            created_at: None,
            synced: false,
            server_id: None,
        }
    }

    /// Create a record with an explicit key.
    pub fn with_key(key: impl Into<RecordKey>, payload: serde_json::Value) -> Self {
        let mut record = Self::new(payload);
        record.key = Some(key.into());
        record
    }

    /// Apply the first-write defaults a fresh put implies.
    ///
    /// `existing_created_at` is the timestamp of a record already stored under
    /// the same key; it always wins so `created_at` never moves.
    pub(crate) fn prepare_write(&mut self, collection: &str, key: RecordKey, existing_created_at: Option<String>) {
        self.collection = collection.to_string();
        self.key = Some(key);
        self.created_at = existing_created_at.or_else(|| self.created_at.take()).or_else(|| Some(now_iso()));
        if !self.synced {
            self.server_id = None;
        }
    }

    /// Flip the record to synced. Returns false if it already was, or if
    /// `expected` is given and the stored payload no longer matches it.
    pub(crate) fn apply_synced(&mut self, server_id: Option<&str>, expected: Option<&serde_json::Value>) -> bool {
        if self.synced {
            return false;
        }
        if expected.is_some_and(|payload| *payload != self.payload) {
            return false;
        }
        self.synced = true;
        self.server_id = server_id.map(str::to_string);
        true
    }
}

/// Current UTC time as an RFC 3339 string with millisecond precision.
pub fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_key_untagged_serialization() {
        assert_eq!(serde_json::to_string(&RecordKey::Auto(7)).unwrap(), "7");
        assert_eq!(serde_json::to_string(&RecordKey::from("abc")).unwrap(), "\"abc\"");

        let auto: RecordKey = serde_json::from_str("42").unwrap();
        let text: RecordKey = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(auto, RecordKey::Auto(42));
        assert_eq!(text, RecordKey::Text("42".to_string()));
    }

    #[test]
    fn test_record_key_from_json() {
        assert_eq!(RecordKey::from_json(&json!("h1")), Some(RecordKey::from("h1")));
        assert_eq!(RecordKey::from_json(&json!(3)), Some(RecordKey::Auto(3)));
        assert_eq!(RecordKey::from_json(&json!("")), None);
        assert_eq!(RecordKey::from_json(&json!(1.5)), None);
        assert_eq!(RecordKey::from_json(&json!({"a": 1})), None);
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::Auto(12).to_string(), "12");
        assert_eq!(RecordKey::from("doc-1").to_string(), "doc-1");
    }

    #[test]
    fn test_storage_key_keeps_kinds_apart() {
        assert_eq!(RecordKey::Auto(1).storage_key(), "n:1");
        assert_eq!(RecordKey::from("1").storage_key(), "s:1");
        assert_ne!(RecordKey::Auto(1).storage_key(), RecordKey::from("1").storage_key());
    }

    #[test]
    fn test_new_record_is_unsynced() {
        let record = Record::new(json!({"a": 1}));
        assert!(!record.synced);
        assert!(record.key.is_none());
        assert!(record.created_at.is_none());
        assert!(record.server_id.is_none());
    }

    #[test]
    fn test_prepare_write_sets_defaults() {
        let mut record = Record::new(json!({"a": 1}));
        record.prepare_write("uploads", RecordKey::Auto(1), None);

        assert_eq!(record.collection, "uploads");
        assert_eq!(record.key, Some(RecordKey::Auto(1)));
        assert!(record.created_at.is_some());
    }

    #[test]
    fn test_prepare_write_keeps_existing_created_at() {
        let mut record = Record::new(json!({"a": 2}));
        record.created_at = Some("2030-01-01T00:00:00.000Z".to_string());
        record.prepare_write("uploads", RecordKey::Auto(1), Some("2020-01-01T00:00:00.000Z".to_string()));

        assert_eq!(record.created_at.as_deref(), Some("2020-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_prepare_write_clears_stale_server_id() {
        let mut record = Record::new(json!({}));
        record.server_id = Some("srv-1".to_string());
        record.prepare_write("uploads", RecordKey::Auto(1), None);
        assert!(record.server_id.is_none());
    }

    #[test]
    fn test_apply_synced_only_once() {
        let mut record = Record::new(json!({}));
        assert!(record.apply_synced(Some("srv-1"), None));
        assert!(!record.apply_synced(Some("srv-2"), None));
        assert!(record.synced);
        assert_eq!(record.server_id.as_deref(), Some("srv-1"));
    }

    #[test]
    fn test_apply_synced_requires_matching_payload() {
        let mut record = Record::new(json!({"rev": 2}));
        assert!(!record.apply_synced(Some("srv-1"), Some(&json!({"rev": 1}))));
        assert!(!record.synced);
        assert!(record.server_id.is_none());

        assert!(record.apply_synced(Some("srv-2"), Some(&json!({"rev": 2}))));
        assert_eq!(record.server_id.as_deref(), Some("srv-2"));
    }

    #[test]
    fn test_record_deserializes_with_defaults() {
        let record: Record = serde_json::from_str(r#"{"payload": {"x": 1}}"#).unwrap();
        assert!(!record.synced);
        assert!(record.key.is_none());
        assert_eq!(record.payload["x"], 1);
    }

    #[test]
    fn test_now_iso_is_rfc3339() {
        let ts = now_iso();
        assert!(chrono::DateTime::parse_from_rfc3339(&ts).is_ok());
        assert!(ts.ends_with('Z'));
    }
}
