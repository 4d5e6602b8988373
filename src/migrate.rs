//! Migration engine - seeds collections from legacy flat keys
//!
//! Legacy data lives in the flat store as JSON text under fixed keys such as
//! `s4_uploads`. Each mapping is migrated independently; a broken mapping is
//! logged and skipped. A mapping that succeeds leaves a done marker in the
//! flat store and is skipped on later starts, so records the application
//! deletes or clears afterwards stay gone. Writes are upserts by a
//! deterministic key, so a run interrupted before its marker was written
//! never duplicates records.

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::error::{OffsyncError, Result};
use crate::store::{FlatStore, LocalStore, META_PREFIX, Record, RecordKey, now_iso};

/// How a legacy value is laid out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyShape {
    /// A JSON array; every element becomes a record
    List,
    /// A single JSON object stored under a fixed key
    Object { key: String },
}

/// One legacy key and where its data goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyMapping {
    pub legacy_key: String,
    pub collection: String,
    pub shape: LegacyShape,
}

impl LegacyMapping {
    pub fn list(legacy_key: &str, collection: &str) -> Self {
        Self {
            legacy_key: legacy_key.to_string(),
            collection: collection.to_string(),
            shape: LegacyShape::List,
        }
    }

    pub fn object(legacy_key: &str, collection: &str, key: &str) -> Self {
        Self {
            legacy_key: legacy_key.to_string(),
            collection: collection.to_string(),
            shape: LegacyShape::Object { key: key.to_string() },
        }
    }
}

/// The legacy keys written by earlier releases.
pub fn default_mappings() -> Vec<LegacyMapping> {
    vec![
        LegacyMapping::list("s4_anchored_records", "records"),
        LegacyMapping::list("s4_uploads", "uploads"),
        LegacyMapping::list("s4_documents", "documents"),
        LegacyMapping::list("s4_submissions", "submissions"),
        LegacyMapping::list("s4_vault", "vault"),
        LegacyMapping::list("s4_evidence", "evidence"),
        LegacyMapping::list("s4_provenance_events", "provenance"),
        LegacyMapping::list("s4_sbom", "sbom"),
        LegacyMapping::list("s4_gfp_items", "gfp"),
        LegacyMapping::object("s4_settings", "records", "settings"),
    ]
}

/// Flat-store slot recording that `legacy_key` was migrated.
fn done_marker(legacy_key: &str) -> String {
    format!("{}migrated/{}", META_PREFIX, legacy_key)
}

/// Summary of one migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    /// Legacy keys migrated without error
    pub migrated: usize,
    /// Legacy keys already migrated by an earlier run
    pub skipped: usize,
    /// Legacy keys not present
    pub absent: usize,
    /// Legacy keys that failed and were skipped
    pub failed: usize,
    /// Records written
    pub items: usize,
    /// Records already present with the same payload
    pub unchanged: usize,
}

#[derive(Debug, Default)]
struct MappingCounts {
    written: usize,
    unchanged: usize,
}

/// Runs a fixed list of legacy mappings.
#[derive(Debug, Clone)]
pub struct Migrator {
    mappings: Vec<LegacyMapping>,
}

impl Default for Migrator {
    fn default() -> Self {
        Self::new(default_mappings())
    }
}

impl Migrator {
    pub fn new(mappings: Vec<LegacyMapping>) -> Self {
        Self { mappings }
    }

    pub fn mappings(&self) -> &[LegacyMapping] {
        &self.mappings
    }

    /// Migrate every mapping from `legacy` into `store`.
    ///
    /// Never fails as a whole; per-mapping failures are counted and logged.
    /// Mappings with a done marker are skipped.
    pub async fn run(&self, store: &LocalStore, legacy: &FlatStore) -> MigrationReport {
        let mut report = MigrationReport::default();

        for mapping in &self.mappings {
            let marker = done_marker(&mapping.legacy_key);
            match legacy.get_item(&marker) {
                Ok(Some(at)) => {
                    debug!("Legacy key {} already migrated at {}", mapping.legacy_key, at);
                    report.skipped += 1;
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Failed to read migration marker for {}: {}", mapping.legacy_key, e);
                    report.failed += 1;
                    continue;
                }
            }

            let raw = match legacy.get_item(&mapping.legacy_key) {
                Ok(Some(raw)) => raw,
                Ok(None) => {
                    report.absent += 1;
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read legacy key {}: {}", mapping.legacy_key, e);
                    report.failed += 1;
                    continue;
                }
            };

            match self.migrate_one(store, mapping, &raw).await {
                Ok(counts) => {
                    debug!(
                        "Migrated {} -> {}: {} written, {} unchanged",
                        mapping.legacy_key, mapping.collection, counts.written, counts.unchanged
                    );
                    report.migrated += 1;
                    report.items += counts.written;
                    report.unchanged += counts.unchanged;
                    if let Err(e) = legacy.set_item(&marker, &now_iso()) {
                        warn!(
                            "Migrated {} but could not record it, it will be checked again next start: {}",
                            mapping.legacy_key, e
                        );
                    }
                }
                Err(e) => {
                    warn!("Skipping legacy key {}: {}", mapping.legacy_key, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Migration finished: {} keys migrated ({} records written, {} unchanged), {} already done, {} absent, {} failed",
            report.migrated, report.items, report.unchanged, report.skipped, report.absent, report.failed
        );
        report
    }

    async fn migrate_one(&self, store: &LocalStore, mapping: &LegacyMapping, raw: &str) -> Result<MappingCounts> {
        let value: Value = serde_json::from_str(raw)
            .map_err(|e| OffsyncError::Migration(format!("{} is not valid JSON: {}", mapping.legacy_key, e)))?;
        let key_path = store.schema().collection(&mapping.collection)?.key_path().map(str::to_string);

        let mut counts = MappingCounts::default();
        match &mapping.shape {
            LegacyShape::List => {
                let Value::Array(items) = value else {
                    return Err(OffsyncError::Migration(format!(
                        "{} is not a list",
                        mapping.legacy_key
                    )));
                };
                for (index, item) in items.into_iter().enumerate() {
                    let key = key_path
                        .as_deref()
                        .and_then(|field| item.get(field))
                        .and_then(RecordKey::from_json)
                        .unwrap_or_else(|| RecordKey::Text(format!("{}#{}", mapping.legacy_key, index)));
                    upsert(store, &mapping.collection, key, item, &mut counts).await?;
                }
            }
            LegacyShape::Object { key } => {
                if !value.is_object() {
                    return Err(OffsyncError::Migration(format!(
                        "{} is not an object",
                        mapping.legacy_key
                    )));
                }
                upsert(store, &mapping.collection, RecordKey::from(key.as_str()), value, &mut counts).await?;
            }
        }

        Ok(counts)
    }
}

/// Write `payload` under `key` unless the stored record already matches.
async fn upsert(
    store: &LocalStore,
    collection: &str,
    key: RecordKey,
    payload: Value,
    counts: &mut MappingCounts,
) -> Result<()> {
    if let Some(existing) = store.get(collection, &key).await? {
        if existing.payload == payload {
            counts.unchanged += 1;
            return Ok(());
        }
    }
    store.put(collection, Record::with_key(key, payload)).await?;
    counts.written += 1;
    Ok(())
}
