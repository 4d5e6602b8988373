use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OffsyncError, Result};
use crate::queue::DEFAULT_QUEUE_CAPACITY;
use crate::remote::HttpRemoteConfig;
use crate::store::DEFAULT_FLAT_CAPACITY;
use crate::sync::SyncConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: Option<String>,
    pub storage: StorageConfig,
    pub remote: RemoteConfig,
    pub sync: SyncSettings,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    /// Skip the structured store and use the flat store only
    pub force_fallback: bool,
    pub fallback_capacity_bytes: usize,
    pub max_db_bytes: Option<u64>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("offsync"),
            force_fallback: false,
            fallback_capacity_bytes: DEFAULT_FLAT_CAPACITY,
            max_db_bytes: None,
        }
    }
}

impl StorageConfig {
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("offsync.db")
    }

    pub fn flat_path(&self) -> PathBuf {
        self.data_dir.join("flat.json")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            timeout_ms: 10000,
        }
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn http(&self) -> HttpRemoteConfig {
        HttpRemoteConfig {
            base_url: self.base_url.clone(),
            timeout: self.timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_ms: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub jitter: f64,
    pub queue_capacity: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_ms: 30000,
            backoff_initial_ms: 1000,
            backoff_max_ms: 300000,
            jitter: 0.2,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    pub enabled: bool,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            storage: StorageConfig::default(),
            remote: RemoteConfig::default(),
            sync: SyncSettings::default(),
            migration: MigrationConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        // If explicit config path provided, it must load
        if let Some(path) = config_path {
            return Self::load_from_file(path);
        }

        // Try primary location: ~/.config/<project>/<project>.yml
        let project_name = env!("CARGO_PKG_NAME");
        if let Some(config_dir) = dirs::config_dir() {
            let primary_config = config_dir.join(project_name).join(format!("{}.yml", project_name));
            if primary_config.exists() {
                match Self::load_from_file(&primary_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        log::warn!("Failed to load config from {}: {}", primary_config.display(), e);
                    }
                }
            }
        }

        // Try fallback location: ./<project>.yml
        let fallback_config = PathBuf::from(format!("{}.yml", project_name));
        if fallback_config.exists() {
            match Self::load_from_file(&fallback_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    log::warn!("Failed to load config from {}: {}", fallback_config.display(), e);
                }
            }
        }

        // No config file found, use defaults
        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|e| OffsyncError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| OffsyncError::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

        log::info!("Loaded config from: {}", path.display());
        Ok(config)
    }

    /// Scheduler settings in runtime form.
    pub fn sync_config(&self) -> SyncConfig {
        SyncConfig {
            interval: Duration::from_millis(self.sync.interval_ms.max(1)),
            backoff_initial: Duration::from_millis(self.sync.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.sync.backoff_max_ms),
            jitter: self.sync.jitter,
            remote_timeout: self.remote.timeout(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.remote.base_url, "http://localhost:3000");
        assert_eq!(config.remote.timeout_ms, 10000);
        assert_eq!(config.sync.queue_capacity, 1000);
        assert_eq!(config.storage.fallback_capacity_bytes, 5 * 1024 * 1024);
        assert!(!config.storage.force_fallback);
        assert!(config.migration.enabled);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsync.yml");
        fs::write(
            &path,
            "remote:\n  base_url: https://api.example.com\nsync:\n  interval_ms: 5000\n",
        )
        .unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.remote.base_url, "https://api.example.com");
        assert_eq!(config.remote.timeout_ms, 10000);
        assert_eq!(config.sync.interval_ms, 5000);
        assert_eq!(config.sync.backoff_max_ms, 300000);
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let temp = TempDir::new().unwrap();
        let missing = temp.path().join("nope.yml");
        assert!(matches!(Config::load(Some(&missing)), Err(OffsyncError::Config(_))));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("offsync.yml");
        fs::write(&path, "sync: [not, a, map]").unwrap();
        assert!(matches!(Config::load_from_file(&path), Err(OffsyncError::Config(_))));
    }

    #[test]
    fn test_storage_paths() {
        let storage = StorageConfig {
            data_dir: PathBuf::from("/var/lib/offsync"),
            ..StorageConfig::default()
        };
        assert_eq!(storage.db_path(), PathBuf::from("/var/lib/offsync/offsync.db"));
        assert_eq!(storage.flat_path(), PathBuf::from("/var/lib/offsync/flat.json"));
    }

    #[test]
    fn test_sync_config_conversion() {
        let config = Config::default();
        let sync = config.sync_config();
        assert_eq!(sync.interval, Duration::from_secs(30));
        assert_eq!(sync.backoff_initial, Duration::from_secs(1));
        assert_eq!(sync.remote_timeout, Duration::from_secs(10));
    }
}
