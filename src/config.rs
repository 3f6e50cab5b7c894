//! Broker configuration and bootstrap manifest
//!
//! Both are plain JSON files with camelCase keys. Missing keys take their
//! defaults.

use crate::error::{BrokerError, Result};
use crate::schema::NewDatatype;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Tunable broker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerConfig {
    /// Seconds a timestamp may run ahead of the broker clock before a desync warning (default: 900)
    #[serde(default = "default_max_ahead_secs")]
    pub max_ahead_secs: u64,

    /// Seconds a timestamp may lag behind the broker clock before a desync warning (default: 86400)
    #[serde(default = "default_max_behind_secs")]
    pub max_behind_secs: u64,

    /// Pending alert batches buffered per observer (default: 16)
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,

    /// Gzip level for response bodies and pushes, 0-9 (default: 9)
    #[serde(default = "default_compression_level")]
    pub compression_level: u32,

    /// JSON file backing a `FileStore`; in-memory when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<PathBuf>,
}

fn default_max_ahead_secs() -> u64 {
    15 * 60
}

fn default_max_behind_secs() -> u64 {
    24 * 60 * 60
}

fn default_observer_queue() -> usize {
    16
}

fn default_compression_level() -> u32 {
    9
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_ahead_secs: default_max_ahead_secs(),
            max_behind_secs: default_max_behind_secs(),
            observer_queue: default_observer_queue(),
            compression_level: default_compression_level(),
            storage_path: None,
        }
    }
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path, what: &str) -> Result<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(path).map_err(|e| {
        BrokerError::Config(format!(
            "Failed to read {} file {}: {}",
            what,
            path.display(),
            e
        ))
    })?;
    serde_json::from_str(&content).map(Some).map_err(|e| {
        BrokerError::Config(format!(
            "Failed to parse {} file {}: {}",
            what,
            path.display(),
            e
        ))
    })
}

impl BrokerConfig {
    /// Load from a JSON file. Returns defaults if the file does not exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let config: Self = read_json(path.as_ref(), "config")?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.compression_level > 9 {
            return Err(BrokerError::Config(format!(
                "compressionLevel must be 0-9, got {}",
                self.compression_level
            )));
        }
        if self.observer_queue == 0 {
            return Err(BrokerError::Config("observerQueue must be at least 1".into()));
        }
        Ok(())
    }

    pub fn max_ahead(&self) -> Duration {
        Duration::seconds(self.max_ahead_secs.min(i64::MAX as u64) as i64)
    }

    pub fn max_behind(&self) -> Duration {
        Duration::seconds(self.max_behind_secs.min(i64::MAX as u64) as i64)
    }
}

/// A client to register at startup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientEntry {
    pub name: String,

    /// PEM-encoded P-384 public key
    pub public_key: String,
}

/// Registrations applied when the broker starts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    #[serde(default)]
    pub clients: Vec<ClientEntry>,

    #[serde(default)]
    pub datatypes: Vec<NewDatatype>,
}

impl Manifest {
    /// Load from a JSON file. A missing file is an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        read_json(path, "manifest")?.ok_or_else(|| {
            BrokerError::Config(format!("Manifest file {} not found", path.display()))
        })
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty() && self.datatypes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StorageKind;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("fog-broker-config-{}", uuid::Uuid::new_v4()))
            .join(name)
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_default_config() {
        let config = BrokerConfig::default();
        assert_eq!(config.max_ahead_secs, 900);
        assert_eq!(config.max_behind_secs, 86_400);
        assert_eq!(config.observer_queue, 16);
        assert_eq!(config.compression_level, 9);
        assert!(config.storage_path.is_none());
        assert_eq!(config.max_ahead(), Duration::minutes(15));
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let config = BrokerConfig::from_file("/tmp/nonexistent-fog-broker-config.json").unwrap();
        assert_eq!(config, BrokerConfig::default());
    }

    #[test]
    fn test_partial_file() {
        let path = temp_path("broker.json");
        write(&path, r#"{"maxAheadSecs": 60, "storagePath": "/var/lib/fog/store.json"}"#);

        let config = BrokerConfig::from_file(&path).unwrap();
        assert_eq!(config.max_ahead_secs, 60);
        assert_eq!(config.max_behind_secs, 86_400);
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/fog/store.json")));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_malformed_file() {
        let path = temp_path("broker.json");
        write(&path, "{ not json");
        assert!(matches!(BrokerConfig::from_file(&path), Err(BrokerError::Config(_))));

        write(&path, r#"{"compressionLevel": 12}"#);
        assert!(matches!(BrokerConfig::from_file(&path), Err(BrokerError::Config(_))));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
    }

    #[test]
    fn test_manifest() {
        let path = temp_path("manifest.json");
        write(
            &path,
            r#"{
                "clients": [{"name": "client0", "publicKey": "PEM"}],
                "datatypes": [
                    {"name": "temp", "storageKind": "number", "unit": "C",
                     "validBounds": {"low": -40, "high": 85},
                     "alertSpec": {"absoluteThresholds": {"low": -10, "high": 45}}},
                    {"name": "volts", "storageKind": "array", "arrayElementKind": "number"}
                ]
            }"#,
        );

        let manifest = Manifest::from_file(&path).unwrap();
        assert_eq!(manifest.clients[0].name, "client0");
        assert_eq!(manifest.datatypes.len(), 2);
        assert_eq!(manifest.datatypes[1].array_element_kind, Some(StorageKind::Number));
        let spec = manifest.datatypes[0].alert_spec.as_ref().unwrap();
        assert_eq!(spec.absolute_thresholds.unwrap().high, Some(45.0));

        std::fs::remove_dir_all(path.parent().unwrap()).unwrap();
        assert!(Manifest::from_file(&path).is_err());
    }
}
