//! History manager configuration

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Tunables for automatic compaction, backups and container compression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Run merge/compaction from `tick` when the interval has elapsed
    pub automerge_enabled: bool,
    /// Seconds between automatic merge checks
    pub automerge_interval_secs: u64,
    /// Number of events on the current chain kept unmerged
    pub max_event_count: usize,
    /// Write rotating backups of the last saved document from `tick`
    pub autobackup_enabled: bool,
    /// Seconds between automatic backups
    pub autobackup_interval_secs: u64,
    /// Number of rotated backup files kept
    pub backup_count: usize,
    /// ZSTD level used for container bodies (1-22)
    pub compression_level: i32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            automerge_enabled: true,
            automerge_interval_secs: 300,
            max_event_count: 200,
            autobackup_enabled: false,
            autobackup_interval_secs: 600,
            backup_count: 3,
            compression_level: 3,
        }
    }
}

impl HistoryConfig {
    /// Parse a configuration from JSON; missing fields take their defaults
    pub fn from_json_str(s: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(s)
            .map_err(|e| Error::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Reject settings the manager cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.automerge_enabled && self.max_event_count == 0 {
            return Err(Error::Configuration(
                "max_event_count must be at least 1 when automerge is enabled".to_string(),
            ));
        }
        if self.autobackup_enabled && self.backup_count == 0 {
            return Err(Error::Configuration(
                "backup_count must be at least 1 when autobackup is enabled".to_string(),
            ));
        }
        if !(1..=22).contains(&self.compression_level) {
            return Err(Error::Configuration(format!(
                "compression_level {} outside 1..=22",
                self.compression_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = HistoryConfig::from_json_str(r#"{"max_event_count": 10}"#).unwrap();
        assert_eq!(config.max_event_count, 10);
        assert_eq!(config.backup_count, 3);
        assert!(config.automerge_enabled);
    }

    #[test]
    fn test_validation() {
        let err = HistoryConfig::from_json_str(r#"{"compression_level": 40}"#).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));

        let err = HistoryConfig::from_json_str(
            r#"{"autobackup_enabled": true, "backup_count": 0}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, r#"{"autobackup_enabled": true}"#).unwrap();
        let config = HistoryConfig::from_json_file(&path).unwrap();
        assert!(config.autobackup_enabled);
    }
}
