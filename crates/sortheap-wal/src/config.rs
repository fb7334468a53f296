//! WAL configuration.
//!
//! This module provides configuration options for the Write-Ahead Log.

use std::path::PathBuf;

use sortheap_common::constants::MAX_WAL_RECORD_SIZE;

/// Sync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Sync after every write (safest, slowest).
    #[default]
    EveryWrite,
    /// Never sync (fastest, unsafe - for testing only).
    Never,
}

/// Configuration for the Write-Ahead Log.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding the log file.
    pub dir: PathBuf,

    /// File name of the log inside `dir`.
    pub file_name: String,

    /// Maximum size of a single WAL record.
    pub max_record_size: usize,

    /// Sync policy for durability.
    pub sync_policy: SyncPolicy,

    /// Whether to verify checksums on read.
    pub verify_checksums: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data/wal"),
            file_name: "sortheap.wal".to_string(),
            max_record_size: MAX_WAL_RECORD_SIZE,
            sync_policy: SyncPolicy::default(),
            verify_checksums: true,
        }
    }
}

impl WalConfig {
    /// Creates a new WAL configuration with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Creates a configuration suitable for tests.
    pub fn for_testing(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            sync_policy: SyncPolicy::Never,
            ..Default::default()
        }
    }

    /// Sets the sync policy.
    pub fn with_sync_policy(mut self, policy: SyncPolicy) -> Self {
        self.sync_policy = policy;
        self
    }

    /// Sets the maximum record size.
    pub fn with_max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Returns the full path of the log file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file_name)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.max_record_size < 1024 {
            return Err("max_record_size must be at least 1 KB");
        }
        if self.file_name.is_empty() {
            return Err("file_name must not be empty");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WalConfig::default();
        assert_eq!(config.sync_policy, SyncPolicy::EveryWrite);
        assert!(config.verify_checksums);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = WalConfig::for_testing("/tmp/x").with_max_record_size(10);
        assert_eq!(config.sync_policy, SyncPolicy::Never);
        assert!(config.validate().is_err());
        assert_eq!(config.path(), PathBuf::from("/tmp/x/sortheap.wal"));
    }
}
