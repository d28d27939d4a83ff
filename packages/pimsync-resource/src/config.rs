//! Per-resource configuration (spec.md §9 ambient stack), loadable from TOML
//! the way `topgun-server::service::config::ServerConfig` loads the
//! server's settings: a serde-derived struct with a `Default` impl carrying
//! every value spec.md otherwise states as a fixed constant, so operators
//! can override them without a rebuild.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Tunables for one resource process. Field defaults match the fixed values
/// spec.md names inline (§4.7 retry budget, §4.8 queue fairness, §4.10
/// backoff bounds, §5 network timeout, §9 compaction threshold).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceConfig {
    /// Synchronizer-queue commands drained before the user-queue gets a
    /// turn (spec.md §4.8, §5).
    pub sync_queue_fairness: u32,
    /// Consecutive identical pipeline failures before a command moves to
    /// the dead-letter sub-database (spec.md §4.7).
    pub preprocessor_retry_budget: u32,
    /// Initial change-replay writeback backoff delay, in milliseconds
    /// (spec.md §4.10).
    pub writeback_backoff_initial_ms: u64,
    /// Change-replay writeback backoff ceiling, in milliseconds (spec.md
    /// §4.10).
    pub writeback_backoff_max_ms: u64,
    /// Per-operation network call timeout, in seconds (spec.md §5).
    pub network_timeout_secs: u64,
    /// Committed-revision count since the last compaction sweep that
    /// triggers the next one (spec.md §9 Open Question recommendation).
    pub compaction_revision_threshold: u64,
    /// Upper bound on how long a compaction sweep waits even if the
    /// revision threshold is never hit (spec.md §9).
    pub compaction_interval_secs: u64,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            sync_queue_fairness: 16,
            preprocessor_retry_budget: 3,
            writeback_backoff_initial_ms: 1_000,
            writeback_backoff_max_ms: 5 * 60 * 1_000,
            network_timeout_secs: 30,
            compaction_revision_threshold: 10_000,
            compaction_interval_secs: 24 * 60 * 60,
        }
    }
}

impl ResourceConfig {
    /// Loads configuration from a TOML file, falling back to [`Default`]
    /// for any field the file omits.
    ///
    /// # Errors
    /// Returns [`ConfigError`] if the file cannot be read or fails to parse.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    #[must_use]
    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    #[must_use]
    pub fn writeback_backoff_initial(&self) -> Duration {
        Duration::from_millis(self.writeback_backoff_initial_ms)
    }

    #[must_use]
    pub fn writeback_backoff_max(&self) -> Duration {
        Duration::from_millis(self.writeback_backoff_max_ms)
    }

    #[must_use]
    pub fn compaction_interval(&self) -> Duration {
        Duration::from_secs(self.compaction_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let config = ResourceConfig::default();
        assert_eq!(config.sync_queue_fairness, 16);
        assert_eq!(config.preprocessor_retry_budget, 3);
        assert_eq!(config.writeback_backoff_initial(), Duration::from_secs(1));
        assert_eq!(config.writeback_backoff_max(), Duration::from_secs(300));
        assert_eq!(config.network_timeout(), Duration::from_secs(30));
        assert_eq!(config.compaction_revision_threshold, 10_000);
    }

    #[test]
    fn load_overlays_partial_toml_onto_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("resource.toml");
        std::fs::write(&path, "sync_queue_fairness = 4\n").unwrap();

        let config = ResourceConfig::load(&path).unwrap();
        assert_eq!(config.sync_queue_fairness, 4);
        assert_eq!(config.preprocessor_retry_budget, 3);
    }

    #[test]
    fn load_missing_file_is_a_read_error() {
        let err = ResourceConfig::load("/nonexistent/resource.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
