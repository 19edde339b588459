//! Engine configuration via `tally.toml`
//!
//! Every field has a default matching the hosted deployment, so an empty
//! file is a valid configuration. The two paths can also be supplied by
//! the environment (`TALLY_INTERNAL_STATE_PATH`, `TALLY_SHARD_COLLECTION`),
//! which is how the hosting platform hands them over.

use crate::error::{Result, TallyError};
use crate::path::{CollectionPath, DocPath};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "tally.toml";

/// Hard cap on documents touched by one transaction
pub const MAX_TRANSACTION_DOCUMENTS: usize = 499;

/// Environment variable overriding `internal_state_path`
pub const ENV_INTERNAL_STATE_PATH: &str = "TALLY_INTERNAL_STATE_PATH";

/// Environment variable overriding `shard_collection_id`
pub const ENV_SHARD_COLLECTION: &str = "TALLY_SHARD_COLLECTION";

/// Worker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Page size of the slice query
    pub shards_limit: usize,
    /// Wall-clock budget of one run in milliseconds
    pub timeout_ms: u64,
    /// Aggregation tick in milliseconds
    pub tick_ms: u64,
    /// Empty partials touched within this window are left alone
    pub recent_update_secs: u64,
    /// Partials with more entries than this are compacted
    pub max_partial_updates: usize,
    /// Keep every Nth consumed path as a split point
    pub split_sample_interval: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shards_limit: 100,
            timeout_ms: 45_000,
            tick_ms: 1_000,
            recent_update_secs: 30,
            max_partial_updates: 10,
            split_sample_interval: 100,
        }
    }
}

impl WorkerConfig {
    /// Run budget
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Tick interval
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Recent-update window for empty partials
    pub fn recent_update_window(&self) -> Duration {
        Duration::from_secs(self.recent_update_secs)
    }
}

/// Controller tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Page limit (and cap) of inline aggregation
    pub inline_shard_limit: usize,
    /// Duration of one continuous inline aggregation window
    pub continuous_timeout_ms: u64,
    /// Interval of the scheduled controller run
    pub schedule_interval_ms: u64,
    /// Workers silent for longer than this are poked
    pub failure_threshold_secs: u64,
    /// Split points per resharded slice
    pub splits_per_slice: usize,
    /// Below this many splits per worker, workers are merged
    pub min_splits_per_worker: usize,
    /// Page size of the extra scan made for overloaded workers
    pub supplementary_scan_limit: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            inline_shard_limit: 200,
            continuous_timeout_ms: 60_000,
            schedule_interval_ms: 60_000,
            failure_threshold_secs: 90,
            splits_per_slice: 20,
            min_splits_per_worker: 10,
            supplementary_scan_limit: 100_000,
        }
    }
}

impl ControllerConfig {
    /// Continuous aggregation window
    pub fn continuous_timeout(&self) -> Duration {
        Duration::from_millis(self.continuous_timeout_ms)
    }

    /// Scheduled run interval
    pub fn schedule_interval(&self) -> Duration {
        Duration::from_millis(self.schedule_interval_ms)
    }

    /// Silence after which a worker is considered failed
    pub fn failure_threshold(&self) -> Duration {
        Duration::from_secs(self.failure_threshold_secs)
    }
}

/// Engine configuration loaded from `tally.toml`.
///
/// # Example
///
/// ```toml
/// shard_collection_id = "_counter_shards_"
/// internal_state_path = "_counter_internal_/controller"
///
/// [worker]
/// shards_limit = 100
///
/// [controller]
/// inline_shard_limit = 200
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TallyConfig {
    /// Id of the shard subcollection under every counter
    pub shard_collection_id: String,
    /// Path of the controller document; workers live in its `workers`
    /// subcollection
    pub internal_state_path: String,
    /// Worker tuning
    pub worker: WorkerConfig,
    /// Controller tuning
    pub controller: ControllerConfig,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            shard_collection_id: "_counter_shards_".to_string(),
            internal_state_path: "_counter_internal_/controller".to_string(),
            worker: WorkerConfig::default(),
            controller: ControllerConfig::default(),
        }
    }
}

impl TallyConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Tally counter aggregation configuration

# Subcollection holding shards under each counter document
shard_collection_id = "_counter_shards_"

# Controller document; worker metadata lives in its "workers" subcollection
internal_state_path = "_counter_internal_/controller"

[worker]
# Slice query page size (at most 499)
shards_limit = 100
# Run budget before writing stats and exiting
timeout_ms = 45000
tick_ms = 1000
# Empty partials written within this window are not deleted yet
recent_update_secs = 30
# Partials with more update entries than this get compacted
max_partial_updates = 10
split_sample_interval = 100

[controller]
# Inline aggregation handles at most this many shards
inline_shard_limit = 200
continuous_timeout_ms = 60000
schedule_interval_ms = 60000
# Workers silent longer than this are re-triggered
failure_threshold_secs = 90
splits_per_slice = 20
min_splits_per_worker = 10
supplementary_scan_limit = 100000
"#
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: TallyConfig = toml::from_str(content)
            .map_err(|e| TallyError::config(format!("failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TallyError::config(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> Result<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Apply `TALLY_*` environment overrides and re-validate.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(ENV_INTERNAL_STATE_PATH) {
            self.internal_state_path = path;
        }
        if let Some(id) = lookup(ENV_SHARD_COLLECTION) {
            self.shard_collection_id = id;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check limits and paths.
    pub fn validate(&self) -> Result<()> {
        if self.shard_collection_id.is_empty() || self.shard_collection_id.contains('/') {
            return Err(TallyError::config(format!(
                "shard_collection_id '{}' must be a single path segment",
                self.shard_collection_id
            )));
        }
        DocPath::parse(self.internal_state_path.as_str())
            .map_err(|e| TallyError::config(format!("internal_state_path: {}", e)))?;

        let w = &self.worker;
        if w.shards_limit == 0 || w.shards_limit > MAX_TRANSACTION_DOCUMENTS {
            return Err(TallyError::config(format!(
                "worker.shards_limit must be within 1..={}",
                MAX_TRANSACTION_DOCUMENTS
            )));
        }
        if w.tick_ms == 0 || w.timeout_ms == 0 || w.split_sample_interval == 0 {
            return Err(TallyError::config(
                "worker tick_ms, timeout_ms and split_sample_interval must be positive",
            ));
        }

        let c = &self.controller;
        if c.inline_shard_limit == 0 || c.inline_shard_limit > MAX_TRANSACTION_DOCUMENTS {
            return Err(TallyError::config(format!(
                "controller.inline_shard_limit must be within 1..={}",
                MAX_TRANSACTION_DOCUMENTS
            )));
        }
        if c.splits_per_slice == 0 {
            return Err(TallyError::config("controller.splits_per_slice must be positive"));
        }
        Ok(())
    }

    /// Controller document path
    pub fn controller_path(&self) -> Result<DocPath> {
        DocPath::parse(self.internal_state_path.as_str())
    }

    /// Collection of worker metadata documents
    pub fn workers_collection(&self) -> Result<CollectionPath> {
        Ok(self.controller_path()?.collection("workers"))
    }
}
