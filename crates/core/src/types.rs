//! Records shared between the controller and its workers
//!
//! These are stored as documents in the internal state collection:
//! - the controller document lists the active slices
//! - one worker metadata document per slice, rewritten with run stats

use crate::error::Result;
use crate::numeric::Document;
use crate::path::compare_paths;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::fmt;

/// Half-open range `[start, end)` of shard document paths.
///
/// An empty string is an open boundary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Slice {
    /// First path in the slice (inclusive); `""` = unbounded
    #[serde(default)]
    pub start: String,
    /// Path after the slice (exclusive); `""` = unbounded
    #[serde(default)]
    pub end: String,
}

impl Slice {
    /// Create a slice.
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Slice {
            start: start.into(),
            end: end.into(),
        }
    }

    /// The whole keyspace
    pub fn full() -> Self {
        Slice::default()
    }

    /// Whether both boundaries are open
    pub fn is_full(&self) -> bool {
        self.start.is_empty() && self.end.is_empty()
    }

    /// Whether `path` falls inside the slice.
    pub fn contains(&self, path: &str) -> bool {
        let after_start =
            self.start.is_empty() || compare_paths(path, &self.start) != Ordering::Less;
        let before_end = self.end.is_empty() || compare_paths(path, &self.end) == Ordering::Less;
        after_start && before_end
    }
}

impl fmt::Display for Slice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |s: &str| if s.is_empty() { "*".to_string() } else { s.escape_debug().to_string() };
        write!(f, "[{}, {})", show(&self.start), show(&self.end))
    }
}

/// Statistics a worker writes at the end of a successful run
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStats {
    /// Epoch millis of the run's end
    pub last_successful_run: i64,
    /// Number of shards consumed
    pub shards_aggregated: u64,
    /// Consumed shard paths, sorted and sampled every Nth element
    #[serde(default)]
    pub splits: Vec<String>,
    /// Number of aggregation rounds
    pub rounds: u64,
    /// Rounds whose page was full
    pub rounds_capped: u64,
}

impl WorkerStats {
    /// Every round hit the page limit. A run without rounds is not
    /// overloaded.
    pub fn is_overloaded(&self) -> bool {
        self.rounds > 0 && self.rounds == self.rounds_capped
    }
}

/// Worker metadata document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkerMetadata {
    /// Slice owned by the worker
    pub slice: Slice,
    /// Present once the worker completed a run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<WorkerStats>,
    /// Bumped on every write so watchers see a change
    #[serde(default)]
    pub timestamp: i64,
}

/// Controller document
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ControllerData {
    /// Slices of the running workers; empty = aggregate inline
    #[serde(default)]
    pub workers: Vec<Slice>,
    /// Bumped on every controller write
    #[serde(default)]
    pub timestamp: i64,
}

/// Convert a record into a document body.
pub fn to_document<T: Serialize>(record: &T) -> Result<Document> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(crate::error::TallyError::invalid_input(format!(
            "record serialized to non-object {}",
            other
        ))),
    }
}

/// Parse a document body into a record.
pub fn from_document<T: for<'de> Deserialize<'de>>(doc: &Document) -> Result<T> {
    Ok(serde_json::from_value(Value::Object(doc.clone()))?)
}
