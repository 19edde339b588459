//! Tally - sharded counter aggregation for document databases
//!
//! Writers increment private shard documents; workers and an inline
//! controller fold the shards back into the counter documents.
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tally::{DocPath, MemoryStore, Runtime, ShardedCounter, TallyConfig};
//!
//! tally::init_tracing();
//! let store = Arc::new(MemoryStore::new());
//! let config = TallyConfig::default();
//! let mut runtime = Runtime::start(Arc::clone(&store), config.clone())?;
//!
//! let counter = ShardedCounter::new(
//!     Arc::clone(&store),
//!     DocPath::parse("pages/home")?,
//!     &config.shard_collection_id,
//! )?;
//! counter.increment_by("visits", 1)?;
//! let visits = counter.get("visits")?;
//! runtime.shutdown();
//! ```
//!
//! # Crates
//!
//! - `tally-core`: paths, shard keys, numeric folding, records, config
//! - `tally-storage`: the `DocumentStore` contract and `MemoryStore`
//! - `tally-engine`: aggregator, planner, worker, controller, runtime

pub use tally_core::{
    Clock, ControllerConfig, ControllerData, DocPath, Document, ManualClock, NumericUpdate,
    Result, ShardKey, Slice, SystemClock, TallyConfig, TallyError, Timestamp, WorkerConfig,
    WorkerMetadata, WorkerStats, CONFIG_FILE_NAME,
};
pub use tally_engine::{
    balance_workers, plan_aggregations, Aggregator, Controller, ControllerStatus, ExitReason,
    Runtime, ShardedCounter, Worker, WorkerReport,
};
pub use tally_storage::{DocumentStore, MemoryStore, RangeQuery, RetryConfig, SetMode, Transaction};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Returns `false` if a global subscriber was already installed, so it is
/// safe to call more than once.
pub fn init_tracing() -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init()
        .is_ok()
}
