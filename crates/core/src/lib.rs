//! Core types for the tally counter aggregation engine
//!
//! This crate defines the foundational types used throughout the system:
//! - TallyError: Error taxonomy shared by every layer
//! - DocPath / CollectionPath: Document store paths with segment ordering
//! - ShardKey: Decoded shard ids (plain shard vs partial)
//! - NumericUpdate: Accumulator merging nested numeric documents
//! - Partial helpers: `_updates_` entries, folding, compaction
//! - Slice, WorkerStats, WorkerMetadata, ControllerData: internal records
//! - Clock: Injectable wall clock
//! - TallyConfig: `tally.toml` configuration

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod error;
pub mod numeric;
pub mod partial;
pub mod path;
pub mod shard_key;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{ControllerConfig, TallyConfig, WorkerConfig, CONFIG_FILE_NAME};
pub use error::{Result, TallyError};
pub use numeric::{Document, NumericUpdate};
pub use partial::{UpdateEntry, UPDATES_FIELD};
pub use path::{compare_paths, CollectionPath, DocPath};
pub use shard_key::ShardKey;
pub use types::{ControllerData, Slice, WorkerMetadata, WorkerStats};
