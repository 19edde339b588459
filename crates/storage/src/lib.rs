//! Document store layer for tally
//!
//! This crate defines the store contract the aggregation engine runs on and
//! an in-memory implementation:
//! - DocumentStore / Transaction: point reads, range queries, writes,
//!   optimistic transactions, change listeners
//! - MemoryStore: BTreeMap-based storage with RwLock and a global version
//!   counter
//! - RangeQuery: collection and collection-group queries in path order
//! - Commit-time validation of read sets and query results
//!
//! # Transactions
//!
//! Transactions are optimistic. Reads record versions, writes are buffered,
//! and commit fails on any changed read. `run_transaction` re-runs the
//! closure on conflict, five attempts by default.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod query;
pub mod retry;
pub mod snapshot;
pub mod traits;
pub mod transaction;
pub mod validation;
mod watch;
pub mod write;

pub use memory::{MemoryStore, MAX_WRITES_PER_COMMIT};
pub use query::{QueryScope, RangeQuery};
pub use retry::RetryConfig;
pub use snapshot::{ChangeKind, DocumentChange, DocumentSnapshot, QuerySnapshot};
pub use traits::{DocumentStore, Subscription, Transaction};
pub use transaction::MemoryTransaction;
pub use validation::{ConflictType, ValidationResult};
pub use write::{deep_merge, SetMode, Write};
