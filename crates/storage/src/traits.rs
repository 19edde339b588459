//! Store abstraction the aggregation engine runs against
//!
//! The engine only needs a small document database contract: point reads,
//! ordered range queries, set/merge/delete, array union/remove transforms,
//! optimistic transactions and change listeners. `MemoryStore` is the
//! bundled implementation.

use crate::query::RangeQuery;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::write::{SetMode, Write};
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use serde_json::Value;
use std::time::Duration;
use tally_core::{DocPath, Document, Result, Timestamp};

// ============================================================================
// Transaction
// ============================================================================

/// Operations available inside `DocumentStore::run_transaction`.
///
/// Reads observe committed state and are recorded for validation. Writes are
/// buffered and applied atomically at commit. All reads must happen before
/// the first write.
pub trait Transaction {
    /// Read one document.
    fn get(&mut self, path: &DocPath) -> Result<DocumentSnapshot>;

    /// Read several documents in order.
    fn get_all(&mut self, paths: &[DocPath]) -> Result<Vec<DocumentSnapshot>> {
        paths.iter().map(|path| self.get(path)).collect()
    }

    /// Run a range query; its result is validated at commit.
    fn query(&mut self, query: &RangeQuery) -> Result<QuerySnapshot>;

    /// Buffer a write.
    fn write(&mut self, write: Write);

    /// Buffer a set.
    fn set(&mut self, path: &DocPath, data: Document, mode: SetMode) {
        self.write(Write::Set {
            path: path.clone(),
            data,
            mode,
        });
    }

    /// Buffer a delete.
    fn delete(&mut self, path: &DocPath) {
        self.write(Write::Delete { path: path.clone() });
    }

    /// Buffer an array union on a top-level field.
    fn array_union(&mut self, path: &DocPath, field: &str, values: Vec<Value>) {
        self.write(Write::ArrayUnion {
            path: path.clone(),
            field: field.to_string(),
            values,
        });
    }

    /// Buffer an array remove on a top-level field.
    fn array_remove(&mut self, path: &DocPath, field: &str, values: Vec<Value>) {
        self.write(Write::ArrayRemove {
            path: path.clone(),
            field: field.to_string(),
            values,
        });
    }
}

// ============================================================================
// DocumentStore
// ============================================================================

/// Document database contract.
///
/// Implementations are shared across threads behind an `Arc`.
pub trait DocumentStore: Send + Sync + 'static {
    /// Transaction handle passed to `run_transaction` closures
    type Txn: Transaction;

    /// Store time used for update timestamps
    fn now(&self) -> Timestamp;

    /// Read one document.
    fn get(&self, path: &DocPath) -> Result<DocumentSnapshot>;

    /// Run a range query.
    fn query(&self, query: &RangeQuery) -> Result<QuerySnapshot>;

    /// Apply writes atomically without read validation.
    fn write_batch(&self, writes: Vec<Write>) -> Result<()>;

    /// Run `f` in an optimistic transaction.
    ///
    /// On a read conflict the closure runs again with a fresh transaction,
    /// up to the store's attempt limit, after which
    /// `TallyError::TransactionConflict` is returned. Errors returned by the
    /// closure abort the transaction without retry and without writing.
    fn run_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnMut(&mut Self::Txn) -> Result<T>;

    /// Listen to one document. The current state is delivered first.
    fn subscribe_document(&self, path: &DocPath) -> Result<Subscription<DocumentSnapshot>>;

    /// Listen to a query. The current result is delivered first, then a new
    /// snapshot whenever the result changes.
    fn subscribe_query(&self, query: &RangeQuery) -> Result<Subscription<QuerySnapshot>>;

    /// Create or replace/merge a document.
    fn set(&self, path: &DocPath, data: Document, mode: SetMode) -> Result<()> {
        self.write_batch(vec![Write::Set {
            path: path.clone(),
            data,
            mode,
        }])
    }

    /// Delete a document.
    fn delete(&self, path: &DocPath) -> Result<()> {
        self.write_batch(vec![Write::Delete { path: path.clone() }])
    }

    /// Union values into an array field.
    fn array_union(&self, path: &DocPath, field: &str, values: Vec<Value>) -> Result<()> {
        self.write_batch(vec![Write::ArrayUnion {
            path: path.clone(),
            field: field.to_string(),
            values,
        }])
    }

    /// Remove values from an array field.
    fn array_remove(&self, path: &DocPath, field: &str, values: Vec<Value>) -> Result<()> {
        self.write_batch(vec![Write::ArrayRemove {
            path: path.clone(),
            field: field.to_string(),
            values,
        }])
    }
}

// ============================================================================
// Subscription
// ============================================================================

/// Stream of snapshots from a listener.
///
/// Dropping the subscription unregisters the listener at the next change.
pub struct Subscription<T> {
    rx: Receiver<T>,
}

impl<T> Subscription<T> {
    /// Wrap a channel receiver.
    pub fn new(rx: Receiver<T>) -> Self {
        Subscription { rx }
    }

    /// Underlying receiver, for use with `crossbeam_channel::select!`
    pub fn receiver(&self) -> &Receiver<T> {
        &self.rx
    }

    /// Next snapshot if one is queued.
    pub fn try_recv(&self) -> Option<T> {
        match self.rx.try_recv() {
            Ok(item) => Some(item),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Wait up to `timeout` for the next snapshot.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(item) => Some(item),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain the queue and return the newest snapshot.
    pub fn latest(&self) -> Option<T> {
        let mut newest = None;
        while let Some(item) = self.try_recv() {
            newest = Some(item);
        }
        newest
    }
}
