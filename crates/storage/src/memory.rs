//! In-memory document store
//!
//! Documents live in a `BTreeMap` keyed by path (segment order) behind a
//! `RwLock`. Every commit takes the next value of a global version counter;
//! each written document carries that version and the store clock's time.
//!
//! # Design Notes
//!
//! - Commit = validate read set and query set, then apply writes, all under
//!   the write lock
//! - Listeners are notified after the write lock is released, before the
//!   committing call returns
//! - Lock order is watchers, then documents

use crate::query::RangeQuery;
use crate::retry::RetryConfig;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crate::traits::{DocumentStore, Subscription};
use crate::transaction::MemoryTransaction;
use crate::validation::{validate_query_set, validate_read_set, ValidationResult};
use crate::watch::WatchRegistry;
use crate::write::Write;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use tally_core::{Clock, DocPath, Document, Result, SystemClock, TallyError, Timestamp};
use tracing::{debug, trace};

/// Most writes a single commit may carry
pub const MAX_WRITES_PER_COMMIT: usize = 500;

/// A stored document body with its commit metadata
#[derive(Debug, Clone)]
pub(crate) struct StoredDoc {
    pub(crate) data: Document,
    pub(crate) version: u64,
    pub(crate) update_time: Timestamp,
}

impl StoredDoc {
    pub(crate) fn snapshot(&self, path: &DocPath) -> DocumentSnapshot {
        DocumentSnapshot {
            path: path.clone(),
            data: Some(self.data.clone()),
            version: self.version,
            update_time: self.update_time,
        }
    }
}

pub(crate) fn snapshot_of(docs: &BTreeMap<DocPath, StoredDoc>, path: &DocPath) -> DocumentSnapshot {
    match docs.get(path) {
        Some(stored) => stored.snapshot(path),
        None => DocumentSnapshot::missing(path.clone()),
    }
}

/// Documents matching `query`, in path order, limit applied.
pub(crate) fn evaluate_query<'a>(
    docs: &'a BTreeMap<DocPath, StoredDoc>,
    query: &'a RangeQuery,
) -> impl Iterator<Item = (&'a DocPath, &'a StoredDoc)> + 'a {
    let start = query
        .start_at
        .as_deref()
        .and_then(|start| DocPath::parse(start).ok());
    let candidates: Box<dyn Iterator<Item = (&'a DocPath, &'a StoredDoc)> + 'a> = match start {
        Some(start) => Box::new(docs.range(start..)),
        None => Box::new(docs.iter()),
    };
    candidates
        .skip_while(move |(path, _)| query.is_before_start(path))
        .take_while(move |(path, _)| !query.is_past_end(path))
        .filter(move |(path, _)| query.in_scope(path))
        .take(query.limit.unwrap_or(usize::MAX))
}

pub(crate) enum CommitOutcome {
    Committed,
    Conflict(ValidationResult),
}

/// Shared state behind every `MemoryStore` clone
pub(crate) struct StoreState {
    docs: RwLock<BTreeMap<DocPath, StoredDoc>>,
    version: AtomicU64,
    clock: Arc<dyn Clock>,
    watchers: Mutex<WatchRegistry>,
    read_faults: RwLock<Vec<String>>,
}

impl StoreState {
    fn check_read(&self, path: &DocPath) -> Result<()> {
        let faults = self.read_faults.read();
        if faults.iter().any(|prefix| path.as_str().starts_with(prefix.as_str())) {
            return Err(TallyError::storage(format!("read of {} failed", path)));
        }
        Ok(())
    }

    pub(crate) fn read_document(&self, path: &DocPath) -> Result<DocumentSnapshot> {
        self.check_read(path)?;
        Ok(snapshot_of(&self.docs.read(), path))
    }

    pub(crate) fn read_query(&self, query: &RangeQuery) -> Result<QuerySnapshot> {
        let docs: Vec<DocumentSnapshot> = {
            let guard = self.docs.read();
            evaluate_query(&guard, query)
                .map(|(path, stored)| stored.snapshot(path))
                .collect()
        };
        for doc in &docs {
            self.check_read(&doc.path)?;
        }
        Ok(QuerySnapshot::diff(&[], docs))
    }

    pub(crate) fn commit(
        &self,
        read_set: &HashMap<DocPath, u64>,
        query_set: &[(RangeQuery, Vec<(DocPath, u64)>)],
        writes: Vec<Write>,
    ) -> Result<CommitOutcome> {
        if writes.len() > MAX_WRITES_PER_COMMIT {
            return Err(TallyError::InvalidOperation(format!(
                "commit carries {} writes, limit is {}",
                writes.len(),
                MAX_WRITES_PER_COMMIT
            )));
        }

        let changed = {
            let mut docs = self.docs.write();
            let mut validation = validate_read_set(read_set, &docs);
            validation.merge(validate_query_set(query_set, &docs));
            if !validation.is_valid() {
                return Ok(CommitOutcome::Conflict(validation));
            }
            if writes.is_empty() {
                return Ok(CommitOutcome::Committed);
            }

            let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            let update_time = self.clock.now();
            let mut changed = Vec::with_capacity(writes.len());
            for write in writes {
                let path = write.path().clone();
                let current = docs.remove(&path).map(|stored| stored.data);
                if let Some(data) = write.apply(current) {
                    docs.insert(
                        path.clone(),
                        StoredDoc {
                            data,
                            version,
                            update_time,
                        },
                    );
                }
                if !changed.contains(&path) {
                    changed.push(path);
                }
            }
            trace!(target: "tally::storage", version, writes = changed.len(), "commit applied");
            changed
        };

        let mut watchers = self.watchers.lock();
        watchers.notify(&changed, &self.docs.read());
        Ok(CommitOutcome::Committed)
    }
}

/// Thread-safe in-memory document store.
///
/// Clones share the same data.
///
/// # Example
///
/// ```ignore
/// let store = MemoryStore::new();
/// let path = DocPath::parse("pages/home")?;
/// store.set(&path, doc, SetMode::Merge)?;
/// let snapshot = store.get(&path)?;
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<StoreState>,
    retry: RetryConfig,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Empty store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping writes with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        MemoryStore {
            state: Arc::new(StoreState {
                docs: RwLock::new(BTreeMap::new()),
                version: AtomicU64::new(0),
                clock,
                watchers: Mutex::new(WatchRegistry::default()),
                read_faults: RwLock::new(Vec::new()),
            }),
            retry: RetryConfig::default(),
        }
    }

    /// Replace the transaction retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Make every read of a document under `prefix` fail with a storage
    /// error, inside and outside transactions. Listeners are unaffected.
    pub fn fail_reads_under(&self, prefix: impl Into<String>) {
        self.state.read_faults.write().push(prefix.into());
    }

    /// Remove all injected read failures.
    pub fn clear_read_faults(&self) {
        self.state.read_faults.write().clear();
    }

    /// Number of stored documents
    pub fn len(&self) -> usize {
        self.state.docs.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.state.docs.read().is_empty()
    }

    /// All document paths in order
    pub fn paths(&self) -> Vec<DocPath> {
        self.state.docs.read().keys().cloned().collect()
    }

    /// Version of the latest commit
    pub fn current_version(&self) -> u64 {
        self.state.version.load(Ordering::SeqCst)
    }

    /// Registered listeners (dropped ones are counted until the next
    /// change reaches them)
    pub fn listener_count(&self) -> usize {
        self.state.watchers.lock().len()
    }
}

impl DocumentStore for MemoryStore {
    type Txn = MemoryTransaction;

    fn now(&self) -> Timestamp {
        self.state.clock.now()
    }

    fn get(&self, path: &DocPath) -> Result<DocumentSnapshot> {
        self.state.read_document(path)
    }

    fn query(&self, query: &RangeQuery) -> Result<QuerySnapshot> {
        self.state.read_query(query)
    }

    fn write_batch(&self, writes: Vec<Write>) -> Result<()> {
        match self.state.commit(&HashMap::new(), &[], writes)? {
            CommitOutcome::Committed => Ok(()),
            CommitOutcome::Conflict(validation) => Err(TallyError::TransactionConflict {
                attempts: 1,
                reason: validation.describe(),
            }),
        }
    }

    fn run_transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut MemoryTransaction) -> Result<T>,
    {
        let mut conflicts = 0usize;
        loop {
            let mut txn = MemoryTransaction::new(Arc::clone(&self.state));
            let value = f(&mut txn)?;
            let writes = std::mem::take(&mut txn.writes);
            let validation = match self.state.commit(&txn.read_set, &txn.query_set, writes)? {
                CommitOutcome::Committed => return Ok(value),
                CommitOutcome::Conflict(validation) => validation,
            };

            conflicts += 1;
            debug!(
                target: "tally::storage",
                attempt = conflicts,
                reason = %validation.describe(),
                "Transaction conflict"
            );
            match self.retry.next_backoff(conflicts) {
                Some(pause) => thread::sleep(pause),
                None => {
                    return Err(TallyError::TransactionConflict {
                        attempts: conflicts,
                        reason: validation.describe(),
                    })
                }
            }
        }
    }

    fn subscribe_document(&self, path: &DocPath) -> Result<Subscription<DocumentSnapshot>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watchers = self.state.watchers.lock();
        let initial = snapshot_of(&self.state.docs.read(), path);
        watchers.add_document(initial, tx);
        Ok(Subscription::new(rx))
    }

    fn subscribe_query(&self, query: &RangeQuery) -> Result<Subscription<QuerySnapshot>> {
        let (tx, rx) = crossbeam_channel::unbounded();
        let mut watchers = self.state.watchers.lock();
        let initial = {
            let docs = self.state.docs.read();
            evaluate_query(&docs, query)
                .map(|(path, stored)| stored.snapshot(path))
                .collect()
        };
        watchers.add_query(query.clone(), initial, tx);
        Ok(Subscription::new(rx))
    }
}
