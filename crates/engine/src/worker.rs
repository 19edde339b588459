//! Worker: long-lived aggregation of one slice
//!
//! A worker owns the shards of one slice, described by its metadata
//! document under the controller's `workers` collection. It listens to the
//! slice and, every tick, folds the latest page of shards into counters and
//! partials.
//!
//! # Ownership
//!
//! Every aggregation transaction re-reads the metadata document and aborts
//! if it differs from the copy the worker was started with. The controller
//! rewrites metadata documents when it reshards, so a stale worker can never
//! commit into a slice it no longer owns.
//!
//! # Self-scheduling
//!
//! At the end of a run the worker merges its stats into the metadata
//! document. That write is itself the change that starts the next run.

use crate::aggregator::{AggregateUpdate, Aggregator};
use crate::planner::{is_aggregatable, plan_aggregations, AggregationPlan};
use crossbeam_channel::{after, never, select, tick, unbounded, Receiver};
use rayon::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tally_core::partial::{self, UPDATES_FIELD};
use tally_core::types::from_document;
use tally_core::{
    compare_paths, DocPath, Document, Result, Slice, TallyConfig, TallyError, Timestamp,
    WorkerConfig, WorkerMetadata, WorkerStats,
};
use tally_storage::{DocumentSnapshot, DocumentStore, RangeQuery, SetMode, Transaction};
use tracing::{debug, info, warn};

// ============================================================================
// Public types
// ============================================================================

/// Lifecycle of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Constructed, not yet running
    Starting,
    /// Listening and aggregating
    Running,
    /// Waiting for the in-flight round, then writing stats
    ShuttingDown,
    /// Run finished
    Terminated,
}

/// Why a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The run budget elapsed
    Timeout,
    /// The metadata document changed or vanished
    MetadataChanged,
    /// Single-run mode found the slice empty
    SingleRunDrained,
    /// The owner asked the worker to stop
    Cancelled,
}

/// Outcome of `Worker::run`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// Why the run ended
    pub exit: ExitReason,
    /// Stats gathered during the run
    pub stats: WorkerStats,
    /// Plans whose transaction failed
    pub failed_plans: usize,
    /// Rounds that ended without reporting an outcome
    pub lost_rounds: usize,
    /// Whether the stats were committed to the metadata document
    pub stats_written: bool,
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Split a page into `(to_aggregate, to_cleanup)`.
///
/// - shards with no counter above them are dropped
/// - empty partials go to cleanup, unless touched within the recent window
///   (single-run workers clean them regardless)
/// - partials with many entries go to both lists
/// - everything else is aggregated
pub fn categorize_shards(
    shards: &[DocumentSnapshot],
    now: Timestamp,
    config: &WorkerConfig,
    single_run: bool,
) -> (Vec<DocumentSnapshot>, Vec<DocumentSnapshot>) {
    let mut to_aggregate = Vec::new();
    let mut to_cleanup = Vec::new();

    for shard in shards {
        if !is_aggregatable(&shard.path) {
            warn!(target: "tally::worker", shard = %shard.path, "Shard has no counter document, skipping");
            continue;
        }
        let Some(data) = &shard.data else {
            to_aggregate.push(shard.clone());
            continue;
        };
        if partial::is_empty_partial(data) {
            let recent =
                now.saturating_duration_since(shard.update_time) < config.recent_update_window();
            if single_run || !recent {
                to_cleanup.push(shard.clone());
            }
            continue;
        }
        if partial::contains_many_updates(data, config.max_partial_updates) {
            to_cleanup.push(shard.clone());
        }
        to_aggregate.push(shard.clone());
    }

    (to_aggregate, to_cleanup)
}

/// Sort consumed paths and keep every `interval`-th one, skipping the first.
pub fn sample_splits(mut paths: Vec<String>, interval: usize) -> Vec<String> {
    let interval = interval.max(1);
    paths.sort_by(|a, b| compare_paths(a, b));
    paths
        .into_iter()
        .enumerate()
        .filter(|(i, _)| *i != 0 && i % interval == 0)
        .map(|(_, path)| path)
        .collect()
}

/// Stage one aggregation into `txn` from snapshots read in that
/// transaction. Returns the paths of the shards it deletes.
///
/// The update goes to `target` (merge for a counter, appended entry for a
/// partial). Existing shards are deleted; each existing partial gets an
/// entry cancelling what was read from it.
pub(crate) fn stage_aggregation<T: Transaction>(
    txn: &mut T,
    aggregator: &Aggregator,
    target: &DocPath,
    counter: Option<&DocumentSnapshot>,
    partials: &[DocumentSnapshot],
    shards: &[DocumentSnapshot],
) -> Vec<String> {
    match aggregator.aggregate(counter, partials, shards) {
        AggregateUpdate::Counter(update) => {
            if !update.is_empty() {
                txn.set(target, update, SetMode::Merge);
            }
        }
        AggregateUpdate::Partial(Some(entry)) => {
            txn.array_union(target, UPDATES_FIELD, vec![entry.to_value()]);
        }
        AggregateUpdate::Partial(None) => {}
    }

    let mut consumed = Vec::with_capacity(shards.len());
    for shard in shards.iter().filter(|s| s.exists()) {
        consumed.push(shard.path.as_str().to_string());
        txn.delete(&shard.path);
    }
    for partial in partials.iter().filter(|p| p.exists()) {
        if let Some(entry) = aggregator.subtract_partial(partial) {
            txn.array_union(&partial.path, UPDATES_FIELD, vec![entry.to_value()]);
        }
    }
    consumed
}

// ============================================================================
// Round execution
// ============================================================================

#[derive(Debug, Default)]
struct RoundOutcome {
    consumed: Vec<String>,
    failed_plans: usize,
}

/// Everything a round needs, shared with the round thread.
struct RoundContext<S: DocumentStore> {
    store: Arc<S>,
    metadoc_path: DocPath,
    metadata: Document,
    aggregator: Aggregator,
    slice_start: String,
    config: WorkerConfig,
    single_run: bool,
}

impl<S: DocumentStore> RoundContext<S> {
    fn owns(&self, snapshot: &DocumentSnapshot) -> bool {
        snapshot.data.as_ref() == Some(&self.metadata)
    }

    fn run_round(&self, page: &[DocumentSnapshot]) -> RoundOutcome {
        let (to_aggregate, to_cleanup) =
            categorize_shards(page, self.store.now(), &self.config, self.single_run);

        let plans = match plan_aggregations(&self.slice_start, &to_aggregate) {
            Ok(plans) => plans,
            Err(e) => {
                warn!(target: "tally::worker", worker = %self.metadoc_path, error = %e, "Planning failed, skipping round");
                Vec::new()
            }
        };
        debug!(
            target: "tally::worker",
            worker = %self.metadoc_path,
            plans = plans.len(),
            cleanup = to_cleanup.len(),
            "Starting round"
        );

        let (results, ()) = rayon::join(
            || {
                plans
                    .par_iter()
                    .map(|plan| (plan, self.execute_plan(plan)))
                    .collect::<Vec<_>>()
            },
            || {
                to_cleanup.par_iter().for_each(|partial| {
                    if let Err(e) = self.cleanup_partial(partial) {
                        warn!(target: "tally::worker", partial = %partial.path, error = %e, "Partial cleanup failed, skipping");
                    }
                })
            },
        );

        let mut outcome = RoundOutcome::default();
        for (plan, result) in results {
            match result {
                Ok(paths) => outcome.consumed.extend(paths),
                Err(e) => {
                    outcome.failed_plans += 1;
                    warn!(target: "tally::worker", target_doc = %plan.target, error = %e, "Aggregation transaction failed, skipping");
                }
            }
        }
        outcome
    }

    fn execute_plan(&self, plan: &AggregationPlan<DocumentSnapshot>) -> Result<Vec<String>> {
        let shard_paths: Vec<DocPath> = plan.shards.iter().map(|s| s.path.clone()).collect();
        let partial_paths: Vec<DocPath> = plan.partials.iter().map(|p| p.path.clone()).collect();

        self.store.run_transaction(|txn| {
            let metadoc = txn.get(&self.metadoc_path)?;
            if !self.owns(&metadoc) {
                return Err(TallyError::ownership_lost(self.metadoc_path.as_str()));
            }
            let counter = if plan.is_partial {
                None
            } else {
                Some(txn.get(&plan.target)?)
            };
            let shards = txn.get_all(&shard_paths)?;
            let partials = txn.get_all(&partial_paths)?;

            Ok(stage_aggregation(
                txn,
                &self.aggregator,
                &plan.target,
                counter.as_ref(),
                &partials,
                &shards,
            ))
        })
    }

    /// Delete an empty partial, or rewrite a long one as a single entry.
    fn cleanup_partial(&self, partial: &DocumentSnapshot) -> Result<()> {
        self.store.run_transaction(|txn| {
            let snapshot = txn.get(&partial.path)?;
            let Some(data) = &snapshot.data else {
                return Ok(());
            };
            if partial::is_empty_partial(data) {
                txn.delete(&snapshot.path);
            } else if let Some(entry) = self.aggregator.compact(&snapshot) {
                txn.set(
                    &snapshot.path,
                    partial::compacted_document(&entry),
                    SetMode::Overwrite,
                );
            }
            Ok(())
        })
    }
}

// ============================================================================
// Worker
// ============================================================================

/// Aggregates one slice until its budget runs out or it loses ownership.
pub struct Worker<S: DocumentStore> {
    store: Arc<S>,
    metadoc_path: DocPath,
    metadata_doc: Document,
    metadata: WorkerMetadata,
    config: WorkerConfig,
    shard_collection_id: String,
    single_run: bool,
    aggregator: Aggregator,
    cancel: Receiver<()>,
    state: WorkerState,
}

impl<S: DocumentStore> Worker<S> {
    /// Build a worker from its metadata document.
    ///
    /// Fails with `InvalidInput` if the document does not exist or is not
    /// a worker record.
    pub fn new(
        store: Arc<S>,
        metadoc: &DocumentSnapshot,
        config: &TallyConfig,
        single_run: bool,
    ) -> Result<Self> {
        let metadata_doc = metadoc.data.clone().ok_or_else(|| {
            TallyError::invalid_input(format!("worker metadata {} does not exist", metadoc.path))
        })?;
        let metadata: WorkerMetadata = from_document(&metadata_doc).map_err(|e| {
            TallyError::invalid_input(format!("worker metadata {}: {}", metadoc.path, e))
        })?;

        Ok(Worker {
            store,
            metadoc_path: metadoc.path.clone(),
            metadata_doc,
            metadata,
            config: config.worker.clone(),
            shard_collection_id: config.shard_collection_id.clone(),
            single_run,
            aggregator: Aggregator::new(),
            cancel: never(),
            state: WorkerState::Starting,
        })
    }

    /// Use a custom aggregator (entry ids).
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Stop the run when `cancel` yields a value or disconnects.
    pub fn with_cancel(mut self, cancel: Receiver<()>) -> Self {
        self.cancel = cancel;
        self
    }

    /// Current lifecycle state
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Slice owned by this worker
    pub fn slice(&self) -> &Slice {
        &self.metadata.slice
    }

    /// Metadata document path
    pub fn path(&self) -> &DocPath {
        &self.metadoc_path
    }

    /// Run until timeout, metadata change, drain (single run) or cancel.
    ///
    /// At most one round is in flight; ticks that land while a round runs
    /// are dropped. On exit the in-flight round is awaited, then stats are
    /// merged into the metadata document unless ownership was lost.
    pub fn run(&mut self) -> Result<WorkerReport> {
        if self.state != WorkerState::Starting {
            return Err(TallyError::InvalidOperation(format!(
                "worker {} already ran",
                self.metadoc_path
            )));
        }
        self.state = WorkerState::Running;
        info!(target: "tally::worker", worker = %self.metadoc_path, slice = %self.metadata.slice, single_run = self.single_run, "Worker started");

        let ctx = Arc::new(RoundContext {
            store: Arc::clone(&self.store),
            metadoc_path: self.metadoc_path.clone(),
            metadata: self.metadata_doc.clone(),
            aggregator: self.aggregator.clone(),
            slice_start: self.metadata.slice.start.clone(),
            config: self.config.clone(),
            single_run: self.single_run,
        });

        let metadata_sub = self.store.subscribe_document(&self.metadoc_path)?;
        let slice_query = RangeQuery::slice(
            &self.shard_collection_id,
            &self.metadata.slice,
            self.config.shards_limit,
        );
        let shards_sub = self.store.subscribe_query(&slice_query)?;
        let ticker = tick(self.config.tick());
        let deadline = after(self.config.timeout());
        let (done_tx, done_rx) = unbounded::<RoundOutcome>();

        let mut page: Option<Vec<DocumentSnapshot>> = None;
        let mut in_flight: Option<JoinHandle<()>> = None;
        let mut consumed: Vec<String> = Vec::new();
        let mut failed_plans = 0usize;
        let mut lost_rounds = 0usize;
        let mut rounds = 0u64;
        let mut rounds_capped = 0u64;

        let exit = loop {
            select! {
                recv(metadata_sub.receiver()) -> msg => match msg {
                    Ok(snapshot) if ctx.owns(&snapshot) => {}
                    Ok(_) => {
                        info!(target: "tally::worker", worker = %self.metadoc_path, "Metadata changed, shutting down");
                        break ExitReason::MetadataChanged;
                    }
                    Err(_) => break ExitReason::Cancelled,
                },
                recv(shards_sub.receiver()) -> msg => match msg {
                    Ok(snapshot) => {
                        if self.single_run && snapshot.is_empty() {
                            info!(target: "tally::worker", worker = %self.metadoc_path, "Slice drained, single run done");
                            break ExitReason::SingleRunDrained;
                        }
                        page = Some(snapshot.docs);
                    }
                    Err(_) => break ExitReason::Cancelled,
                },
                recv(done_rx) -> outcome => {
                    if let Ok(outcome) = outcome {
                        consumed.extend(outcome.consumed);
                        failed_plans += outcome.failed_plans;
                    }
                    if let Some(handle) = in_flight.take() {
                        if handle.join().is_err() {
                            warn!(target: "tally::worker", worker = %self.metadoc_path, "Round thread panicked");
                        }
                    }
                },
                recv(ticker) -> _ => {
                    if let Some(handle) = &in_flight {
                        if !handle.is_finished() {
                            continue;
                        }
                        // A finished round sent its outcome before returning,
                        // so it may be queued behind this tick.
                        let queued = done_rx.try_recv();
                        if let Some(handle) = in_flight.take() {
                            if handle.join().is_err() {
                                warn!(target: "tally::worker", worker = %self.metadoc_path, "Round thread panicked");
                            }
                        }
                        match queued {
                            Ok(outcome) => {
                                consumed.extend(outcome.consumed);
                                failed_plans += outcome.failed_plans;
                            }
                            Err(_) => {
                                lost_rounds += 1;
                                warn!(target: "tally::worker", worker = %self.metadoc_path, "Round ended without an outcome");
                            }
                        }
                    }
                    let Some(docs) = page.clone() else {
                        continue;
                    };

                    rounds += 1;
                    if docs.len() == self.config.shards_limit {
                        rounds_capped += 1;
                    }
                    if docs.is_empty() {
                        continue;
                    }

                    let ctx = Arc::clone(&ctx);
                    let done_tx = done_tx.clone();
                    let spawned = thread::Builder::new()
                        .name("tally-worker-round".to_string())
                        .spawn(move || {
                            let outcome = ctx.run_round(&docs);
                            let _ = done_tx.send(outcome);
                        });
                    match spawned {
                        Ok(handle) => in_flight = Some(handle),
                        Err(e) => {
                            warn!(target: "tally::worker", worker = %self.metadoc_path, error = %e, "Failed to start round");
                        }
                    }
                },
                recv(deadline) -> _ => break ExitReason::Timeout,
                recv(self.cancel) -> _ => break ExitReason::Cancelled,
            }
        };

        self.state = WorkerState::ShuttingDown;
        drop(metadata_sub);
        drop(shards_sub);
        drop(done_tx);
        if let Some(handle) = in_flight.take() {
            match done_rx.recv() {
                Ok(outcome) => {
                    consumed.extend(outcome.consumed);
                    failed_plans += outcome.failed_plans;
                }
                Err(_) => lost_rounds += 1,
            }
            if handle.join().is_err() {
                warn!(target: "tally::worker", worker = %self.metadoc_path, "Round thread panicked");
            }
        }

        let stats = WorkerStats {
            last_successful_run: self.store.now().as_millis(),
            shards_aggregated: consumed.len() as u64,
            splits: sample_splits(consumed, self.config.split_sample_interval),
            rounds,
            rounds_capped,
        };

        let stats_written = match exit {
            ExitReason::MetadataChanged => false,
            _ => match self.write_stats(&ctx, &stats) {
                Ok(()) => true,
                Err(e) => {
                    warn!(target: "tally::worker", worker = %self.metadoc_path, error = %e, "Failed to save worker stats");
                    false
                }
            },
        };

        self.state = WorkerState::Terminated;
        info!(
            target: "tally::worker",
            worker = %self.metadoc_path,
            exit = ?exit,
            shards = stats.shards_aggregated,
            rounds = stats.rounds,
            rounds_capped = stats.rounds_capped,
            "Worker finished"
        );
        Ok(WorkerReport {
            exit,
            stats,
            failed_plans,
            lost_rounds,
            stats_written,
        })
    }

    fn write_stats(&self, ctx: &RoundContext<S>, stats: &WorkerStats) -> Result<()> {
        let mut update = Document::new();
        update.insert("stats".to_string(), serde_json::to_value(stats)?);
        update.insert(
            "timestamp".to_string(),
            Value::from(self.store.now().as_millis()),
        );

        self.store.run_transaction(|txn| {
            let snapshot = txn.get(&self.metadoc_path)?;
            if !ctx.owns(&snapshot) {
                return Err(TallyError::ownership_lost(self.metadoc_path.as_str()));
            }
            txn.set(&self.metadoc_path, update.clone(), SetMode::Merge);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::partial::{ENTRY_DATA_FIELD, ENTRY_ID_FIELD};

    fn snapshot(path: &str, body: Value, updated: i64) -> DocumentSnapshot {
        DocumentSnapshot {
            path: DocPath::parse(path).unwrap(),
            data: Some(body.as_object().unwrap().clone()),
            version: 1,
            update_time: Timestamp::from_millis(updated),
        }
    }

    fn entries(n: usize) -> Value {
        let items: Vec<Value> = (0..n)
            .map(|i| json!({ ENTRY_ID_FIELD: format!("e{}", i), ENTRY_DATA_FIELD: {"n": 1} }))
            .collect();
        json!({ UPDATES_FIELD: items })
    }

    #[test]
    fn test_categorize_plain_shards() {
        let shards = vec![snapshot("c/x/s/a", json!({"n": 1}), 0)];
        let (aggregate, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(0), &WorkerConfig::default(), false);
        assert_eq!(aggregate.len(), 1);
        assert!(cleanup.is_empty());
    }

    #[test]
    fn test_categorize_recent_empty_partial_is_kept() {
        let shards = vec![snapshot("c/x/s/\t\t\t\ta", json!({}), 100_000)];
        let config = WorkerConfig::default();

        let (aggregate, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(110_000), &config, false);
        assert!(aggregate.is_empty());
        assert!(cleanup.is_empty());

        let (_, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(131_000), &config, false);
        assert_eq!(cleanup.len(), 1);

        let (_, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(110_000), &config, true);
        assert_eq!(cleanup.len(), 1);
    }

    #[test]
    fn test_categorize_long_partial_goes_to_both() {
        let shards = vec![snapshot("c/x/s/\t\t\t\ta", entries(11), 0)];
        let (aggregate, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(0), &WorkerConfig::default(), false);
        assert_eq!(aggregate.len(), 1);
        assert_eq!(cleanup.len(), 1);

        let shards = vec![snapshot("c/x/s/\t\t\t\ta", entries(10), 0)];
        let (aggregate, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(0), &WorkerConfig::default(), false);
        assert_eq!(aggregate.len(), 1);
        assert!(cleanup.is_empty());
    }

    #[test]
    fn test_categorize_drops_orphans() {
        let shards = vec![snapshot("s/a", json!({"n": 1}), 0)];
        let (aggregate, cleanup) =
            categorize_shards(&shards, Timestamp::from_millis(0), &WorkerConfig::default(), false);
        assert!(aggregate.is_empty());
        assert!(cleanup.is_empty());
    }

    #[test]
    fn test_sample_splits() {
        let paths: Vec<String> = (0..250).rev().map(|i| format!("c/x/s/{:04}", i)).collect();
        let splits = sample_splits(paths, 100);
        assert_eq!(splits, vec!["c/x/s/0100".to_string(), "c/x/s/0200".to_string()]);
    }

    #[test]
    fn test_sample_splits_small_input() {
        assert!(sample_splits(vec!["a/b".into()], 100).is_empty());
        assert!(sample_splits(Vec::new(), 100).is_empty());
    }
}
