//! Controller: inline aggregation and worker scheduling
//!
//! The controller document lists the slices of the running workers. While
//! the list is empty, low-traffic deployments are served inline: the
//! controller folds up to one page of shards straight into counters. Once a
//! page is full, it hands the keyspace to workers and from then on only
//! rebalances them from the stats they report.

use crate::aggregator::{AggregateUpdate, Aggregator};
use crate::balance::{balance_workers, encode_worker_key, BalancePolicy, WorkerShardingInfo};
use crate::planner::{is_aggregatable, plan_aggregations};
use crossbeam_channel::{after, never, select, Receiver};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tally_core::types::{from_document, to_document};
use tally_core::{
    CollectionPath, ControllerData, DocPath, Document, Result, Slice, TallyConfig, TallyError,
    WorkerMetadata,
};
use tally_storage::{DocumentSnapshot, DocumentStore, RangeQuery, SetMode, Transaction};
use tracing::{debug, info, warn};

/// Result of one inline aggregation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerStatus {
    /// Workers own the keyspace; nothing was done
    WorkersRunning,
    /// The page hit the inline cap; workers are needed
    TooManyShards,
    /// The page was aggregated
    Success,
    /// The transaction failed
    Failure,
}

/// Summary of `Controller::aggregate_continuously`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContinuousReport {
    /// Successful inline rounds
    pub rounds: u64,
    /// Shards consumed by those rounds
    pub shards_aggregated: u64,
    /// Shard changes ignored because workers were running
    pub skipped_due_to_workers: u64,
}

/// Summary of `Controller::reschedule_workers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RescheduleOutcome {
    /// Worker documents were replaced
    pub resharded: bool,
    /// Slices of the workers after the call
    pub workers: Vec<Slice>,
    /// Workers poked because they stopped reporting
    pub failed_workers: usize,
}

/// Summary of `Controller::run_cycle`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    /// Inline aggregation status
    pub status: ControllerStatus,
    /// Present when the status called for rescheduling
    pub reschedule: Option<RescheduleOutcome>,
}

/// Drives inline aggregation and worker balancing.
pub struct Controller<S: DocumentStore> {
    store: Arc<S>,
    controller_path: DocPath,
    workers_collection: CollectionPath,
    config: TallyConfig,
    aggregator: Aggregator,
}

impl<S: DocumentStore> Controller<S> {
    /// Controller for the paths and limits in `config`.
    pub fn new(store: Arc<S>, config: &TallyConfig) -> Result<Self> {
        Ok(Controller {
            store,
            controller_path: config.controller_path()?,
            workers_collection: config.workers_collection()?,
            config: config.clone(),
            aggregator: Aggregator::new(),
        })
    }

    /// Use a custom aggregator (entry ids).
    pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
        self.aggregator = aggregator;
        self
    }

    /// Controller document path
    pub fn controller_path(&self) -> &DocPath {
        &self.controller_path
    }

    /// Collection holding worker metadata
    pub fn workers_collection(&self) -> &CollectionPath {
        &self.workers_collection
    }

    // ========================================================================
    // Inline aggregation
    // ========================================================================

    /// Aggregate up to `limit` shards of `slice` in one transaction.
    ///
    /// Never fails: transaction errors are logged and reported as
    /// `ControllerStatus::Failure`.
    pub fn aggregate_once(&self, slice: &Slice, limit: usize) -> ControllerStatus {
        match self.try_aggregate_once(slice, limit) {
            Ok((status, _)) => status,
            Err(e) => {
                warn!(target: "tally::controller", slice = %slice, error = %e, "Transaction to aggregate shards failed");
                ControllerStatus::Failure
            }
        }
    }

    fn try_aggregate_once(&self, slice: &Slice, limit: usize) -> Result<(ControllerStatus, usize)> {
        let cap = self.config.controller.inline_shard_limit;
        let query = RangeQuery::slice(&self.config.shard_collection_id, slice, limit);

        self.store.run_transaction(|txn| {
            let controller = read_controller(txn, &self.controller_path)?;
            if !controller.workers.is_empty() {
                return Ok((ControllerStatus::WorkersRunning, 0));
            }

            let page = txn.query(&query)?;
            if page.len() >= cap {
                return Ok((ControllerStatus::TooManyShards, 0));
            }

            let docs: Vec<DocumentSnapshot> = page
                .docs
                .into_iter()
                .filter(|doc| is_aggregatable(&doc.path))
                .collect();
            let plans = plan_aggregations("", &docs)?;
            if let Some(plan) = plans.iter().find(|plan| plan.is_partial) {
                return Err(TallyError::invariant(format!(
                    "inline aggregation planned partial target {}",
                    plan.target
                )));
            }

            // All reads before the first write.
            let counters = plans
                .iter()
                .map(|plan| txn.get(&plan.target))
                .collect::<Result<Vec<_>>>()?;

            for (plan, counter) in plans.iter().zip(&counters) {
                if let AggregateUpdate::Counter(update) =
                    self.aggregator.aggregate(Some(counter), &plan.partials, &plan.shards)
                {
                    if !update.is_empty() {
                        txn.set(&plan.target, update, SetMode::Merge);
                    }
                }
                for doc in plan.shards.iter().chain(&plan.partials) {
                    txn.delete(&doc.path);
                }
            }
            txn.set(
                &self.controller_path,
                timestamp_document(self.store.now().as_millis()),
                SetMode::Merge,
            );

            debug!(target: "tally::controller", counters = plans.len(), shards = docs.len(), "Aggregated inline");
            Ok((ControllerStatus::Success, docs.len()))
        })
    }

    /// Keep aggregating inline for `timeout`.
    pub fn aggregate_continuously(
        &self,
        slice: &Slice,
        limit: usize,
        timeout: Duration,
    ) -> Result<ContinuousReport> {
        self.aggregate_continuously_until(slice, limit, timeout, &never())
    }

    /// Like `aggregate_continuously`, stopping early when `cancel` yields
    /// or disconnects.
    ///
    /// Each shard change runs `aggregate_once` unless the page is full or
    /// workers are listed in the controller document.
    pub fn aggregate_continuously_until(
        &self,
        slice: &Slice,
        limit: usize,
        timeout: Duration,
        cancel: &Receiver<()>,
    ) -> Result<ContinuousReport> {
        let controller_sub = self.store.subscribe_document(&self.controller_path)?;
        let shards_sub = self.store.subscribe_query(&RangeQuery::slice(
            &self.config.shard_collection_id,
            slice,
            limit,
        ))?;
        let deadline = after(timeout);

        let mut controller = ControllerData::default();
        let mut report = ContinuousReport::default();

        loop {
            select! {
                recv(controller_sub.receiver()) -> msg => match msg {
                    Ok(snapshot) => {
                        if let Some(data) = &snapshot.data {
                            controller = from_document(data).unwrap_or_default();
                        }
                    }
                    Err(_) => break,
                },
                recv(shards_sub.receiver()) -> msg => {
                    let Ok(snapshot) = msg else { break };
                    let snapshot = shards_sub.latest().unwrap_or(snapshot);
                    if snapshot.len() == limit {
                        continue;
                    }
                    if let Some(latest) = controller_sub.latest() {
                        if let Some(data) = &latest.data {
                            controller = from_document(data).unwrap_or_default();
                        }
                    }
                    if !controller.workers.is_empty() {
                        report.skipped_due_to_workers += 1;
                        continue;
                    }
                    match self.try_aggregate_once(slice, limit) {
                        Ok((ControllerStatus::Success, count)) => {
                            report.rounds += 1;
                            report.shards_aggregated += count as u64;
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!(target: "tally::controller", slice = %slice, error = %e, "Inline aggregation failed");
                        }
                    }
                },
                recv(deadline) -> _ => break,
                recv(cancel) -> _ => break,
            }
        }

        info!(
            target: "tally::controller",
            rounds = report.rounds,
            shards = report.shards_aggregated,
            skipped = report.skipped_due_to_workers,
            "Continuous aggregation finished"
        );
        Ok(report)
    }

    // ========================================================================
    // Worker scheduling
    // ========================================================================

    /// Rebalance workers from their reported stats.
    ///
    /// On reshard, every worker document is replaced by one per new slice and
    /// the controller document lists the new slices. Otherwise workers silent
    /// for longer than the failure threshold get their timestamp bumped,
    /// which restarts them.
    pub fn reschedule_workers(&self) -> Result<RescheduleOutcome> {
        let policy = BalancePolicy::from(&self.config.controller);
        let threshold = self.config.controller.failure_threshold();
        let workers_query = RangeQuery::collection(self.workers_collection.clone());

        let outcome = self.store.run_transaction(|txn| {
            let controller = read_controller(txn, &self.controller_path)?;
            let workers = txn.query(&workers_query)?;
            let infos: Vec<WorkerShardingInfo> =
                workers.docs.iter().map(|doc| self.sharding_info(doc)).collect();

            let (reshard, mut slices) = balance_workers(&policy, &infos);
            let now = self.store.now();
            let timestamp = now.as_millis();

            if reshard {
                if slices.is_empty() {
                    slices.push(Slice::full());
                }
                for doc in &workers.docs {
                    txn.delete(&doc.path);
                }
                for (idx, slice) in slices.iter().enumerate() {
                    let path = self.workers_collection.doc(&encode_worker_key(idx))?;
                    let metadata = WorkerMetadata {
                        slice: slice.clone(),
                        stats: None,
                        timestamp,
                    };
                    txn.set(&path, to_document(&metadata)?, SetMode::Overwrite);
                }
                let data = ControllerData {
                    workers: slices.clone(),
                    timestamp,
                };
                txn.set(&self.controller_path, to_document(&data)?, SetMode::Overwrite);
                return Ok(RescheduleOutcome {
                    resharded: true,
                    workers: slices,
                    failed_workers: 0,
                });
            }

            let mut failed = 0;
            for doc in &workers.docs {
                if now.saturating_duration_since(doc.update_time) > threshold {
                    txn.set(&doc.path, timestamp_document(timestamp), SetMode::Merge);
                    failed += 1;
                }
            }
            txn.set(
                &self.controller_path,
                timestamp_document(timestamp),
                SetMode::Merge,
            );
            Ok(RescheduleOutcome {
                resharded: false,
                workers: controller.workers,
                failed_workers: failed,
            })
        })?;

        if outcome.resharded {
            info!(target: "tally::controller", workers = outcome.workers.len(), "Resharded workers");
        } else {
            info!(target: "tally::controller", failed = outcome.failed_workers, "Detected failed workers");
        }
        Ok(outcome)
    }

    /// What balancing needs to know about one worker document.
    ///
    /// Splits of an overloaded worker are extended by scanning the rest of
    /// its slice, since a capped run only samples its first pages.
    fn sharding_info(&self, doc: &DocumentSnapshot) -> WorkerShardingInfo {
        let parsed = doc.data.as_ref().map(from_document::<WorkerMetadata>).transpose();
        let metadata = match parsed {
            Ok(Some(metadata)) => metadata,
            Ok(None) => WorkerMetadata::default(),
            Err(e) => {
                warn!(target: "tally::controller", worker = %doc.path, error = %e, "Unreadable worker metadata");
                WorkerMetadata::default()
            }
        };
        let Some(stats) = metadata.stats else {
            return WorkerShardingInfo {
                slice: metadata.slice,
                has_data: false,
                overloaded: false,
                splits: Vec::new(),
            };
        };

        let overloaded = stats.is_overloaded();
        let mut splits = stats.splits;
        if overloaded {
            if let Some(last) = splits.last().cloned() {
                match self.scan_splits(&last, &metadata.slice.end) {
                    Ok(extra) => splits.extend(extra),
                    Err(e) => {
                        warn!(target: "tally::controller", worker = %doc.path, error = %e, "Failed to calculate additional splits");
                    }
                }
            }
        }

        WorkerShardingInfo {
            slice: metadata.slice,
            has_data: true,
            overloaded,
            splits,
        }
    }

    fn scan_splits(&self, start: &str, end: &str) -> Result<Vec<String>> {
        let interval = self.config.worker.split_sample_interval.max(1);
        let query = RangeQuery::slice(
            &self.config.shard_collection_id,
            &Slice::new(start, end),
            self.config.controller.supplementary_scan_limit,
        );
        let page = self.store.query(&query)?;
        Ok(page
            .docs
            .iter()
            .skip(interval)
            .step_by(interval)
            .map(|doc| doc.path.as_str().to_string())
            .collect())
    }

    /// One scheduled run: inline aggregation over the whole keyspace, then
    /// rescheduling unless it succeeded.
    pub fn run_cycle(&self) -> Result<CycleReport> {
        let limit = self.config.controller.inline_shard_limit;
        let status = self.aggregate_once(&Slice::full(), limit);
        debug!(target: "tally::controller", status = ?status, "Inline aggregation");
        let reschedule = match status {
            ControllerStatus::Success => None,
            ControllerStatus::WorkersRunning
            | ControllerStatus::TooManyShards
            | ControllerStatus::Failure => Some(self.reschedule_workers()?),
        };
        Ok(CycleReport { status, reschedule })
    }
}

fn read_controller<T: Transaction>(txn: &mut T, path: &DocPath) -> Result<ControllerData> {
    let snapshot = txn.get(path)?;
    match &snapshot.data {
        Some(data) => from_document(data),
        None => Ok(ControllerData::default()),
    }
}

fn timestamp_document(millis: i64) -> Document {
    let mut doc = Document::new();
    doc.insert("timestamp".to_string(), Value::from(millis));
    doc
}
