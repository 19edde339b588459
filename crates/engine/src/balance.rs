//! Worker balancing from reported stats

use tally_core::{ControllerConfig, Slice};

/// What the controller knows about one worker
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerShardingInfo {
    /// Slice owned by the worker
    pub slice: Slice,
    /// The worker finished at least one run
    pub has_data: bool,
    /// Every round of the last run hit the page limit
    pub overloaded: bool,
    /// Sampled consumed shard paths, ascending
    pub splits: Vec<String>,
}

/// Thresholds used by `balance_workers`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalancePolicy {
    /// Split points per new slice
    pub splits_per_slice: usize,
    /// Below this many split points per worker, workers are merged
    pub min_splits_per_worker: usize,
}

impl Default for BalancePolicy {
    fn default() -> Self {
        BalancePolicy {
            splits_per_slice: 20,
            min_splits_per_worker: 10,
        }
    }
}

impl From<&ControllerConfig> for BalancePolicy {
    fn from(config: &ControllerConfig) -> Self {
        BalancePolicy {
            splits_per_slice: config.splits_per_slice.max(1),
            min_splits_per_worker: config.min_splits_per_worker,
        }
    }
}

/// Decide whether to reshard and compute the new slices.
///
/// Returns `(reshard, slices)`. An empty slice list with `reshard = true`
/// means "one worker over the whole keyspace".
pub fn balance_workers(policy: &BalancePolicy, workers: &[WorkerShardingInfo]) -> (bool, Vec<Slice>) {
    if workers.is_empty() {
        return (true, vec![Slice::full()]);
    }
    // Someone has not reported yet: wait for complete information.
    if workers.iter().any(|w| !w.has_data) {
        return (false, Vec::new());
    }

    let mut points: Vec<&str> = Vec::new();
    let mut reshard = false;
    for worker in workers {
        points.push(&worker.slice.start);
        points.extend(worker.splits.iter().map(String::as_str));
        reshard |= worker.overloaded;
    }
    if let Some(last) = workers.last() {
        points.push(&last.slice.end);
    }

    if workers.len() > 1 && points.len() < policy.min_splits_per_worker * workers.len() {
        reshard = true;
    }
    if points.len() <= 2 {
        return (reshard, Vec::new());
    }

    let step = policy.splits_per_slice.max(1);
    let last = points.len() - 1;
    let slices = (0..last)
        .step_by(step)
        .map(|i| Slice::new(points[i], points[(i + step).min(last)]))
        .collect();
    (reshard, slices)
}

/// Zero-padded lower-case hex id of the `idx`-th worker document.
pub fn encode_worker_key(idx: usize) -> String {
    format!("{:04x}", idx)
}
