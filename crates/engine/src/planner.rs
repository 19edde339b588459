//! Planner: groups a page of shards into aggregation plans
//!
//! Writers increment their own shard, so shards never contend. Workers fold
//! shards into their counter. When a page of shards shares a long key
//! prefix (a dense range), folding every shard straight into the counter
//! would make one document hot, so shards are first folded into a
//! *partial* keyed by their prefix:
//!
//! ```text
//! counter  <-  \t\t\t\ta  <-  \t\t\tab  <-  \t\ttabc  <-  \tabcd  <-  abcdef...
//! ```
//!
//! Each plan has exactly one target. Targets within one call are disjoint,
//! so plans can run as independent transactions.

use std::collections::HashMap;
use tally_core::shard_key::MAX_PARTIAL_PREFIX;
use tally_core::{DocPath, Result, ShardKey, TallyError};
use tally_storage::DocumentSnapshot;

/// Anything the planner can place: a path is all it needs.
pub trait PlanItem {
    /// Path of the shard or partial document
    fn doc_path(&self) -> &DocPath;
}

impl PlanItem for DocPath {
    fn doc_path(&self) -> &DocPath {
        self
    }
}

impl PlanItem for DocumentSnapshot {
    fn doc_path(&self) -> &DocPath {
        &self.path
    }
}

/// One aggregation: fold `shards` and `partials` into `target`
#[derive(Debug, Clone, PartialEq)]
pub struct AggregationPlan<D> {
    /// Counter or partial receiving the delta
    pub target: DocPath,
    /// Whether `target` is a partial
    pub is_partial: bool,
    /// Plain shards, ascending
    pub shards: Vec<D>,
    /// Partials, ascending
    pub partials: Vec<D>,
}

impl<D> AggregationPlan<D> {
    fn new(target: DocPath, is_partial: bool) -> Self {
        AggregationPlan {
            target,
            is_partial,
            shards: Vec::new(),
            partials: Vec::new(),
        }
    }

    /// Documents consumed by the plan
    pub fn len(&self) -> usize {
        self.shards.len() + self.partials.len()
    }

    /// Whether the plan consumes nothing
    pub fn is_empty(&self) -> bool {
        self.shards.is_empty() && self.partials.is_empty()
    }
}

/// Whether a document sits under a counter, i.e. has a document two
/// segments up. Shards in a top-level collection have nowhere to go.
pub fn is_aggregatable(path: &DocPath) -> bool {
    path.parent_document().is_some()
}

fn split_path(path: &str) -> (&str, &str) {
    match path.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", path),
    }
}

/// Length of the key prefix shared by the slice start and the last
/// document of the page, at most 4. Zero when `start` is open, the two
/// live in different collections or their decoded keys differ in length.
pub fn aggr_prefix_len(start: &str, last: &DocPath) -> usize {
    if start.is_empty() {
        return 0;
    }
    let (start_dir, start_id) = split_path(start);
    if start_dir != last.parent().as_str() {
        return 0;
    }

    let first = ShardKey::decode(start_id);
    let second = ShardKey::decode(last.id());
    if first.logical_len() != second.logical_len() {
        return 0;
    }

    let pairs = first.logical().chars().zip(second.logical().chars());
    for (i, (a, b)) in pairs.take(MAX_PARTIAL_PREFIX).enumerate() {
        if a != b {
            return i + 1;
        }
    }
    MAX_PARTIAL_PREFIX
}

/// Target of one document for a given prefix length: `(path, is_partial)`.
///
/// A partial target keeps at most `decoded_len - 1` characters so a
/// document never maps onto itself; with nothing left, the counter is the
/// target.
pub fn construct_aggregate(path: &DocPath, prefix_len: usize) -> Result<(DocPath, bool)> {
    let counter = || {
        path.parent_document().ok_or_else(|| {
            TallyError::invariant(format!("{} has no counter document", path))
        })
    };
    if prefix_len == 0 {
        return Ok((counter()?, false));
    }

    let key = ShardKey::decode(path.id());
    let keep = prefix_len.min(key.logical_len().saturating_sub(1));
    if keep == 0 {
        return Ok((counter()?, false));
    }

    let partial = ShardKey::partial_for(key.logical(), keep);
    Ok((path.parent().doc(&partial.encode())?, true))
}

/// Partition an ascending page of documents into plans.
///
/// Every input document lands in exactly one plan. Plans are ordered by the
/// first document they consume; documents keep their order within a plan.
pub fn plan_aggregations<D>(start: &str, docs: &[D]) -> Result<Vec<AggregationPlan<D>>>
where
    D: PlanItem + Clone,
{
    let Some(last) = docs.last() else {
        return Ok(Vec::new());
    };
    let prefix_len = aggr_prefix_len(start, last.doc_path());

    let mut plans: Vec<AggregationPlan<D>> = Vec::new();
    let mut by_target: HashMap<DocPath, usize> = HashMap::new();

    for doc in docs {
        let (target, is_partial) = construct_aggregate(doc.doc_path(), prefix_len)?;
        let index = match by_target.get(&target) {
            Some(&index) => index,
            None => {
                by_target.insert(target.clone(), plans.len());
                plans.push(AggregationPlan::new(target, is_partial));
                plans.len() - 1
            }
        };
        if ShardKey::decode(doc.doc_path().id()).is_partial() {
            plans[index].partials.push(doc.clone());
        } else {
            plans[index].shards.push(doc.clone());
        }
    }

    Ok(plans)
}
