//! Property tests for the pure parts of aggregation: numeric folding,
//! planning, aggregation, balancing and split sampling.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::HashSet;
use tally_core::partial::UpdateEntry;
use tally_core::shard_key::is_partial_id;
use tally_core::{DocPath, Document, NumericUpdate, ShardKey, Slice, Timestamp, UPDATES_FIELD};
use tally_engine::balance::{balance_workers, BalancePolicy, WorkerShardingInfo};
use tally_engine::planner::plan_aggregations;
use tally_engine::worker::sample_splits;
use tally_engine::{AggregateUpdate, Aggregator};
use tally_storage::DocumentSnapshot;

fn delta_strategy() -> impl Strategy<Value = Document> {
    (
        -1_000i64..1_000,
        prop::option::of(-1_000i64..1_000),
        prop::option::of("[a-z]{1,6}"),
    )
        .prop_map(|(n, nested, label)| {
            let mut value = json!({ "n": n });
            if let Some(m) = nested {
                value["stats"] = json!({ "m": m });
            }
            if let Some(label) = label {
                value["label"] = Value::String(label);
            }
            value.as_object().cloned().unwrap_or_default()
        })
}

const COUNTERS: [&str; 3] = ["c/a", "c/b", "d/x"];

/// Plain ids, or partial ids carrying a 1-4 character prefix
fn shard_id_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-z0-9]{4,6}",
        1 => "[a-z0-9]{1,4}".prop_map(|prefix| ShardKey::Partial(prefix).encode()),
    ]
}

fn shard_paths_strategy() -> impl Strategy<Value = Vec<DocPath>> {
    prop::collection::btree_set(
        (prop::sample::select(COUNTERS.to_vec()), shard_id_strategy()),
        1..40,
    )
    .prop_map(|set| {
        let mut paths: Vec<DocPath> = set
            .into_iter()
            .filter_map(|(counter, id)| {
                DocPath::parse(format!("{}/_counter_shards_/{}", counter, id)).ok()
            })
            .collect();
        paths.sort();
        paths
    })
}

fn snapshot(path: DocPath, value: Value) -> DocumentSnapshot {
    DocumentSnapshot {
        path,
        data: value.as_object().cloned(),
        version: 1,
        update_time: Timestamp::EPOCH,
    }
}

fn partial_snapshot(id: usize, deltas: &[Document]) -> DocumentSnapshot {
    let entries: Vec<Value> = deltas
        .iter()
        .enumerate()
        .map(|(i, d)| UpdateEntry::new(format!("e{}", i), d.clone()).to_value())
        .collect();
    let path = DocPath::parse(format!("c/a/_counter_shards_/\t\t\t\t{}", id % 10)).unwrap();
    snapshot(path, json!({ UPDATES_FIELD: entries }))
}

/// Sum of the `n` leaf over a list of deltas
fn sum_n(deltas: &[Document]) -> i64 {
    deltas.iter().filter_map(|d| d["n"].as_i64()).sum()
}

fn worker_strategy() -> impl Strategy<Value = Vec<WorkerShardingInfo>> {
    (
        prop::collection::btree_set("[a-z]{2,6}", 0..60),
        1usize..5,
        any::<bool>(),
    )
        .prop_map(|(points, workers, overloaded)| {
            let points: Vec<String> = points.into_iter().collect();
            let per_worker = (points.len() / workers).max(1);
            let mut infos = Vec::new();
            let mut start = String::new();
            let mut chunks = points.chunks(per_worker).peekable();
            while let Some(chunk) = chunks.next() {
                let (end, splits) = match chunks.peek() {
                    Some(next) => (next[0].clone(), chunk.to_vec()),
                    None => (String::new(), chunk.to_vec()),
                };
                let splits = splits.into_iter().filter(|s| *s != start).collect();
                infos.push(WorkerShardingInfo {
                    slice: Slice::new(start.clone(), end.clone()),
                    has_data: true,
                    overloaded,
                    splits,
                });
                start = end;
            }
            if infos.is_empty() {
                infos.push(WorkerShardingInfo {
                    slice: Slice::full(),
                    has_data: true,
                    overloaded,
                    splits: Vec::new(),
                });
            }
            infos
        })
}

proptest! {
    /// Subtracting what was merged leaves nothing to apply
    #[test]
    fn merge_then_subtract_is_noop(deltas in prop::collection::vec(delta_strategy(), 1..20)) {
        let mut update = NumericUpdate::new();
        for delta in &deltas {
            update.merge_from(delta);
        }
        for delta in &deltas {
            update.subtract_from(delta);
        }
        prop_assert!(update.is_noop());
    }

    /// Merged integers add up and strings never leak into the delta
    #[test]
    fn merge_sums_numbers(deltas in prop::collection::vec(delta_strategy(), 1..20)) {
        let mut update = NumericUpdate::new();
        for delta in &deltas {
            update.merge_from(delta);
        }
        let expected: i64 = deltas.iter().filter_map(|d| d["n"].as_i64()).sum();
        let data = update.into_data();
        prop_assert_eq!(data.get("n").and_then(Value::as_i64).unwrap_or(0), expected);
        prop_assert!(!data.contains_key("label"));
    }

    /// Every document lands in exactly one plan, and a document that is
    /// also a target is a partial one level further out
    #[test]
    fn plans_partition_the_page(
        paths in shard_paths_strategy(),
        start_counter in prop::sample::select(COUNTERS.to_vec()),
        start_id in prop::option::of("[a-z0-9]{4,6}"),
    ) {
        let start = start_id
            .map(|id| format!("{}/_counter_shards_/{}", start_counter, id))
            .unwrap_or_default();
        let plans = plan_aggregations(&start, &paths).unwrap();

        let mut seen = HashSet::new();
        let mut targets = HashSet::new();
        for plan in &plans {
            prop_assert!(!plan.is_empty());
            prop_assert!(targets.insert(plan.target.clone()), "duplicate target {}", plan.target);
            prop_assert_eq!(plan.is_partial, is_partial_id(plan.target.id()));
            let target_len = ShardKey::decode(plan.target.id()).logical_len();
            for doc in plan.shards.iter().chain(&plan.partials) {
                prop_assert!(seen.insert(doc.clone()), "{} planned twice", doc);
                prop_assert_ne!(doc, &plan.target);
                if plan.is_partial {
                    prop_assert_eq!(plan.target.parent(), doc.parent());
                    prop_assert!(target_len < ShardKey::decode(doc.id()).logical_len());
                }
            }
            for doc in &plan.partials {
                prop_assert!(is_partial_id(doc.id()));
            }
            for doc in &plan.shards {
                prop_assert!(!is_partial_id(doc.id()));
            }
        }
        prop_assert_eq!(seen.len(), paths.len());
        for path in &paths {
            if targets.contains(path) {
                prop_assert!(is_partial_id(path.id()), "plain shard {} is a target", path);
            }
        }
    }

    /// A counter update is the existing value plus every shard and entry
    #[test]
    fn counter_update_adds_shards_and_partials(
        existing in prop::option::of(-1_000i64..1_000),
        shard_deltas in prop::collection::vec(delta_strategy(), 0..10),
        partial_deltas in prop::collection::vec(prop::collection::vec(delta_strategy(), 0..5), 0..4),
    ) {
        let counter_path = DocPath::parse("c/a").unwrap();
        let counter = match existing {
            Some(n) => snapshot(counter_path.clone(), json!({ "n": n, "title": "kept" })),
            None => DocumentSnapshot::missing(counter_path),
        };
        let shards: Vec<DocumentSnapshot> = shard_deltas
            .iter()
            .enumerate()
            .map(|(i, d)| {
                let path = DocPath::parse(format!("c/a/_counter_shards_/s{:03}", i)).unwrap();
                snapshot(path, Value::Object(d.clone()))
            })
            .collect();
        let partials: Vec<DocumentSnapshot> = partial_deltas
            .iter()
            .enumerate()
            .map(|(i, deltas)| partial_snapshot(i, deltas))
            .collect();

        let update = Aggregator::new().aggregate(Some(&counter), &partials, &shards);
        let AggregateUpdate::Counter(data) = update else {
            return Err(TestCaseError::fail("expected a counter update"));
        };

        let base = existing.unwrap_or(0);
        let expected = base
            + sum_n(&shard_deltas)
            + partial_deltas.iter().map(|d| sum_n(d)).sum::<i64>();
        prop_assert_eq!(data.get("n").and_then(Value::as_i64).unwrap_or(base), expected);

        let nested: i64 = shard_deltas
            .iter()
            .chain(partial_deltas.iter().flatten())
            .filter_map(|d| d.get("stats").and_then(|s| s["m"].as_i64()))
            .sum();
        let written_m = data
            .get("stats")
            .and_then(|s| s.get("m"))
            .and_then(Value::as_i64)
            .unwrap_or(0);
        prop_assert_eq!(written_m, nested);
        prop_assert!(!data.contains_key("label"));
        prop_assert!(!data.contains_key("title"));
    }

    /// New slices are contiguous and cover the old keyspace
    #[test]
    fn balanced_slices_cover_keyspace(
        workers in worker_strategy(),
        splits_per_slice in 1usize..10,
    ) {
        let policy = BalancePolicy { splits_per_slice, min_splits_per_worker: 2 };
        let (reshard, slices) = balance_workers(&policy, &workers);
        if !reshard || slices.is_empty() {
            return Ok(());
        }
        prop_assert_eq!(&slices[0].start, &workers[0].slice.start);
        prop_assert_eq!(&slices[slices.len() - 1].end, &workers[workers.len() - 1].slice.end);
        for pair in slices.windows(2) {
            prop_assert_eq!(&pair[0].end, &pair[1].start);
        }
    }

    /// Sampling keeps every interval-th path after the first
    #[test]
    fn sampled_splits_come_from_input(
        ids in prop::collection::btree_set("[a-z0-9]{1,6}", 0..300),
        interval in 1usize..50,
    ) {
        let paths: Vec<String> = ids.iter().map(|id| format!("c/a/s/{}", id)).collect();
        let splits = sample_splits(paths.clone(), interval);
        let expected = paths.len().saturating_sub(1) / interval;
        prop_assert_eq!(splits.len(), expected);
        for split in &splits {
            prop_assert!(paths.contains(split));
        }
        let mut sorted = splits.clone();
        sorted.sort();
        prop_assert_eq!(sorted, splits);
    }
}
