//! Runtime Tests
//!
//! End-to-end runs with every trigger thread live.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tally_core::TallyConfig;
use tally_engine::{Runtime, ShardedCounter};
use tally_storage::MemoryStore;

fn counter(store: &MemoryStore) -> ShardedCounter<MemoryStore> {
    ShardedCounter::new(shared(store), path("pages/home"), SHARDS).unwrap()
}

#[test]
fn test_runtime_aggregates_inline() {
    let store = MemoryStore::new();
    let mut runtime = Runtime::start(shared(&store), fast_config()).unwrap();

    let writers: Vec<_> = (0..4).map(|_| counter(&store)).collect();
    for writer in &writers {
        for _ in 0..5 {
            writer.increment_by("visits", 1).unwrap();
        }
    }

    assert!(wait_until(Duration::from_secs(5), || {
        field(&store, &path("pages/home"), "visits") == 20
    }));
    assert!(wait_until(Duration::from_secs(5), || shard_count(&store) == 0));
    for writer in &writers {
        assert_eq!(writer.get("visits").unwrap(), serde_json::Number::from(20));
    }
    assert_eq!(runtime.active_workers(), 0);
    runtime.shutdown();
}

#[test]
fn test_runtime_hands_busy_keyspace_to_workers() {
    let store = MemoryStore::new();
    let mut config = fast_config();
    config.controller.inline_shard_limit = 3;
    config.worker.timeout_ms = 200;

    // Enough shards that inline aggregation gives up.
    let writers: Vec<_> = (0..6).map(|_| counter(&store)).collect();
    for writer in &writers {
        writer.increment_by("visits", 2).unwrap();
    }

    let mut runtime = Runtime::start(shared(&store), config).unwrap();
    assert!(wait_until(Duration::from_secs(10), || {
        field(&store, &path("pages/home"), "visits") == 12
    }));

    // Controller listed a worker over the whole keyspace.
    let controller = path("_counter_internal_/controller");
    let workers = tally_storage::DocumentStore::get(&store, &controller)
        .unwrap()
        .data
        .unwrap()["workers"]
        .as_array()
        .map(Vec::len);
    assert_eq!(workers, Some(1));
    runtime.shutdown();
}

#[test]
fn test_runtime_shutdown_joins_everything() {
    let store = MemoryStore::new();
    let mut config: TallyConfig = fast_config();
    config.worker.timeout_ms = 60_000;
    config.controller.continuous_timeout_ms = 60_000;
    let mut runtime = Runtime::start(shared(&store), config).unwrap();
    counter(&store).increment_by("visits", 1).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        field(&store, &path("pages/home"), "visits") == 1
    }));

    // The inline window is still open; shutdown must cut it short.
    let started = std::time::Instant::now();
    runtime.shutdown();
    runtime.shutdown();
    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(runtime.active_workers(), 0);
}

#[test]
fn test_runtime_rejects_invalid_config() {
    let mut config = fast_config();
    config.worker.shards_limit = 0;
    assert!(Runtime::start(Arc::new(MemoryStore::new()), config).is_err());
}
