//! Shared helpers for engine integration tests

#![allow(dead_code)]

use serde_json::{json, Value};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tally_core::partial::{ENTRY_DATA_FIELD, ENTRY_ID_FIELD, UPDATES_FIELD};
use tally_core::types::to_document;
use tally_core::{DocPath, Document, Slice, TallyConfig, WorkerMetadata};
use tally_storage::{DocumentSnapshot, DocumentStore, MemoryStore, SetMode};

pub const SHARDS: &str = "_counter_shards_";
pub const WORKER_DOC: &str = "_counter_internal_/controller/workers/0000";

pub fn path(p: &str) -> DocPath {
    DocPath::parse(p).unwrap()
}

pub fn doc(value: Value) -> Document {
    value.as_object().unwrap().clone()
}

/// Path of shard `id` under `counter`
pub fn shard(counter: &str, id: &str) -> DocPath {
    path(&format!("{}/{}/{}", counter, SHARDS, id))
}

pub fn put(store: &MemoryStore, p: &DocPath, value: Value) {
    store.set(p, doc(value), SetMode::Overwrite).unwrap();
}

/// Partial document whose entries carry `deltas`
pub fn put_partial(store: &MemoryStore, p: &DocPath, deltas: Vec<Value>) {
    let entries: Vec<Value> = deltas
        .into_iter()
        .enumerate()
        .map(|(i, d)| json!({ ENTRY_ID_FIELD: format!("seed-{}", i), ENTRY_DATA_FIELD: d }))
        .collect();
    put(store, p, json!({ UPDATES_FIELD: entries }));
}

/// Integer at a top-level field, 0 when missing
pub fn field(store: &MemoryStore, p: &DocPath, name: &str) -> i64 {
    store
        .get(p)
        .unwrap()
        .data
        .and_then(|d| d.get(name).and_then(Value::as_i64))
        .unwrap_or(0)
}

/// Number of documents in the shard collection of any counter
pub fn shard_count(store: &MemoryStore) -> usize {
    store
        .paths()
        .iter()
        .filter(|p| p.collection_id() == SHARDS)
        .count()
}

/// Config with short timings for tests
pub fn fast_config() -> TallyConfig {
    let mut config = TallyConfig::default();
    config.worker.tick_ms = 10;
    config.worker.timeout_ms = 300;
    config.controller.schedule_interval_ms = 50;
    config.controller.continuous_timeout_ms = 300;
    config
}

/// Write a worker metadata document and return its snapshot.
pub fn seed_worker(store: &MemoryStore, slice: Slice) -> DocumentSnapshot {
    let metadata = WorkerMetadata {
        slice,
        stats: None,
        timestamp: 1,
    };
    let p = path(WORKER_DOC);
    store
        .set(&p, to_document(&metadata).unwrap(), SetMode::Overwrite)
        .unwrap();
    store.get(&p).unwrap()
}

pub fn shared(store: &MemoryStore) -> Arc<MemoryStore> {
    Arc::new(store.clone())
}

/// Poll `check` until it holds or `timeout` elapses.
pub fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}
