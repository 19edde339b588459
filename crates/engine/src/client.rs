//! Writer-side counter handle
//!
//! Each `ShardedCounter` writes to a shard of its own under the counter's
//! shard collection, so concurrent writers never touch the same document.
//! Reads and listeners are latency compensated: the counter value plus
//! whatever this writer has added that workers have not folded in yet.

use crossbeam_channel::{unbounded, Select};
use serde_json::{Number, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread;
use tally_core::numeric::add_numbers;
use tally_core::partial::fold_entries;
use tally_core::shard_key::{is_partial_id, MAX_PARTIAL_PREFIX};
use tally_core::{DocPath, Document, NumericUpdate, Result, ShardKey, TallyError};
use tally_storage::{DocumentSnapshot, DocumentStore, SetMode, Subscription, Transaction};
use tracing::debug;

/// Handle to a sharded counter document for one writer.
pub struct ShardedCounter<S: DocumentStore> {
    store: Arc<S>,
    counter: DocPath,
    shard: DocPath,
    shard_id: String,
}

impl<S: DocumentStore> ShardedCounter<S> {
    /// Counter at `counter` writing to a fresh random shard.
    pub fn new(store: Arc<S>, counter: DocPath, shard_collection_id: &str) -> Result<Self> {
        Self::with_shard_id(store, counter, shard_collection_id, &uuid::Uuid::new_v4().to_string())
    }

    /// Counter writing to a given shard id (e.g. one persisted per client).
    pub fn with_shard_id(
        store: Arc<S>,
        counter: DocPath,
        shard_collection_id: &str,
        shard_id: &str,
    ) -> Result<Self> {
        if shard_id.is_empty() || is_partial_id(shard_id) {
            return Err(TallyError::invalid_input(format!(
                "invalid shard id {:?}",
                shard_id
            )));
        }
        let shard = counter.collection(shard_collection_id).doc(shard_id)?;
        Ok(ShardedCounter {
            store,
            counter,
            shard,
            shard_id: shard_id.to_string(),
        })
    }

    /// Counter document path
    pub fn counter_path(&self) -> &DocPath {
        &self.counter
    }

    /// This writer's shard, for batching increments of several fields.
    pub fn shard_path(&self) -> &DocPath {
        &self.shard
    }

    /// Add `delta` to a dotted `field` (`"stats.views"`).
    pub fn increment_by(&self, field: &str, delta: impl Into<Number>) -> Result<()> {
        let mut update = NumericUpdate::new();
        update.merge_from(&nested_field(field, Value::Number(delta.into()))?);

        self.store.run_transaction(|txn| {
            let current = txn.get(&self.shard)?.data_or_empty();
            txn.set(&self.shard, update.to_counter_update(&current), SetMode::Merge);
            Ok(())
        })?;
        debug!(target: "tally::client", shard = %self.shard, field, "Incremented shard");
        Ok(())
    }

    /// Latency-compensated value of a dotted `field`.
    ///
    /// Sums the counter, this writer's shard and every partial the shard
    /// can have been folded into. Missing values count as zero.
    pub fn get(&self, field: &str) -> Result<Number> {
        let segments = split_field(field)?;
        let paths = self.tracked_paths()?;

        let snapshots = self.store.run_transaction(|txn| txn.get_all(&paths))?;
        Ok(sum_field(&snapshots, &segments))
    }

    /// Listen to the latency-compensated value of a dotted `field`.
    ///
    /// The current value is delivered first, then a new one whenever a
    /// change to the counter, the shard or one of its partials moves the
    /// sum. While a worker folds the shard away the value may briefly count
    /// the same increment twice; it settles once every tracked document has
    /// reported. The listener stops at the first change after the
    /// subscription is dropped.
    pub fn on_snapshot(&self, field: &str) -> Result<Subscription<Number>> {
        let segments: Vec<String> = split_field(field)?
            .into_iter()
            .map(str::to_string)
            .collect();
        let paths = self.tracked_paths()?;
        let subs = paths
            .iter()
            .map(|path| self.store.subscribe_document(path))
            .collect::<Result<Vec<_>>>()?;

        let mut snapshots: Vec<DocumentSnapshot> = paths
            .into_iter()
            .zip(&subs)
            .map(|(path, sub)| sub.latest().unwrap_or_else(|| DocumentSnapshot::missing(path)))
            .collect();

        let (tx, rx) = unbounded();
        let mut last = {
            let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
            sum_field(&snapshots, &segments)
        };
        let _ = tx.send(last.clone());

        let counter = self.counter.clone();
        thread::Builder::new()
            .name("tally-counter-listener".to_string())
            .spawn(move || {
                let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
                let mut select = Select::new();
                for sub in &subs {
                    select.recv(sub.receiver());
                }
                loop {
                    let oper = select.select();
                    let index = oper.index();
                    match oper.recv(subs[index].receiver()) {
                        Ok(snapshot) => snapshots[index] = snapshot,
                        Err(_) => break,
                    }
                    for (slot, sub) in snapshots.iter_mut().zip(&subs) {
                        if let Some(snapshot) = sub.latest() {
                            *slot = snapshot;
                        }
                    }

                    let total = sum_field(&snapshots, &segments);
                    if total == last {
                        continue;
                    }
                    if tx.send(total.clone()).is_err() {
                        break;
                    }
                    last = total;
                }
                debug!(target: "tally::client", counter = %counter, "Counter listener stopped");
            })?;

        debug!(target: "tally::client", counter = %self.counter, field, "Listening to counter");
        Ok(Subscription::new(rx))
    }

    /// Counter, own shard and the partials of the shard id's prefixes.
    fn tracked_paths(&self) -> Result<Vec<DocPath>> {
        let collection = self.shard.parent();
        let mut partial_ids = BTreeSet::new();
        for len in 1..=MAX_PARTIAL_PREFIX {
            partial_ids.insert(ShardKey::partial_for(&self.shard_id, len).encode());
        }

        let mut paths = vec![self.counter.clone(), self.shard.clone()];
        for id in partial_ids {
            paths.push(collection.doc(&id)?);
        }
        Ok(paths)
    }
}

/// Sum of `segments` over the counter, the shard and folded partials.
fn sum_field(snapshots: &[DocumentSnapshot], segments: &[&str]) -> Number {
    let mut total = Number::from(0);
    for snapshot in snapshots {
        let Some(data) = &snapshot.data else {
            continue;
        };
        let value = if is_partial_id(snapshot.path.id()) {
            let folded = fold_entries(data).into_data();
            lookup_number(&folded, segments).cloned()
        } else {
            lookup_number(data, segments).cloned()
        };
        if let Some(n) = value {
            total = add_numbers(&total, &n, false);
        }
    }
    total
}

fn split_field(field: &str) -> Result<Vec<&str>> {
    let segments: Vec<&str> = field.split('.').collect();
    if segments.iter().any(|s| s.is_empty()) {
        return Err(TallyError::invalid_input(format!("invalid field {:?}", field)));
    }
    Ok(segments)
}

/// `{"a": {"b": value}}` for field `a.b`.
fn nested_field(field: &str, value: Value) -> Result<Document> {
    let segments = split_field(field)?;
    let mut current = value;
    for segment in segments.iter().rev() {
        let mut map = Document::new();
        map.insert(segment.to_string(), current);
        current = Value::Object(map);
    }
    match current {
        Value::Object(map) => Ok(map),
        _ => Err(TallyError::invalid_input(format!("invalid field {:?}", field))),
    }
}

fn lookup_number<'a>(doc: &'a Document, segments: &[&str]) -> Option<&'a Number> {
    let (last, parents) = segments.split_last()?;
    let mut current = doc;
    for segment in parents {
        current = current.get(*segment)?.as_object()?;
    }
    match current.get(*last)? {
        Value::Number(n) => Some(n),
        _ => None,
    }
}
