//! Aggregator: folds shards and partials into one delta
//!
//! The aggregator is pure. It never touches the store; callers read the
//! snapshots inside their transaction and write the returned payload.

use std::fmt;
use std::sync::Arc;
use tally_core::partial::{self, UpdateEntry};
use tally_core::{Document, NumericUpdate};
use tally_storage::DocumentSnapshot;

/// Produces ids for new `_updates_` entries
pub type IdGenerator = Arc<dyn Fn() -> String + Send + Sync>;

/// Payload produced by one aggregation
#[derive(Debug, Clone, PartialEq)]
pub enum AggregateUpdate {
    /// Merge this document into the counter
    Counter(Document),
    /// Append this entry to the target partial; `None` when the delta is
    /// a no-op
    Partial(Option<UpdateEntry>),
}

/// Combines counter, partial and shard snapshots into update payloads.
#[derive(Clone)]
pub struct Aggregator {
    next_id: IdGenerator,
}

impl fmt::Debug for Aggregator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator").finish_non_exhaustive()
    }
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    /// Aggregator issuing uuid v4 entry ids.
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(|| uuid::Uuid::new_v4().to_string()))
    }

    /// Aggregator with a custom entry id source.
    pub fn with_id_generator(next_id: IdGenerator) -> Self {
        Aggregator { next_id }
    }

    /// Fold shards and partials into an update.
    ///
    /// With `counter = None` the result is a partial update (the target is
    /// itself a partial). Otherwise it is a counter update computed against
    /// the counter's current body, empty if the counter does not exist.
    /// Missing snapshots contribute nothing.
    pub fn aggregate(
        &self,
        counter: Option<&DocumentSnapshot>,
        partials: &[DocumentSnapshot],
        shards: &[DocumentSnapshot],
    ) -> AggregateUpdate {
        let mut update = NumericUpdate::new();
        for shard in shards {
            if let Some(data) = &shard.data {
                update.merge_from(data);
            }
        }
        for snapshot in partials {
            if let Some(data) = &snapshot.data {
                for entry in partial::entries(data) {
                    update.merge_from(&entry.data);
                }
            }
        }

        match counter {
            None => AggregateUpdate::Partial(update.to_partial_update(|| (self.next_id)())),
            Some(counter) => {
                let current = counter.data.clone().unwrap_or_default();
                AggregateUpdate::Counter(update.to_counter_update(&current))
            }
        }
    }

    /// Entry that cancels every entry currently in `partial`.
    ///
    /// Appending it leaves entries written concurrently untouched.
    pub fn subtract_partial(&self, partial: &DocumentSnapshot) -> Option<UpdateEntry> {
        let mut update = NumericUpdate::new();
        if let Some(data) = &partial.data {
            for entry in partial::entries(data) {
                update.subtract_from(&entry.data);
            }
        }
        update.to_partial_update(|| (self.next_id)())
    }

    /// Single entry equal to the sum of every entry in `partial`, or `None`
    /// when the sum is a no-op.
    pub fn compact(&self, partial: &DocumentSnapshot) -> Option<UpdateEntry> {
        let data = partial.data.as_ref()?;
        partial::fold_entries(data).to_partial_update(|| (self.next_id)())
    }
}
