//! Change listeners
//!
//! Listeners are notified after every commit that touches them, with the
//! state as of notification time. A document listener only hears about new
//! versions; a query listener only hears about results with at least one
//! change. Listeners whose receiver is gone are pruned on the next send.

use crate::memory::{evaluate_query, snapshot_of, StoredDoc};
use crate::query::RangeQuery;
use crate::snapshot::{DocumentSnapshot, QuerySnapshot};
use crossbeam_channel::Sender;
use std::collections::BTreeMap;
use tally_core::DocPath;

struct DocumentWatcher {
    path: DocPath,
    tx: Sender<DocumentSnapshot>,
    last_version: u64,
}

struct QueryWatcher {
    query: RangeQuery,
    tx: Sender<QuerySnapshot>,
    last: Vec<DocumentSnapshot>,
}

#[derive(Default)]
pub(crate) struct WatchRegistry {
    documents: Vec<DocumentWatcher>,
    queries: Vec<QueryWatcher>,
}

impl WatchRegistry {
    /// Register a document listener and deliver its first snapshot.
    pub(crate) fn add_document(
        &mut self,
        initial: DocumentSnapshot,
        tx: Sender<DocumentSnapshot>,
    ) {
        let watcher = DocumentWatcher {
            path: initial.path.clone(),
            tx,
            last_version: initial.version,
        };
        if watcher.tx.send(initial).is_ok() {
            self.documents.push(watcher);
        }
    }

    /// Register a query listener and deliver its first snapshot.
    pub(crate) fn add_query(
        &mut self,
        query: RangeQuery,
        initial: Vec<DocumentSnapshot>,
        tx: Sender<QuerySnapshot>,
    ) {
        let snapshot = QuerySnapshot::diff(&[], initial);
        let watcher = QueryWatcher {
            query,
            tx,
            last: snapshot.docs.clone(),
        };
        if watcher.tx.send(snapshot).is_ok() {
            self.queries.push(watcher);
        }
    }

    /// Fan out a commit that wrote `changed`.
    pub(crate) fn notify(&mut self, changed: &[DocPath], docs: &BTreeMap<DocPath, StoredDoc>) {
        self.documents.retain_mut(|watcher| {
            if !changed.contains(&watcher.path) {
                return true;
            }
            let snapshot = snapshot_of(docs, &watcher.path);
            if snapshot.version == watcher.last_version {
                return true;
            }
            watcher.last_version = snapshot.version;
            watcher.tx.send(snapshot).is_ok()
        });

        self.queries.retain_mut(|watcher| {
            if !changed.iter().any(|path| watcher.query.may_contain(path)) {
                return true;
            }
            let current = evaluate_query(docs, &watcher.query)
                .map(|(path, stored)| stored.snapshot(path))
                .collect();
            let snapshot = QuerySnapshot::diff(&watcher.last, current);
            if snapshot.changes.is_empty() {
                return true;
            }
            watcher.last = snapshot.docs.clone();
            watcher.tx.send(snapshot).is_ok()
        });
    }

    /// Registered listeners
    pub(crate) fn len(&self) -> usize {
        self.documents.len() + self.queries.len()
    }
}
