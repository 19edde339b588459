//! In-process trigger wiring
//!
//! Hosted deployments drive the engine from three triggers: a schedule for
//! the controller, writes to worker metadata documents, and writes to
//! shards. `Runtime` reproduces them with listener threads:
//!
//! | Thread | Listens to | Runs |
//! |--------|-----------|------|
//! | `tally-controller` | fixed interval | `Controller::run_cycle` |
//! | `tally-worker-trigger` | worker metadata collection | one `Worker` per created or modified document |
//! | `tally-shard-trigger` | shard collection group | `Controller::aggregate_continuously`, one at a time |
//!
//! Dropping the runtime (or calling `shutdown`) closes the cancel channel;
//! every thread, workers included, winds down and is joined.

use crate::controller::Controller;
use crate::worker::Worker;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tally_core::{DocPath, Result, Slice, TallyConfig};
use tally_storage::{ChangeKind, DocumentSnapshot, DocumentStore, RangeQuery};
use tracing::{debug, info, warn};

/// Handles of threads started by triggers
#[derive(Default)]
struct Spawned {
    workers: DashMap<DocPath, JoinHandle<()>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl Spawned {
    fn add_worker(&self, path: DocPath, handle: JoinHandle<()>) {
        if let Some(previous) = self.workers.insert(path, handle) {
            self.retire(previous);
        }
        self.workers.retain(|_, handle| !handle.is_finished());
    }

    fn retire(&self, handle: JoinHandle<()>) {
        let mut retired = self.retired.lock();
        retired.retain(|handle| !handle.is_finished());
        retired.push(handle);
    }

    fn active_workers(&self) -> usize {
        self.workers.iter().filter(|e| !e.value().is_finished()).count()
    }

    fn join_all(&self) {
        let paths: Vec<DocPath> = self.workers.iter().map(|e| e.key().clone()).collect();
        for path in paths {
            if let Some((_, handle)) = self.workers.remove(&path) {
                join_logged(handle, path.as_str());
            }
        }
        let retired = std::mem::take(&mut *self.retired.lock());
        for handle in retired {
            join_logged(handle, "retired");
        }
    }
}

fn join_logged(handle: JoinHandle<()>, name: &str) {
    if handle.join().is_err() {
        warn!(target: "tally::runtime", thread = name, "Thread panicked");
    }
}

/// Running engine: controller schedule plus worker and shard triggers.
pub struct Runtime<S: DocumentStore> {
    store: Arc<S>,
    cancel: Option<Sender<()>>,
    triggers: Vec<JoinHandle<()>>,
    spawned: Arc<Spawned>,
}

impl<S: DocumentStore> Runtime<S> {
    /// Validate `config` and start the trigger threads.
    pub fn start(store: Arc<S>, config: TallyConfig) -> Result<Self> {
        config.validate()?;
        let (cancel_tx, cancel_rx) = bounded::<()>(0);
        let spawned = Arc::new(Spawned::default());
        let config = Arc::new(config);

        let mut runtime = Runtime {
            store: Arc::clone(&store),
            cancel: Some(cancel_tx),
            triggers: Vec::new(),
            spawned: Arc::clone(&spawned),
        };

        // Subscriptions are opened here so a failing store aborts start.
        let workers_sub = store.subscribe_query(&RangeQuery::collection(config.workers_collection()?))?;
        let shards_sub =
            store.subscribe_query(&RangeQuery::collection_group(config.shard_collection_id.clone()))?;

        let scheduled = Controller::new(Arc::clone(&store), &config)?;
        let interval = config.controller.schedule_interval();
        let cancel = cancel_rx.clone();
        runtime.spawn_trigger("tally-controller", move || {
            let ticker = tick(interval);
            loop {
                select! {
                    recv(ticker) -> _ => match scheduled.run_cycle() {
                        Ok(report) => debug!(target: "tally::runtime", status = ?report.status, "Controller cycle"),
                        Err(e) => warn!(target: "tally::runtime", error = %e, "Controller cycle failed"),
                    },
                    recv(cancel) -> _ => break,
                }
            }
        })?;

        let worker_store = Arc::clone(&store);
        let worker_config = Arc::clone(&config);
        let worker_spawned = Arc::clone(&spawned);
        let cancel = cancel_rx.clone();
        runtime.spawn_trigger("tally-worker-trigger", move || loop {
            select! {
                recv(workers_sub.receiver()) -> msg => {
                    let Ok(snapshot) = msg else { break };
                    for change in snapshot.changes {
                        if change.kind == ChangeKind::Removed {
                            continue;
                        }
                        start_worker(&worker_store, &worker_config, &worker_spawned, &cancel, change.doc);
                    }
                },
                recv(cancel) -> _ => break,
            }
        })?;

        let inline = Arc::new(Controller::new(Arc::clone(&store), &config)?);
        let busy = Arc::new(AtomicBool::new(false));
        let shard_spawned = Arc::clone(&spawned);
        let limit = config.controller.inline_shard_limit;
        let window = config.controller.continuous_timeout();
        let cancel = cancel_rx;
        runtime.spawn_trigger("tally-shard-trigger", move || loop {
            select! {
                recv(shards_sub.receiver()) -> msg => {
                    let Ok(snapshot) = msg else { break };
                    if snapshot.changes.is_empty() || busy.swap(true, Ordering::SeqCst) {
                        continue;
                    }
                    let inline = Arc::clone(&inline);
                    let running = Arc::clone(&busy);
                    let cancel = cancel.clone();
                    let spawned = thread::Builder::new()
                        .name("tally-inline".to_string())
                        .spawn(move || {
                            if let Err(e) = inline.aggregate_continuously_until(&Slice::full(), limit, window, &cancel) {
                                warn!(target: "tally::runtime", error = %e, "Continuous aggregation failed");
                            }
                            running.store(false, Ordering::SeqCst);
                        });
                    match spawned {
                        Ok(handle) => shard_spawned.retire(handle),
                        Err(e) => {
                            busy.store(false, Ordering::SeqCst);
                            warn!(target: "tally::runtime", error = %e, "Failed to start continuous aggregation");
                        }
                    }
                },
                recv(cancel) -> _ => break,
            }
        })?;

        info!(target: "tally::runtime", controller = %config.internal_state_path, shards = %config.shard_collection_id, "Runtime started");
        Ok(runtime)
    }

    fn spawn_trigger<F>(&mut self, name: &str, body: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(body)?;
        self.triggers.push(handle);
        Ok(())
    }

    /// Store the runtime operates on
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Workers currently running
    pub fn active_workers(&self) -> usize {
        self.spawned.active_workers()
    }

    /// Stop triggers, cancel running workers and wait for every thread.
    ///
    /// Cancelled workers still write their stats. Calling it twice is a
    /// no-op.
    pub fn shutdown(&mut self) {
        let Some(cancel) = self.cancel.take() else {
            return;
        };
        drop(cancel);
        for handle in self.triggers.drain(..) {
            join_logged(handle, "trigger");
        }
        self.spawned.join_all();
        info!(target: "tally::runtime", "Runtime stopped");
    }
}

impl<S: DocumentStore> Drop for Runtime<S> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn start_worker<S: DocumentStore>(
    store: &Arc<S>,
    config: &TallyConfig,
    spawned: &Spawned,
    cancel: &Receiver<()>,
    metadoc: DocumentSnapshot,
) {
    let path = metadoc.path.clone();
    let mut worker = match Worker::new(Arc::clone(store), &metadoc, config, false) {
        Ok(worker) => worker.with_cancel(cancel.clone()),
        Err(e) => {
            warn!(target: "tally::runtime", worker = %path, error = %e, "Cannot start worker");
            return;
        }
    };

    let result = thread::Builder::new()
        .name(format!("tally-worker-{}", path.id()))
        .spawn(move || match worker.run() {
            Ok(report) => debug!(target: "tally::runtime", worker = %worker.path(), exit = ?report.exit, "Worker run ended"),
            Err(e) => warn!(target: "tally::runtime", worker = %worker.path(), error = %e, "Worker run failed"),
        });
    match result {
        Ok(handle) => spawned.add_worker(path, handle),
        Err(e) => warn!(target: "tally::runtime", worker = %path, error = %e, "Failed to spawn worker"),
    }
}
