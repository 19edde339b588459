//! Aggregation engine for tally
//!
//! This crate turns sharded writes into counter values:
//! - Aggregator: folds shards and partials into one delta
//! - Planner: groups a page of shards into disjoint aggregation plans
//! - Worker: long-lived aggregation of one slice of the shard keyspace
//! - Controller: inline aggregation for light traffic, worker balancing
//! - ShardedCounter: writer-side handle with latency-compensated reads
//! - Runtime: in-process wiring of the controller, worker and shard
//!   triggers
//!
//! Everything runs against a `tally_storage::DocumentStore`. Concurrency
//! control is optimistic: workers own disjoint slices and re-check that
//! ownership inside every transaction.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregator;
pub mod balance;
pub mod client;
pub mod controller;
pub mod planner;
pub mod runtime;
pub mod worker;

pub use aggregator::{AggregateUpdate, Aggregator, IdGenerator};
pub use balance::{balance_workers, encode_worker_key, BalancePolicy, WorkerShardingInfo};
pub use client::ShardedCounter;
pub use controller::{
    ContinuousReport, Controller, ControllerStatus, CycleReport, RescheduleOutcome,
};
pub use planner::{plan_aggregations, AggregationPlan, PlanItem};
pub use runtime::Runtime;
pub use worker::{ExitReason, Worker, WorkerReport, WorkerState};
