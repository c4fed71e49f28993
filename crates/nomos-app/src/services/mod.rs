//! Orchestration layer for IO-bound pipeline services.
//!
//! Modules here coordinate external systems (the relational store, the
//! completion endpoint). Pure transforms live in `crate::pipeline` so the
//! claim/retry/persist machinery stays localized.

pub mod budget;
pub mod model;
pub mod processor;
pub mod queue;
pub mod runner;
pub mod store;
pub mod usage;

pub use budget::{BatchBudget, JobTokenEstimate};
pub use model::{AnalystClient, BatchAnalysis, GenericRateLimiter, HttpAnalystClient, ModelError};
pub use processor::{BatchProcessor, BatchStats, ProcessorError};
pub use queue::{
    ClaimOptions, ClaimedJob, FailureDisposition, PgWorkQueue, QueueError, StatusCount, WorkQueue,
};
pub use runner::{
    RunSummary, connect, drain_backlog, dry_run_once, jobs_reset, jobs_status, run_backlog,
    run_dry_run,
};
pub use store::{BatchState, ItemState, PgResultStore, ResultStore, StoreError};
pub use usage::TokenUsage;
