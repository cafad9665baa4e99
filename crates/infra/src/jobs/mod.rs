//! Durable extraction job queue.
//!
//! ## Design
//!
//! - Jobs are owner-scoped; the store is the only shared state
//! - Claims and outcome writes are compare-and-set on a record version
//! - Failed cycles go back to the queue until the retry budget is spent, then die
//! - Stuck claims are reclaimed on the next trigger, not by a background process
//! - A drain runs inside a fixed wall-clock budget and hands leftover work to a
//!   continuation
//!
//! ## Components
//!
//! - `Job`: job record and its state machine
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `claim`: single-winner claim of one queued job
//! - `Reclaimer`: resets or kills jobs abandoned past the liveness window
//! - `DispatchChain`: claims, extracts and records a bounded batch, then continues
//! - `StatusAggregator`: per-owner progress snapshot
//! - `RetentionSweeper`: deletes old terminal jobs
//! - `QueueService`: the entry points the HTTP layer calls

pub mod claim;
pub mod continuation;
pub mod dispatch;
pub mod postgres;
pub mod reclaimer;
pub mod retention;
pub mod service;
pub mod status;
pub mod store;
pub mod types;

pub use claim::{ClaimError, ClaimedJob, claim};
pub use continuation::{
    ChannelSink, ContinuationError, ContinuationHandler, ContinuationRequest, ContinuationSink,
    ContinuationWorker, HttpContinuationSink, RecordingSink, WorkerHandle,
};
pub use dispatch::{DispatchChain, DrainReport, InvocationReport};
pub use postgres::PostgresJobStore;
pub use reclaimer::{ReclaimReport, Reclaimer};
pub use retention::{RetentionReport, RetentionSweeper};
pub use service::{QueueService, SubmitError, TriggerAck};
pub use status::{OwnerStatus, StatusAggregator, StatusCounts, StuckJob};
pub use store::{BatchResult, BatchWrite, InMemoryJobStore, JobQuery, JobStore, JobStoreError, TimedJobStore};
pub use types::{FailureTransition, Job, JobError, JobPayload, JobStatus, Outcome, RetryPolicy};
