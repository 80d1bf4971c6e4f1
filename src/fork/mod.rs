//! Worker fork orchestration.
//!
//! Splits a list of JSON work items across several spawned worker processes,
//! feeds each worker contiguous batches over a newline-delimited JSON pipe
//! protocol and merges the partial results into one [`JobStats`].
//!
//! # Architecture
//!
//! ```text
//!                     ┌──────────────────────┐
//!                     │     Orchestrator     │
//!                     │ JobState (cursor,    │
//!                     │  stats, hooks) mutex │
//!                     └──────────┬───────────┘
//!                                │
//!               ┌────────────────┼────────────────┐
//!               │                │                │
//!         ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!         │ Channel 0 │    │ Channel 1 │    │ Channel N │   collector threads
//!         └─────┬─────┘    └─────┬─────┘    └─────┬─────┘
//!            stdin/stdout     stdin/stdout     stdin/stdout
//!         ┌─────▼─────┐    ┌─────▼─────┐    ┌─────▼─────┐
//!         │ Worker 0  │    │ Worker 1  │    │ Worker N  │   ChildRuntime
//!         └───────────┘    └───────────┘    └───────────┘
//! ```
//!
//! # Behavior
//!
//! - **Dynamic load balancing**: an idle worker claims the next batch from
//!   one shared cursor, so faster workers take more batches
//! - **Child-driven completion**: a worker that receives an empty batch
//!   answers `FINISHED`; the job completes when every worker has
//! - **Fail fast**: a worker that crashes, exits early or writes garbage
//!   kills the whole job
//! - **Batch errors are local**: a batch that fails inside a worker is
//!   reported through `on_error` and the worker keeps going

pub mod aggregate;
mod channel;
pub mod child;
pub mod cursor;
pub mod hooks;
pub mod ipc;
pub mod orchestrator;
pub mod proc;
pub mod protocol;
pub mod signals;
pub mod spawn;

pub use aggregate::{
    AggregateValue, BatchStats, JobStats, LogEntry, LogKind, MergeConflict, ResultAggregate,
    merge,
};
pub use channel::{ChannelState, WorkerSummary};
pub use child::{BatchFailure, BatchProcessor, ChildExit, ChildRuntime, run_worker_main};
pub use cursor::{Batch, SharedOffset};
pub use hooks::{BatchError, ChildReturn, Hooks, Progress};
pub use orchestrator::{DEFAULT_BATCH_SIZE, JobReport, Orchestrator, OrchestratorConfig};
pub use protocol::{ChildMessage, ParentMessage};
pub use spawn::SpawnConfig;
