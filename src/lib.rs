//! forkjob - split job items across forked worker processes and merge
//! their results.
//!
//! The [`fork`] module holds the orchestrator, the worker-side runtime and
//! the pipe protocol between them. [`tasks`] provides the built-in batch
//! processors served by the `forkjob worker` entry point.
//!
//! ```no_run
//! use forkjob::fork::{Hooks, Orchestrator, OrchestratorConfig, SpawnConfig};
//! use serde_json::json;
//!
//! # fn main() -> forkjob::error::Result<()> {
//! let spawn = SpawnConfig::current_exe(["worker", "--task", "count"])?;
//! let orchestrator = Orchestrator::new(OrchestratorConfig::new(spawn).with_batch_size(2))?;
//!
//! let items = (1..=5).map(|n| json!(n)).collect();
//! let report = orchestrator.run_batch(items, Hooks::new())?;
//! assert_eq!(report.stats.number("count"), Some(5.0));
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod fork;
pub mod logging;
pub mod tasks;

pub use error::{ForkError, Result};
