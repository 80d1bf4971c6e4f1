//! Built-in batch processors run by `forkjob worker --task <TASK>`.
//!
//! Each task reads its options from the job's init data:
//!
//! | Task      | Init keys                     | Result keys |
//! |-----------|-------------------------------|-------------|
//! | `count`   |                               | `count`     |
//! | `sum`     |                               | `sum`       |
//! | `echo`    |                               | `items`     |
//! | `fail-on` | `failOn` (array)              | `count`     |
//! | `exit-on` | `exitOn` (array), `exitCode`  | `count`     |
//! | `sleep`   | `sleepMs`                     | `count`     |

use crate::fork::{BatchFailure, BatchProcessor, BatchStats};
use clap::ValueEnum;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, warn};

/// Default delay of the `sleep` task, per batch.
const DEFAULT_SLEEP_MS: u64 = 100;

/// Built-in work a worker can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Task {
    /// Count the items of each batch.
    Count,
    /// Add up numeric items; anything else is logged as an error.
    Sum,
    /// Collect every item under `items` and return each batch as data.
    Echo,
    /// Fail batches that hold an item listed in `failOn`.
    FailOn,
    /// Exit the worker with `exitCode` on meeting an item listed in `exitOn`.
    ExitOn,
    /// Sleep `sleepMs` per batch, then count.
    Sleep,
}

impl Task {
    pub fn name(self) -> &'static str {
        match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Echo => "echo",
            Self::FailOn => "fail-on",
            Self::ExitOn => "exit-on",
            Self::Sleep => "sleep",
        }
    }

    pub fn processor(self) -> TaskProcessor {
        TaskProcessor { task: self }
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// [`BatchProcessor`] for a built-in [`Task`].
#[derive(Debug, Clone, Copy)]
pub struct TaskProcessor {
    task: Task,
}

impl BatchProcessor for TaskProcessor {
    fn process(
        &mut self,
        init: &Value,
        batch: &[Value],
        stats: &mut BatchStats,
    ) -> Result<Value, BatchFailure> {
        match self.task {
            Task::Count => {
                stats.add_result("count", batch.len());
                Ok(Value::Null)
            }
            Task::Sum => {
                let mut sum = 0.0;
                for item in batch {
                    match item.as_f64() {
                        Some(n) => sum += n,
                        None => stats.error("not a number", Some(item.clone())),
                    }
                }
                stats.add_result("sum", sum);
                Ok(Value::from(sum))
            }
            Task::Echo => {
                stats.add_result("items", batch.to_vec());
                Ok(Value::Array(batch.to_vec()))
            }
            Task::FailOn => {
                if let Some(item) = find_listed(init, "failOn", batch) {
                    return Err(BatchFailure::new(format!("refusing item {}", item))
                        .with_data(item.clone()));
                }
                stats.add_result("count", batch.len());
                Ok(Value::Null)
            }
            Task::ExitOn => {
                if let Some(item) = find_listed(init, "exitOn", batch) {
                    let code = init
                        .get("exitCode")
                        .and_then(Value::as_i64)
                        .and_then(|c| i32::try_from(c).ok())
                        .unwrap_or(1);
                    warn!(item = %item, code, "Exiting on listed item");
                    std::process::exit(code);
                }
                stats.add_result("count", batch.len());
                Ok(Value::Null)
            }
            Task::Sleep => {
                let ms = init
                    .get("sleepMs")
                    .and_then(Value::as_u64)
                    .unwrap_or(DEFAULT_SLEEP_MS);
                debug!(ms, items = batch.len(), "Sleeping before counting");
                std::thread::sleep(Duration::from_millis(ms));
                stats.add_result("count", batch.len());
                Ok(Value::Null)
            }
        }
    }
}

/// First batch item that also appears in the init array under `key`.
fn find_listed<'a>(init: &Value, key: &str, batch: &'a [Value]) -> Option<&'a Value> {
    let listed = init.get(key)?.as_array()?;
    batch.iter().find(|item| listed.contains(item))
}
