//! Callbacks invoked by the orchestrator while a job runs.
//!
//! Hooks run on the collector thread of whichever worker triggered them, with
//! the job lock held. They never run concurrently with each other or with a
//! batch claim, and the next batch for that worker is claimed only after the
//! hook returns.

use super::aggregate::JobStats;
use serde_json::{Map, Value};

/// Snapshot of dispatch progress, passed to the iteration hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    /// Non-empty batches claimed so far.
    pub claimed_batches: usize,
    /// Items handed out so far.
    pub dispatched_items: usize,
    pub total_items: usize,
}

/// A batch that failed inside a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchError {
    pub worker: usize,
    /// Position and length of the failed batch, if one was in flight.
    pub batch: Option<(usize, usize)>,
    pub message: String,
}

/// Data returned by a worker for a successful batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildReturn {
    pub worker: usize,
    pub batch: Option<(usize, usize)>,
    pub data: Value,
}

type IterationHook = Box<dyn FnMut(&Progress, &JobStats) + Send>;
type FinishedHook = Box<dyn FnMut(&JobStats) + Send>;
type ErrorHook = Box<dyn FnMut(&BatchError) + Send>;
type ReturnHook = Box<dyn FnMut(&ChildReturn) + Send>;
type CustomHook = Box<dyn FnMut(usize, &Map<String, Value>) + Send>;

/// Optional job callbacks.
#[derive(Default)]
pub struct Hooks {
    pub(crate) on_iteration: Option<IterationHook>,
    pub(crate) on_finished: Option<FinishedHook>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_child_return: Option<ReturnHook>,
    pub(crate) on_custom: Option<CustomHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called when a worker becomes idle, decimated by the configured
    /// `every_nth` against the number of batches claimed job-wide.
    pub fn on_iteration(mut self, f: impl FnMut(&Progress, &JobStats) + Send + 'static) -> Self {
        self.on_iteration = Some(Box::new(f));
        self
    }

    /// Called once, after the last worker reports `FINISHED`.
    pub fn on_finished(mut self, f: impl FnMut(&JobStats) + Send + 'static) -> Self {
        self.on_finished = Some(Box::new(f));
        self
    }

    /// Called for every `ERROR` response.
    pub fn on_error(mut self, f: impl FnMut(&BatchError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Called for every `DONE` response.
    pub fn on_child_return(mut self, f: impl FnMut(&ChildReturn) + Send + 'static) -> Self {
        self.on_child_return = Some(Box::new(f));
        self
    }

    /// Called for every `CUSTOM` message with its payload, unchanged.
    pub fn on_custom(
        mut self,
        f: impl FnMut(usize, &Map<String, Value>) + Send + 'static,
    ) -> Self {
        self.on_custom = Some(Box::new(f));
        self
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field("on_iteration", &self.on_iteration.is_some())
            .field("on_finished", &self.on_finished.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_child_return", &self.on_child_return.is_some())
            .field("on_custom", &self.on_custom.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_empty_hooks() {
        let hooks = Hooks::new();
        assert!(hooks.on_iteration.is_none());
        assert!(hooks.on_finished.is_none());
        assert!(hooks.on_custom.is_none());
    }

    #[test]
    fn test_builder_registers_callbacks() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let errors = Arc::clone(&seen);
        let custom = Arc::clone(&seen);

        let mut hooks = Hooks::new()
            .on_error(move |e| errors.lock().unwrap().push(e.message.clone()))
            .on_custom(move |worker, payload| {
                custom.lock().unwrap().push(format!("{} {}", worker, payload.len()))
            });

        let on_error = hooks.on_error.as_mut().unwrap();
        on_error(&BatchError {
            worker: 1,
            batch: Some((0, 2)),
            message: "boom".to_string(),
        });

        let payload = json!({"a": 1, "b": 2});
        let on_custom = hooks.on_custom.as_mut().unwrap();
        on_custom(3, payload.as_object().unwrap());

        assert_eq!(*seen.lock().unwrap(), vec!["boom", "3 2"]);
    }

    #[test]
    fn test_debug_shows_registered_hooks() {
        let hooks = Hooks::new().on_finished(|_| {});
        let debug = format!("{:?}", hooks);
        assert!(debug.contains("on_finished: true"));
        assert!(debug.contains("on_error: false"));
    }
}
