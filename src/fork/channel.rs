//! Parent-side driver for one worker process.
//!
//! Each [`WorkerChannel`] runs on its own collector thread and walks its
//! worker through the protocol:
//!
//! ```text
//! Spawned -> AwaitingReady -> Idle -> Dispatching -> Idle ... -> Finished
//!                                          \-> Errored (process fault)
//! ```
//!
//! Every `READY`, `DONE` and `ERROR` completes a round: the payload is merged
//! into the job stats, hooks run, and the next batch is claimed from the
//! shared cursor, all inside the job lock. `FINISHED` is the only success
//! signal; the process exiting or the pipe breaking at any earlier point is a
//! fault, and so is a non-zero exit status after `FINISHED`.

use super::aggregate::{JobStats, LogEntry, ResultAggregate};
use super::cursor::{Batch, SharedOffset};
use super::hooks::{BatchError, ChildReturn, Hooks, Progress};
use super::ipc::Received;
use super::proc::Proc;
use super::protocol::{ChildMessage, ParentMessage};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::ChannelFaultReason;
use crossbeam_channel::Sender;
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// How long to wait for a worker to exit after its pipe breaks.
const EXIT_GRACE: Duration = Duration::from_millis(500);

/// Lifecycle of one worker channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelState {
    Spawned,
    AwaitingReady,
    Idle,
    Dispatching,
    Errored,
    Finished,
}

impl ChannelState {
    pub fn can_transition(self, next: ChannelState) -> bool {
        use ChannelState::*;
        match (self, next) {
            (Spawned, AwaitingReady)
            | (AwaitingReady, Idle)
            | (Idle, Dispatching)
            | (Idle, Finished)
            | (Dispatching, Idle)
            | (Dispatching, Finished) => true,
            // A worker can still die abnormally after sending FINISHED.
            (from, Errored) => from != Errored,
            _ => false,
        }
    }
}

/// Per-worker counters reported with the job result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub id: usize,
    pub pid: i32,
    /// Non-empty batches dispatched to this worker.
    pub batches: usize,
    pub items: usize,
    /// Batches the worker answered with `ERROR`.
    pub errors: usize,
}

/// What a worker reported when it became idle.
pub(crate) enum Round {
    Ready,
    Done {
        result: ResultAggregate,
        logs: Vec<LogEntry>,
        data: Value,
    },
    Error {
        result: ResultAggregate,
        logs: Vec<LogEntry>,
        error: String,
    },
}

/// State shared by every channel of one run, guarded by a single mutex.
pub(crate) struct JobState {
    cursor: SharedOffset,
    stats: JobStats,
    hooks: Hooks,
    every_nth: usize,
}

impl JobState {
    pub(crate) fn new(cursor: SharedOffset, hooks: Hooks, every_nth: usize) -> Self {
        Self {
            cursor,
            stats: JobStats::new(),
            hooks,
            every_nth,
        }
    }

    pub(crate) fn progress(&self) -> Progress {
        Progress {
            claimed_batches: self.cursor.claims(),
            dispatched_items: self.cursor.position(),
            total_items: self.cursor.total(),
        }
    }

    /// Fold a worker's report into the job and claim its next batch.
    pub(crate) fn complete_round(
        &mut self,
        worker: usize,
        finished_batch: Option<(usize, usize)>,
        round: Round,
    ) -> Batch {
        match round {
            Round::Ready => {}
            Round::Done { result, logs, data } => {
                self.stats.absorb(result, logs);
                if let Some(hook) = self.hooks.on_child_return.as_mut() {
                    hook(&ChildReturn {
                        worker,
                        batch: finished_batch,
                        data,
                    });
                }
            }
            Round::Error {
                result,
                logs,
                error,
            } => {
                self.stats.absorb(result, logs);
                if let Some(hook) = self.hooks.on_error.as_mut() {
                    hook(&BatchError {
                        worker,
                        batch: finished_batch,
                        message: error,
                    });
                }
            }
        }

        if self.every_nth > 0 && self.cursor.claims() % self.every_nth == 0 {
            let progress = self.progress();
            if let Some(hook) = self.hooks.on_iteration.as_mut() {
                hook(&progress, &self.stats);
            }
        }

        self.cursor.claim_next()
    }

    pub(crate) fn relay_custom(&mut self, worker: usize, payload: &Map<String, Value>) {
        if let Some(hook) = self.hooks.on_custom.as_mut() {
            hook(worker, payload);
        }
    }

    /// Run the finished hook and hand over the accumulated stats.
    pub(crate) fn finish(&mut self) -> JobStats {
        if let Some(hook) = self.hooks.on_finished.as_mut() {
            hook(&self.stats);
        }
        std::mem::take(&mut self.stats)
    }
}

/// Outcome of one channel, sent to the orchestrator.
#[derive(Debug)]
pub(crate) enum ChannelEvent {
    Finished(WorkerSummary),
    Fault {
        worker: usize,
        reason: ChannelFaultReason,
    },
}

/// Sends exactly one event per channel, even if the collector thread unwinds.
struct Reporter {
    worker: usize,
    events: Sender<ChannelEvent>,
    reported: bool,
}

impl Reporter {
    fn report(mut self, event: ChannelEvent) {
        self.reported = true;
        // The orchestrator stops listening after the first fault.
        let _ = self.events.send(event);
    }
}

impl Drop for Reporter {
    fn drop(&mut self) {
        if !self.reported {
            let _ = self.events.send(ChannelEvent::Fault {
                worker: self.worker,
                reason: ChannelFaultReason::Collector("collector thread panicked".into()),
            });
        }
    }
}

/// Parent-side handle to one worker process.
pub(crate) struct WorkerChannel {
    id: usize,
    proc: Proc,
    job: Arc<Mutex<JobState>>,
    init_data: Arc<Value>,
    child_unref: bool,
    state: ChannelState,
    /// Batch currently being processed by the worker, as (start, len).
    in_flight: Option<(usize, usize)>,
    summary: WorkerSummary,
}

impl WorkerChannel {
    pub(crate) fn new(
        id: usize,
        proc: Proc,
        job: Arc<Mutex<JobState>>,
        init_data: Arc<Value>,
        child_unref: bool,
    ) -> Self {
        let summary = WorkerSummary {
            id,
            pid: proc.pid().as_raw(),
            ..Default::default()
        };
        Self {
            id,
            proc,
            job,
            init_data,
            child_unref,
            state: ChannelState::Spawned,
            in_flight: None,
            summary,
        }
    }

    /// Drive the worker until it finishes or faults, then report to the orchestrator.
    pub(crate) fn run(mut self, events: Sender<ChannelEvent>) {
        let reporter = Reporter {
            worker: self.id,
            events,
            reported: false,
        };

        let event = match self.drive().and_then(|()| self.reap_finished()) {
            Ok(()) => {
                debug!(
                    worker_id = self.id,
                    batches = self.summary.batches,
                    items = self.summary.items,
                    errors = self.summary.errors,
                    "Worker finished"
                );
                ChannelEvent::Finished(self.summary.clone())
            }
            Err(reason) => {
                self.transition(ChannelState::Errored);
                warn!(worker_id = self.id, reason = %reason, "Worker channel faulted");
                ChannelEvent::Fault {
                    worker: self.id,
                    reason,
                }
            }
        };

        reporter.report(event);
    }

    fn drive(&mut self) -> Result<(), ChannelFaultReason> {
        self.transition(ChannelState::AwaitingReady);

        loop {
            let received = self
                .proc
                .recv()
                .map_err(|e| ChannelFaultReason::Transport(e.to_string()))?;

            let message = match received {
                Received::Message(message) => message,
                Received::Invalid { line, error } => {
                    let _ = self.proc.kill();
                    return Err(ChannelFaultReason::Undecodable(format!(
                        "{} in {:?}",
                        error,
                        preview(&line)
                    )));
                }
                Received::Closed => return Err(fault_for(self.proc.termination())),
            };

            trace!(
                worker_id = self.id,
                code = message.code(),
                state = ?self.state,
                "Worker message"
            );

            match message {
                ChildMessage::Ready => {
                    if self.state != ChannelState::AwaitingReady {
                        warn!(worker_id = self.id, state = ?self.state, "READY out of sequence");
                    }
                    let init = ParentMessage::init(self.init_data.as_ref().clone());
                    self.send(&init)?;
                    self.transition(ChannelState::Idle);
                    self.dispatch(Round::Ready)?;
                }
                ChildMessage::Done { result, logs, data } => {
                    self.expect_in_flight("DONE");
                    self.transition(ChannelState::Idle);
                    self.dispatch(Round::Done { result, logs, data })?;
                }
                ChildMessage::Error {
                    result,
                    logs,
                    error,
                } => {
                    self.expect_in_flight("ERROR");
                    self.summary.errors += 1;
                    debug!(worker_id = self.id, error = %error, "Batch failed in worker");
                    self.transition(ChannelState::Idle);
                    self.dispatch(Round::Error {
                        result,
                        logs,
                        error,
                    })?;
                }
                ChildMessage::Finished => {
                    self.transition(ChannelState::Finished);
                    return Ok(());
                }
                ChildMessage::Custom { payload } => {
                    self.lock_job()?.relay_custom(self.id, &payload);
                }
            }
        }
    }

    /// Complete the current round and send the worker its next batch.
    ///
    /// An empty batch is sent too; the worker answers it with `FINISHED`.
    fn dispatch(&mut self, round: Round) -> Result<(), ChannelFaultReason> {
        let finished_batch = self.in_flight.take();
        let batch = self
            .lock_job()?
            .complete_round(self.id, finished_batch, round);

        if batch.is_empty() {
            trace!(worker_id = self.id, "No items left, sending empty batch");
        } else {
            trace!(
                worker_id = self.id,
                start = batch.start,
                len = batch.len(),
                "Dispatching batch"
            );
            self.summary.batches += 1;
            self.summary.items += batch.len();
            self.in_flight = Some((batch.start, batch.len()));
        }

        self.transition(ChannelState::Dispatching);
        self.send(&ParentMessage::process(batch.items))
    }

    fn send(&mut self, message: &ParentMessage) -> Result<(), ChannelFaultReason> {
        match self.proc.send(message) {
            Ok(()) => Ok(()),
            Err(e) => {
                debug!(worker_id = self.id, error = %e, "Send to worker failed");
                Err(self.broken_pipe_fault(e.to_string()))
            }
        }
    }

    /// A write failed: prefer the exit status if the worker is already gone.
    fn broken_pipe_fault(&mut self, error: String) -> ChannelFaultReason {
        let deadline = Instant::now() + EXIT_GRACE;
        while Instant::now() < deadline {
            match self.proc.try_wait() {
                Ok(Some(status)) => return fault_for(analyze_wait_status(status)),
                Ok(None) => std::thread::sleep(Duration::from_millis(10)),
                Err(_) => break,
            }
        }
        let _ = self.proc.kill();
        ChannelFaultReason::Transport(error)
    }

    /// Collect the exit status after `FINISHED`; only a clean exit settles the worker.
    fn reap_finished(&mut self) -> Result<(), ChannelFaultReason> {
        if self.child_unref {
            self.proc.release();
            return Ok(());
        }
        match self.proc.termination() {
            reason if reason.is_success() => Ok(()),
            reason => Err(ChannelFaultReason::Terminated(reason)),
        }
    }

    fn expect_in_flight(&self, code: &str) {
        if self.state != ChannelState::Dispatching {
            warn!(
                worker_id = self.id,
                code = code,
                state = ?self.state,
                "Response without a dispatched batch"
            );
        }
    }

    fn transition(&mut self, next: ChannelState) {
        if !self.state.can_transition(next) {
            warn!(
                worker_id = self.id,
                from = ?self.state,
                to = ?next,
                "Unexpected channel state transition"
            );
        }
        trace!(worker_id = self.id, from = ?self.state, to = ?next, "Channel state");
        self.state = next;
    }

    fn lock_job(&self) -> Result<MutexGuard<'_, JobState>, ChannelFaultReason> {
        self.job.lock().map_err(|_| {
            ChannelFaultReason::Collector("job state poisoned by a panicking hook".into())
        })
    }
}

/// Exiting before `FINISHED` is a fault, whatever the status.
fn fault_for(reason: TerminationReason) -> ChannelFaultReason {
    if reason.is_success() {
        ChannelFaultReason::PrematureExit
    } else {
        ChannelFaultReason::Terminated(reason)
    }
}

fn preview(line: &str) -> String {
    const MAX: usize = 80;
    match line.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &line[..idx]),
        None => line.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fork::spawn::{SpawnConfig, spawn_child};
    use serde_json::json;

    fn job(items: Vec<Value>, batch_size: usize, hooks: Hooks) -> Arc<Mutex<JobState>> {
        let cursor = SharedOffset::new(items.into(), batch_size);
        Arc::new(Mutex::new(JobState::new(cursor, hooks, 1)))
    }

    fn run_script(script: &str, job: Arc<Mutex<JobState>>) -> ChannelEvent {
        let proc = spawn_child(&SpawnConfig::new("sh").with_args(["-c", script])).unwrap();
        let channel = WorkerChannel::new(0, proc, job, Arc::new(json!({})), false);
        let (tx, rx) = crossbeam_channel::unbounded();
        channel.run(tx);
        rx.recv().unwrap()
    }

    #[test]
    fn test_state_transitions() {
        use ChannelState::*;
        assert!(Spawned.can_transition(AwaitingReady));
        assert!(Idle.can_transition(Dispatching));
        assert!(Idle.can_transition(Finished));
        assert!(Dispatching.can_transition(Idle));
        assert!(Dispatching.can_transition(Errored));
        assert!(!Idle.can_transition(Idle));
        assert!(Finished.can_transition(Errored));
        assert!(!Errored.can_transition(Errored));
        assert!(!Errored.can_transition(Idle));
    }

    #[test]
    fn test_iteration_hook_decimated_by_claims() {
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let hooks = Hooks::new().on_iteration(move |progress, _| {
            sink.lock().unwrap().push(progress.claimed_batches);
        });
        let cursor = SharedOffset::new((0..6).map(Value::from).collect::<Vec<_>>().into(), 1);
        let mut state = JobState::new(cursor, hooks, 2);

        for _ in 0..6 {
            assert!(!state.complete_round(0, None, Round::Ready).is_empty());
        }
        assert!(state.complete_round(0, None, Round::Ready).is_empty());
        assert_eq!(*fired.lock().unwrap(), vec![0, 2, 4, 6]);
    }

    #[test]
    fn test_round_merges_and_calls_hooks() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let hooks = Hooks::new().on_error(move |err| sink.lock().unwrap().push(err.clone()));
        let cursor = SharedOffset::new(vec![json!(1), json!(2)].into(), 1);
        let mut state = JobState::new(cursor, hooks, 0);

        let mut result = ResultAggregate::new();
        result.insert("count".into(), 1usize.into());
        state.complete_round(
            3,
            Some((0, 1)),
            Round::Error {
                result,
                logs: vec![],
                error: "bad".into(),
            },
        );

        assert_eq!(state.stats.number("count"), Some(1.0));
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].worker, 3);
        assert_eq!(errors[0].batch, Some((0, 1)));
        assert_eq!(state.progress().dispatched_items, 1);
    }

    #[test]
    fn test_channel_done_custom_finished() {
        let returns = Arc::new(Mutex::new(Vec::new()));
        let customs = Arc::new(Mutex::new(Vec::new()));
        let (r, c) = (Arc::clone(&returns), Arc::clone(&customs));
        let hooks = Hooks::new()
            .on_child_return(move |ret| r.lock().unwrap().push(ret.clone()))
            .on_custom(move |_, payload| c.lock().unwrap().push(payload.clone()));
        let job = job(vec![json!(7)], 1, hooks);

        let script = r#"
            echo '{"code":"READY"}'
            read init
            read batch
            echo '{"code":"CUSTOM","stage":"warm"}'
            echo '{"code":"DONE","result":{"count":1},"data":"ok"}'
            read batch
            echo '{"code":"FINISHED"}'
        "#;
        match run_script(script, Arc::clone(&job)) {
            ChannelEvent::Finished(summary) => {
                assert_eq!(summary.batches, 1);
                assert_eq!(summary.items, 1);
                assert_eq!(summary.errors, 0);
            }
            other => panic!("Expected Finished, got {:?}", other),
        }

        assert_eq!(job.lock().unwrap().stats.number("count"), Some(1.0));
        let returns = returns.lock().unwrap();
        assert_eq!(returns[0].data, json!("ok"));
        assert_eq!(returns[0].batch, Some((0, 1)));
        assert_eq!(customs.lock().unwrap()[0]["stage"], json!("warm"));
    }

    #[test]
    fn test_channel_keeps_going_after_error() {
        let job = job(vec![json!(1), json!(2)], 1, Hooks::new());
        let script = r#"
            echo '{"code":"READY"}'
            read init
            read batch
            echo '{"code":"ERROR","error":"bad item"}'
            read batch
            echo '{"code":"DONE","result":{"count":1}}'
            read batch
            echo '{"code":"FINISHED"}'
        "#;
        match run_script(script, job) {
            ChannelEvent::Finished(summary) => {
                assert_eq!(summary.batches, 2);
                assert_eq!(summary.errors, 1);
            }
            other => panic!("Expected Finished, got {:?}", other),
        }
    }

    #[test]
    fn test_exit_zero_before_finished_is_fault() {
        let job = job(vec![json!(1)], 1, Hooks::new());
        match run_script(r#"echo '{"code":"READY"}'; exit 0"#, job) {
            ChannelEvent::Fault { reason, .. } => {
                assert_eq!(reason, ChannelFaultReason::PrematureExit)
            }
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_exit_is_fault() {
        let job = job(vec![json!(1)], 1, Hooks::new());
        match run_script("exit 5", job) {
            ChannelEvent::Fault { worker, reason } => {
                assert_eq!(worker, 0);
                assert_eq!(
                    reason,
                    ChannelFaultReason::Terminated(TerminationReason::Exited(5))
                );
            }
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_nonzero_exit_after_finished_is_fault() {
        let job = job(vec![json!(1)], 1, Hooks::new());
        let script = r#"
            echo '{"code":"READY"}'
            read init
            read batch
            echo '{"code":"DONE","result":{"count":1}}'
            read batch
            echo '{"code":"FINISHED"}'
            exit 7
        "#;
        match run_script(script, job) {
            ChannelEvent::Fault { reason, .. } => assert_eq!(
                reason,
                ChannelFaultReason::Terminated(TerminationReason::Exited(7))
            ),
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_bool_result_does_not_fault() {
        let job = job(vec![json!(1)], 1, Hooks::new());
        let script = r#"
            echo '{"code":"READY"}'
            read init
            read batch
            echo '{"code":"DONE","result":{"ok":true,"count":1}}'
            read batch
            echo '{"code":"FINISHED"}'
        "#;
        match run_script(script, Arc::clone(&job)) {
            ChannelEvent::Finished(summary) => assert_eq!(summary.batches, 1),
            other => panic!("Expected Finished, got {:?}", other),
        }
        let state = job.lock().unwrap();
        assert_eq!(state.stats.number("count"), Some(1.0));
        assert_eq!(
            state.stats.result.get("ok"),
            Some(&crate::fork::AggregateValue::Scalar(json!(true)))
        );
    }

    #[test]
    fn test_garbage_output_is_fault() {
        let job = job(vec![json!(1)], 1, Hooks::new());
        match run_script("echo hello; sleep 5", job) {
            ChannelEvent::Fault { reason, .. } => {
                assert!(matches!(reason, ChannelFaultReason::Undecodable(_)))
            }
            other => panic!("Expected Fault, got {:?}", other),
        }
    }

    #[test]
    fn test_preview_truncates() {
        let long = "x".repeat(200);
        assert_eq!(preview(&long).len(), 83);
        assert_eq!(preview("short"), "short");
    }
}
