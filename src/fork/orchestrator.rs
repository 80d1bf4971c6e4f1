//! Job orchestration across a pool of worker processes.
//!
//! [`Orchestrator::run_batch`] spawns the workers, gives each one a
//! [`WorkerChannel`](super::channel) on its own collector thread and waits
//! until every channel reports `FINISHED`. The first process fault stops the
//! whole job: the remaining workers are killed and the fault is returned.
//! There is no timeout; a worker that never answers keeps the job waiting.

use super::aggregate::JobStats;
use super::channel::{ChannelEvent, JobState, WorkerChannel, WorkerSummary};
use super::cursor::SharedOffset;
use super::hooks::Hooks;
use super::proc::KillHandle;
use super::spawn::{SpawnConfig, spawn_child, spawn_collector_thread};
use crate::error::{ForkError, Result};
use crossbeam_channel::Receiver;
use serde::Serialize;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info, instrument};

/// Default number of items per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Configuration for one orchestrated job.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How to launch each worker.
    pub spawn: SpawnConfig,
    /// Maximum items per batch.
    pub batch_size: usize,
    /// Explicit worker count; defaults to `min(available parallelism, items)`.
    pub children_number: Option<usize>,
    /// Invoke the iteration hook every Nth claimed batch (0 disables it).
    pub every_nth: usize,
    /// Sent once to every worker before its first batch.
    pub init_data: Value,
}

impl OrchestratorConfig {
    pub fn new(spawn: SpawnConfig) -> Self {
        Self {
            spawn,
            batch_size: DEFAULT_BATCH_SIZE,
            children_number: None,
            every_nth: 1,
            init_data: Value::Object(Default::default()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_children(mut self, children: usize) -> Self {
        self.children_number = Some(children);
        self
    }

    pub fn with_every_nth(mut self, every_nth: usize) -> Self {
        self.every_nth = every_nth;
        self
    }

    pub fn with_init_data(mut self, init_data: Value) -> Self {
        self.init_data = init_data;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ForkError::Config("batch size must be at least 1".into()));
        }
        if self.children_number == Some(0) {
            return Err(ForkError::Config("worker count must be at least 1".into()));
        }
        Ok(())
    }
}

/// Outcome of a completed job.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobReport {
    pub stats: JobStats,
    /// One entry per worker, ordered by worker id.
    pub workers: Vec<WorkerSummary>,
    pub elapsed_ms: u128,
}

impl JobReport {
    pub fn total_batches(&self) -> usize {
        self.workers.iter().map(|w| w.batches).sum()
    }

    pub fn total_items(&self) -> usize {
        self.workers.iter().map(|w| w.items).sum()
    }

    pub fn failed_batches(&self) -> usize {
        self.workers.iter().map(|w| w.errors).sum()
    }
}

/// Spawns workers and runs jobs across them.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Number of workers a job of `item_count` items would use.
    pub fn worker_count(&self, item_count: usize) -> usize {
        self.config
            .children_number
            .unwrap_or_else(|| {
                std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1)
                    .min(item_count)
            })
            .max(1)
    }

    /// Process `items` across the worker pool.
    ///
    /// Returns once every worker has reported `FINISHED`, or with the first
    /// worker fault. An empty item list returns immediately without spawning.
    #[instrument(level = "debug", skip_all, fields(items = items.len()))]
    pub fn run_batch(&self, items: Vec<Value>, hooks: Hooks) -> Result<JobReport> {
        if items.is_empty() {
            debug!("No work items, nothing to spawn");
            return Ok(JobReport::default());
        }

        let start = Instant::now();
        let width = self.worker_count(items.len());
        info!(
            workers = width,
            items = items.len(),
            batch_size = self.config.batch_size,
            "Starting job"
        );

        let cursor = SharedOffset::new(items.into(), self.config.batch_size);
        let job = Arc::new(Mutex::new(JobState::new(
            cursor,
            hooks,
            self.config.every_nth,
        )));
        let init_data = Arc::new(self.config.init_data.clone());
        let (events_tx, events_rx) = crossbeam_channel::unbounded();

        let mut pool = RunningPool::default();
        for id in 0..width {
            let proc = match spawn_child(&self.config.spawn) {
                Ok(proc) => proc,
                Err(e) => {
                    pool.abort();
                    return Err(e);
                }
            };
            let kill = proc.kill_handle();
            let channel = WorkerChannel::new(
                id,
                proc,
                Arc::clone(&job),
                Arc::clone(&init_data),
                self.config.spawn.child_unref,
            );
            let tx = events_tx.clone();
            match spawn_collector_thread(format!("forkjob-worker-{}", id), move || channel.run(tx))
            {
                Ok(handle) => pool.push(kill.clone(), handle),
                Err(e) => {
                    pool.abort();
                    return Err(e);
                }
            }
            debug!(worker_id = id, pid = kill.pid().as_raw(), "Worker spawned");
        }
        drop(events_tx);

        let mut workers = pool.wait(&events_rx)?;
        workers.sort_by_key(|w| w.id);

        let stats = job
            .lock()
            .map_err(|_| ForkError::Worker("job state poisoned by a panicking hook".into()))?
            .finish();

        let elapsed_ms = start.elapsed().as_millis();
        info!(
            workers = workers.len(),
            errors = stats.error_count(),
            conflicts = stats.conflicts.len(),
            elapsed_ms = elapsed_ms,
            "Job finished"
        );

        Ok(JobReport {
            stats,
            workers,
            elapsed_ms,
        })
    }
}

struct PoolEntry {
    kill: KillHandle,
    handle: JoinHandle<()>,
    settled: bool,
}

/// Collector threads of a running job.
#[derive(Default)]
struct RunningPool {
    entries: Vec<PoolEntry>,
}

impl RunningPool {
    fn push(&mut self, kill: KillHandle, handle: JoinHandle<()>) {
        self.entries.push(PoolEntry {
            kill,
            handle,
            settled: false,
        });
    }

    /// Wait for every channel to finish, or fail fast on the first fault.
    fn wait(mut self, events: &Receiver<ChannelEvent>) -> Result<Vec<WorkerSummary>> {
        let mut summaries = Vec::with_capacity(self.entries.len());

        while summaries.len() < self.entries.len() {
            match events.recv() {
                Ok(ChannelEvent::Finished(summary)) => {
                    if let Some(entry) = self.entries.get_mut(summary.id) {
                        entry.settled = true;
                    }
                    summaries.push(summary);
                }
                Ok(ChannelEvent::Fault { worker, reason }) => {
                    error!(worker_id = worker, reason = %reason, "Worker failed, stopping job");
                    if let Some(entry) = self.entries.get_mut(worker) {
                        entry.settled = true;
                    }
                    self.abort();
                    return Err(ForkError::ChannelFault { worker, reason });
                }
                Err(_) => {
                    self.abort();
                    return Err(ForkError::Worker(
                        "worker channels closed without reporting".into(),
                    ));
                }
            }
        }

        self.join();
        Ok(summaries)
    }

    /// Kill every worker that has not settled, then join all collectors.
    ///
    /// A worker whose collector already reaped it is skipped by its kill handle.
    fn abort(&mut self) {
        for entry in self.entries.iter().filter(|e| !e.settled) {
            if entry.kill.kill() {
                debug!(pid = entry.kill.pid().as_raw(), "Killed worker");
            }
        }
        self.join();
    }

    fn join(&mut self) {
        for entry in self.entries.drain(..) {
            if entry.handle.join().is_err() {
                error!(pid = entry.kill.pid().as_raw(), "Collector thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig::new(SpawnConfig::new("/nonexistent/forkjob-worker"))
    }

    #[test]
    fn test_config_defaults() {
        let config = config();
        assert_eq!(config.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(config.children_number, None);
        assert_eq!(config.every_nth, 1);
        assert_eq!(config.init_data, json!({}));
    }

    #[test]
    fn test_config_validation() {
        assert!(Orchestrator::new(config().with_batch_size(0)).is_err());
        assert!(Orchestrator::new(config().with_children(0)).is_err());
        assert!(Orchestrator::new(config().with_children(3)).is_ok());
    }

    #[test]
    fn test_worker_count() {
        let explicit = Orchestrator::new(config().with_children(6)).unwrap();
        assert_eq!(explicit.worker_count(2), 6);

        let auto = Orchestrator::new(config()).unwrap();
        assert_eq!(auto.worker_count(1), 1);
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(auto.worker_count(10_000), cpus);
    }

    #[test]
    fn test_empty_items_spawn_nothing() {
        // The worker program does not exist, so any spawn attempt would fail.
        let orchestrator = Orchestrator::new(config()).unwrap();
        let report = orchestrator.run_batch(vec![], Hooks::new()).unwrap();
        assert!(report.workers.is_empty());
        assert!(report.stats.result.is_empty());
    }

    #[test]
    fn test_spawn_failure_is_reported() {
        let orchestrator = Orchestrator::new(config().with_children(2)).unwrap();
        let err = orchestrator
            .run_batch(vec![json!(1), json!(2)], Hooks::new())
            .unwrap_err();
        assert!(matches!(err, ForkError::Spawn(_)));
    }

    #[test]
    fn test_shell_workers_finish() {
        let script = r#"
            echo '{"code":"READY"}'
            read init
            while read batch; do
                case "$batch" in
                    *'"itemsToProcess":[]'*) echo '{"code":"FINISHED"}'; exit 0 ;;
                    *) echo '{"code":"DONE","result":{"count":1}}' ;;
                esac
            done
        "#;
        let spawn = SpawnConfig::new("sh").with_args(["-c", script]);
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::new(spawn).with_batch_size(1).with_children(2))
                .unwrap();

        let items: Vec<Value> = (0..4).map(Value::from).collect();
        let report = orchestrator.run_batch(items, Hooks::new()).unwrap();

        assert_eq!(report.stats.number("count"), Some(4.0));
        assert_eq!(report.workers.len(), 2);
        assert_eq!(report.total_items(), 4);
        assert_eq!(report.total_batches(), 4);
    }

    #[test]
    fn test_shell_worker_nonzero_exit_after_finished_fails_job() {
        let script = r#"
            echo '{"code":"READY"}'
            read init
            read batch
            echo '{"code":"DONE","result":{"count":1}}'
            read batch
            echo '{"code":"FINISHED"}'
            exit 7
        "#;
        let spawn = SpawnConfig::new("sh").with_args(["-c", script]);
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::new(spawn).with_children(1)).unwrap();

        let err = orchestrator
            .run_batch(vec![json!(1)], Hooks::new())
            .unwrap_err();
        assert!(err.to_string().contains("exited with code 7"));
    }

    #[test]
    fn test_abort_skips_reaped_workers() {
        use crate::fork::signals::TerminationReason;
        use nix::sys::signal::Signal;

        let mut done = spawn_child(&SpawnConfig::new("sh").with_args(["-c", "exit 0"])).unwrap();
        let mut live = spawn_child(&SpawnConfig::new("sleep").with_args(["60"])).unwrap();
        assert_eq!(done.termination(), TerminationReason::Exited(0));

        let mut pool = RunningPool::default();
        pool.push(done.kill_handle(), std::thread::spawn(|| {}));
        pool.push(live.kill_handle(), std::thread::spawn(|| {}));
        pool.abort();

        assert!(pool.entries.is_empty());
        assert!(!done.kill_handle().kill());
        assert_eq!(
            live.termination(),
            TerminationReason::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_shell_worker_crash_fails_job() {
        let spawn = SpawnConfig::new("sh").with_args(["-c", "read x; exit 9"]);
        let orchestrator =
            Orchestrator::new(OrchestratorConfig::new(spawn).with_children(1)).unwrap();
        let err = orchestrator
            .run_batch(vec![json!(1)], Hooks::new())
            .unwrap_err();
        match err {
            ForkError::ChannelFault { worker, .. } => assert_eq!(worker, 0),
            other => panic!("Expected ChannelFault, got {:?}", other),
        }
    }
}
