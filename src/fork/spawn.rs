//! Worker subprocess spawning.
//!
//! Children are started through `std::process::Command` with stdin/stdout
//! piped for the protocol and stderr inherited so their logs reach the
//! parent's terminal.

use super::proc::Proc;
use crate::error::{ForkError, Result};
use std::ffi::OsString;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// How to launch one worker process.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    /// Worker entry point.
    pub program: PathBuf,
    /// Extra arguments passed to every worker.
    pub args: Vec<OsString>,
    /// Extra environment variables passed to every worker.
    pub envs: Vec<(OsString, OsString)>,
    /// Start each worker in its own process group so it outlives
    /// signals aimed at the parent's group.
    pub detached: bool,
    /// Do not wait for workers to exit once they report `FINISHED`.
    pub child_unref: bool,
}

impl SpawnConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            detached: false,
            child_unref: false,
        }
    }

    /// Re-execute the running binary with `args`.
    pub fn current_exe<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let exe = std::env::current_exe()
            .map_err(|e| ForkError::Spawn(format!("Failed to get current executable: {}", e)))?;
        Ok(Self::new(exe).with_args(args))
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn detached(mut self, detached: bool) -> Self {
        self.detached = detached;
        self
    }

    pub fn child_unref(mut self, child_unref: bool) -> Self {
        self.child_unref = child_unref;
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(self.envs.iter().cloned());

        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::inherit());

        if self.detached {
            cmd.process_group(0);
        }
        cmd
    }
}

/// Spawn one worker subprocess.
pub fn spawn_child(config: &SpawnConfig) -> Result<Proc> {
    let child = config.command().spawn().map_err(|e| {
        ForkError::Spawn(format!("{}: {}", config.program.display(), e))
    })?;
    Proc::from_child(child)
}

/// Stack size for collector threads (8 MiB).
pub const COLLECTOR_STACK_SIZE: usize = 8 * 1024 * 1024;

/// Spawn a named collector thread that drives one worker channel.
pub fn spawn_collector_thread<F, T>(name: String, f: F) -> Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    std::thread::Builder::new()
        .name(name)
        .stack_size(COLLECTOR_STACK_SIZE)
        .spawn(f)
        .map_err(|e| ForkError::Spawn(format!("Failed to spawn collector thread: {}", e)))
}
