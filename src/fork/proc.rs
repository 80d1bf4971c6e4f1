//! Process handle for worker subprocesses.
//!
//! Wraps a spawned child with typed IPC channels over its stdin/stdout.

use super::ipc::{MessageReader, MessageWriter, PipeFd, Received};
use super::protocol::{ChildMessage, ParentMessage};
use super::signals::{TerminationReason, analyze_wait_status};
use crate::error::{ForkError, Result};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::os::unix::io::OwnedFd;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Poll interval while waiting for a worker to exit.
const WAIT_POLL: Duration = Duration::from_millis(10);

/// Signals a worker from outside the thread that owns its [`Proc`].
///
/// The reaped flag is shared with the owning handle and is only flipped while
/// its lock is held, so a pid whose status was already collected (and which
/// the kernel may have reused) is never signalled.
#[derive(Debug, Clone)]
pub struct KillHandle {
    pid: Pid,
    reaped: Arc<Mutex<bool>>,
}

impl KillHandle {
    fn new(pid: Pid) -> Self {
        Self {
            pid,
            reaped: Arc::new(Mutex::new(false)),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Send SIGKILL unless the worker has been reaped.
    ///
    /// Returns whether the signal was delivered.
    pub fn kill(&self) -> bool {
        match self.signal(Signal::SIGKILL) {
            Ok(sent) => sent,
            Err(e) => {
                tracing::debug!(pid = self.pid.as_raw(), error = %e, "Failed to kill worker");
                false
            }
        }
    }

    fn signal(&self, sig: Signal) -> Result<bool> {
        let reaped = self.lock();
        if *reaped {
            return Ok(false);
        }
        signal::kill(self.pid, sig)
            .map(|()| true)
            .map_err(|e| ForkError::Worker(format!("Failed to send {}: {}", sig, e)))
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        self.reaped.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a worker subprocess.
pub struct Proc {
    handle: KillHandle,
    writer: MessageWriter<PipeFd>,
    reader: MessageReader<PipeFd>,
    /// Released handles are neither waited on nor killed on drop.
    released: bool,
}

impl Proc {
    pub fn new(pid: Pid, stdin: PipeFd, stdout: PipeFd) -> Self {
        Self {
            handle: KillHandle::new(pid),
            writer: MessageWriter::new(stdin),
            reader: MessageReader::new(stdout),
            released: false,
        }
    }

    /// Take over a spawned `std::process::Child` and its piped stdin/stdout.
    pub fn from_child(mut child: std::process::Child) -> Result<Self> {
        let pid = Pid::from_raw(child.id() as i32);

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ForkError::Spawn("child stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ForkError::Spawn("child stdout not captured".into()))?;

        // Reaping goes through waitpid on the pid, so the Child itself can go.
        Ok(Self::new(
            pid,
            PipeFd::new(OwnedFd::from(stdin)),
            PipeFd::new(OwnedFd::from(stdout)),
        ))
    }

    pub fn pid(&self) -> Pid {
        self.handle.pid
    }

    /// A handle that can kill this worker from another thread.
    pub fn kill_handle(&self) -> KillHandle {
        self.handle.clone()
    }

    pub fn send(&mut self, message: &ParentMessage) -> Result<()> {
        let pid = self.pid();
        self.writer
            .send(message)
            .map_err(|e| ForkError::Worker(format!("Failed to send to worker {}: {}", pid, e)))
    }

    /// Receive the next message from the worker.
    pub fn recv(&mut self) -> Result<Received<ChildMessage>> {
        let pid = self.pid();
        self.reader.recv().map_err(|e| {
            ForkError::Worker(format!("Failed to receive from worker {}: {}", pid, e))
        })
    }

    /// Wait for the process to exit.
    ///
    /// Reaping happens under the kill guard, so this polls with `WNOHANG`
    /// instead of blocking inside `waitpid`.
    pub fn wait(&mut self) -> Result<WaitStatus> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(status);
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Try to collect the exit status without blocking.
    ///
    /// Returns `None` if the process is still running.
    pub fn try_wait(&mut self) -> Result<Option<WaitStatus>> {
        let mut reaped = self.handle.lock();
        if *reaped {
            return Err(ForkError::Worker("Process already reaped".into()));
        }
        match waitpid(self.handle.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => Ok(None),
            Ok(status) => {
                *reaped = true;
                Ok(Some(status))
            }
            Err(e) => Err(ForkError::Worker(format!("waitpid failed: {}", e))),
        }
    }

    /// Block until the process exits and report why it did.
    pub fn termination(&mut self) -> TerminationReason {
        match self.wait() {
            Ok(status) => analyze_wait_status(status),
            Err(_) => TerminationReason::Unknown,
        }
    }

    fn is_reaped(&self) -> bool {
        *self.handle.lock()
    }

    /// Send SIGKILL to the process and wait for it to exit.
    pub fn kill(&mut self) -> Result<()> {
        if !self.handle.signal(Signal::SIGKILL)? {
            return Ok(());
        }
        self.wait()?;
        Ok(())
    }

    /// Stop tracking the process: it is neither waited on nor killed when
    /// this handle drops.
    pub fn release(&mut self) {
        self.released = true;
    }
}

impl Drop for Proc {
    fn drop(&mut self) {
        if self.released || self.is_reaped() {
            return;
        }
        let _ = self.handle.signal(Signal::SIGTERM);
        std::thread::sleep(WAIT_POLL);
        if let Ok(Some(_)) = self.try_wait() {
            return;
        }
        let _ = self.kill();
    }
}
