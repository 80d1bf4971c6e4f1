//! Worker-side runtime.
//!
//! A worker process announces itself with `READY`, takes its init data from
//! the first `INIT`, and then answers every non-empty `PROCESS` with `DONE` or
//! `ERROR`. The first empty `PROCESS` shuts it down with `FINISHED`.

use super::aggregate::BatchStats;
use super::ipc::{MessageReader, MessageWriter, PipeFd, Received};
use super::protocol::{ChildMessage, ParentMessage};
use serde_json::{Map, Value};
use std::io::{self, Read, Write};
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};

/// A batch that could not be processed.
///
/// Anything implementing `std::error::Error` converts into it, so `?` works
/// inside processors.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchFailure {
    pub message: String,
    pub data: Option<Value>,
}

impl BatchFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for BatchFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for BatchFailure {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

/// User code run by a worker for each batch.
pub trait BatchProcessor {
    /// Process one non-empty batch.
    ///
    /// Results and logs recorded in `stats` are shipped with the response;
    /// the returned value becomes the `data` of a `DONE`.
    fn process(
        &mut self,
        init: &Value,
        batch: &[Value],
        stats: &mut BatchStats,
    ) -> Result<Value, BatchFailure>;

    /// Release external resources before the worker exits.
    fn shutdown(&mut self) {}
}

impl<F> BatchProcessor for F
where
    F: FnMut(&Value, &[Value], &mut BatchStats) -> Result<Value, BatchFailure>,
{
    fn process(
        &mut self,
        init: &Value,
        batch: &[Value],
        stats: &mut BatchStats,
    ) -> Result<Value, BatchFailure> {
        self(init, batch, stats)
    }
}

/// Why [`ChildRuntime::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildExit {
    /// An empty batch arrived and `FINISHED` was sent.
    Finished,
    /// The parent sent `EXIT`.
    ExitRequested,
    /// The parent closed the pipe.
    ParentClosed,
}

/// Message loop of a worker process.
pub struct ChildRuntime<P> {
    processor: P,
    init_data: Option<Value>,
    stats: BatchStats,
    batches: usize,
}

impl<P: BatchProcessor> ChildRuntime<P> {
    pub fn new(processor: P) -> Self {
        Self {
            processor,
            init_data: None,
            stats: BatchStats::new(),
            batches: 0,
        }
    }

    /// Number of batches processed so far.
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Serve protocol messages from `reader`, answering on `writer`.
    pub fn serve<R: Read, W: Write>(&mut self, reader: R, writer: W) -> io::Result<ChildExit> {
        let mut reader = MessageReader::new(reader);
        let mut writer = MessageWriter::new(writer);

        writer.send(&ChildMessage::Ready)?;

        loop {
            let message = match reader.recv::<ParentMessage>()? {
                Received::Message(message) => message,
                Received::Invalid { error, .. } => {
                    writer.send(&ChildMessage::error(format!("Invalid request: {}", error)))?;
                    continue;
                }
                Received::Closed => {
                    debug!(batches = self.batches, "Parent closed the pipe");
                    self.processor.shutdown();
                    return Ok(ChildExit::ParentClosed);
                }
            };

            match message {
                ParentMessage::Init { init_data } => {
                    if self.init_data.is_some() {
                        warn!("Ignoring repeated INIT");
                    } else {
                        self.init_data = Some(init_data);
                    }
                }
                ParentMessage::Process { items_to_process } if items_to_process.is_empty() => {
                    self.processor.shutdown();
                    writer.send(&ChildMessage::Finished)?;
                    return Ok(ChildExit::Finished);
                }
                ParentMessage::Process { items_to_process } => {
                    let response = self.run_batch(&items_to_process);
                    writer.send(&response)?;
                }
                ParentMessage::Exit => {
                    self.processor.shutdown();
                    return Ok(ChildExit::ExitRequested);
                }
            }
        }
    }

    fn run_batch(&mut self, batch: &[Value]) -> ChildMessage {
        self.batches += 1;
        let empty = Value::Object(Map::new());
        let init = self.init_data.as_ref().unwrap_or(&empty);
        let processor = &mut self.processor;
        let stats = &mut self.stats;

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            processor.process(init, batch, stats)
        }))
        .unwrap_or_else(|payload| Err(BatchFailure::new(panic_message(payload.as_ref()))));

        match outcome {
            Ok(data) => {
                let (result, logs) = self.stats.take();
                ChildMessage::Done { result, logs, data }
            }
            Err(failure) => {
                debug!(error = %failure, "Batch failed");
                self.stats.error(failure.message.clone(), failure.data);
                let (result, logs) = self.stats.take();
                ChildMessage::Error {
                    result,
                    logs,
                    error: failure.message,
                }
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("batch processor panicked: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("batch processor panicked: {}", s)
    } else {
        "batch processor panicked".to_string()
    }
}

/// Run `processor` as a worker on this process's stdin/stdout and exit.
///
/// Exits with status 0 after a clean shutdown and 1 if the pipes fail.
pub fn run_worker_main<P: BatchProcessor>(processor: P) -> ! {
    // Pipe errors surface as io::Error instead of killing the process.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    // Safety: descriptors 0 and 1 are the pipes set up by the parent.
    let stdin = unsafe { PipeFd::from_raw(0) };
    let stdout = unsafe { PipeFd::from_raw(1) };

    let mut runtime = ChildRuntime::new(processor);
    match runtime.serve(stdin, stdout) {
        Ok(exit) => {
            debug!(?exit, batches = runtime.batches(), "Worker exiting");
            std::process::exit(0)
        }
        Err(e) => {
            eprintln!("Worker error: {}", e);
            std::process::exit(1);
        }
    }
}
