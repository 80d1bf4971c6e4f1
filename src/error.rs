//! Error types for forkjob.

use crate::fork::signals::TerminationReason;
use thiserror::Error;

/// Main error type for forkjob.
#[derive(Error, Debug)]
pub enum ForkError {
    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Worker {worker} failed: {reason}")]
    ChannelFault {
        worker: usize,
        reason: ChannelFaultReason,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Worker I/O error: {0}")]
    Worker(String),
}

/// Why a worker channel stopped before reaching `FINISHED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFaultReason {
    /// The child exited or was killed before sending `FINISHED`.
    Terminated(TerminationReason),
    /// The child exited with status zero without sending `FINISHED`.
    PrematureExit,
    /// The pipe to or from the child failed.
    Transport(String),
    /// The child wrote a line that is not a protocol message.
    Undecodable(String),
    /// The parent-side collector thread for this worker failed.
    Collector(String),
}

impl std::fmt::Display for ChannelFaultReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Terminated(reason) => write!(f, "process {}", reason),
            Self::PrematureExit => write!(f, "process exited before sending FINISHED"),
            Self::Transport(msg) => write!(f, "transport error: {}", msg),
            Self::Undecodable(msg) => write!(f, "invalid message: {}", msg),
            Self::Collector(msg) => write!(f, "collector failed: {}", msg),
        }
    }
}

/// Result type alias for forkjob operations.
pub type Result<T> = std::result::Result<T, ForkError>;
