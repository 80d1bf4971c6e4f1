//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use forkjob::fork::DEFAULT_BATCH_SIZE;
use forkjob::tasks::Task;
use std::path::PathBuf;

/// Split job items across worker processes and merge their results.
#[derive(Parser, Debug)]
#[command(name = "forkjob")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress everything but errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a task over a list of items using worker processes.
    Run(RunArgs),

    /// Serve as a worker process (spawned by `run`).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the run command.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSON file holding an array of items ("-" reads stdin).
    #[arg(long, conflicts_with = "range", required_unless_present = "range")]
    pub items: Option<PathBuf>,

    /// Use the integers 1..=N as items.
    #[arg(long, value_name = "N")]
    pub range: Option<u64>,

    /// Task each worker runs.
    #[arg(short, long, value_enum, default_value_t = Task::Count)]
    pub task: Task,

    /// Init data sent to every worker, as a JSON object.
    #[arg(long, value_name = "JSON", default_value = "{}")]
    pub init: String,

    /// Maximum items per batch.
    #[arg(short, long, env = "FORKJOB_BATCH_SIZE", default_value_t = DEFAULT_BATCH_SIZE)]
    pub batch_size: usize,

    /// Number of worker processes (default: available CPUs, capped at the item count).
    #[arg(short, long, env = "FORKJOB_WORKERS")]
    pub workers: Option<usize>,

    /// Refresh progress every Nth claimed batch (0 disables progress).
    #[arg(long, env = "FORKJOB_EVERY_NTH", default_value_t = 1)]
    pub every_nth: usize,

    /// Output format.
    #[arg(short, long, value_enum, default_value_t = ReportFormat::Text)]
    pub format: ReportFormat,

    /// Start each worker in its own process group.
    #[arg(long)]
    pub detached: bool,

    /// Do not wait on workers after they finish.
    #[arg(long)]
    pub unref: bool,
}

/// Arguments for the hidden worker command.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Task to serve.
    #[arg(short, long, value_enum)]
    pub task: Task,
}

/// Report format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// Colored summary.
    Text,
    /// Machine-readable JSON.
    Json,
}
