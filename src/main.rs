//! forkjob - run a task over many items in parallel worker processes

mod cli;
mod report;
mod theme;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use owo_colors::{OwoColorize, Stream::Stderr};
use serde_json::Value;
use std::io::Read;
use std::path::Path;

use cli::{Cli, Commands, RunArgs, WorkerArgs};
use forkjob::fork::{Hooks, Orchestrator, OrchestratorConfig, SpawnConfig, run_worker_main};
use forkjob::logging::{self, LogConfig};

fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        theme::disable_colors();
    }

    let result = match &cli.command {
        Commands::Run(args) => cmd_run(&cli, args),
        Commands::Worker(args) => cmd_worker(&cli, args),
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Split the items into batches and run them across worker processes.
fn cmd_run(cli: &Cli, args: &RunArgs) -> Result<()> {
    logging::init(LogConfig::for_parent(cli.verbose, cli.quiet).with_env_overrides());

    let items = load_items(args)?;
    let init_data: Value =
        serde_json::from_str(&args.init).context("Failed to parse --init as JSON")?;
    if !init_data.is_object() {
        bail!("--init must be a JSON object");
    }

    let spawn = SpawnConfig::current_exe(worker_args(cli, args))?
        .detached(args.detached)
        .child_unref(args.unref);
    let mut config = OrchestratorConfig::new(spawn)
        .with_batch_size(args.batch_size)
        .with_every_nth(args.every_nth)
        .with_init_data(init_data);
    if let Some(workers) = args.workers {
        config = config.with_children(workers);
    }
    let orchestrator = Orchestrator::new(config)?;

    tracing::info!(
        task = %args.task,
        items = items.len(),
        workers = orchestrator.worker_count(items.len()),
        "Running job"
    );

    let progress = progress_bar(cli, args, items.len());
    let hooks = job_hooks(&progress);
    let outcome = orchestrator.run_batch(items, hooks);
    progress.finish_and_clear();

    let report = outcome.context("Job failed")?;
    report::print_report(&report, args.format)
}

/// Serve batches on stdin/stdout for a parent `run`.
fn cmd_worker(cli: &Cli, args: &WorkerArgs) -> Result<()> {
    let config = LogConfig::for_parent(cli.verbose, cli.quiet);
    logging::init(
        LogConfig::for_worker()
            .with_level(config.level)
            .with_env_overrides(),
    );

    let _span =
        tracing::info_span!("worker", pid = std::process::id(), task = %args.task).entered();
    run_worker_main(args.task.processor())
}

/// Arguments for the hidden worker subcommand, mirroring the parent's verbosity.
fn worker_args(cli: &Cli, args: &RunArgs) -> Vec<String> {
    let mut worker = vec![
        "worker".to_string(),
        "--task".to_string(),
        args.task.to_string(),
    ];
    if cli.quiet {
        worker.push("--quiet".to_string());
    } else if cli.verbose > 0 {
        worker.push(format!("-{}", "v".repeat(cli.verbose as usize)));
    }
    worker
}

fn load_items(args: &RunArgs) -> Result<Vec<Value>> {
    if let Some(n) = args.range {
        return Ok((1..=n).map(Value::from).collect());
    }
    let Some(path) = args.items.as_deref() else {
        bail!("Either --items or --range is required");
    };
    parse_items(path)
}

fn parse_items(path: &Path) -> Result<Vec<Value>> {
    let content = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read items from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read items from {}", path.display()))?
    };

    match serde_json::from_str::<Value>(&content)
        .with_context(|| format!("Failed to parse {} as JSON", path.display()))?
    {
        Value::Array(items) => Ok(items),
        other => bail!(
            "{} must hold a JSON array of items, found {}",
            path.display(),
            json_kind(&other)
        ),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn progress_bar(cli: &Cli, args: &RunArgs, total: usize) -> ProgressBar {
    if cli.quiet || args.every_nth == 0 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} items {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("█▓▒░  "),
    );
    pb.enable_steady_tick(std::time::Duration::from_millis(100));
    pb
}

fn job_hooks(progress: &ProgressBar) -> Hooks {
    let on_iteration = progress.clone();
    let on_error = progress.clone();
    let mut failed = 0usize;

    Hooks::new()
        .on_iteration(move |p, _stats| {
            on_iteration.set_position(p.dispatched_items as u64);
        })
        .on_error(move |e| {
            failed += 1;
            on_error.set_message(format!("({} failed)", failed));
            tracing::warn!(worker = e.worker, batch = ?e.batch, error = %e.message, "Batch failed");
        })
        .on_custom(|worker, payload| {
            tracing::info!(worker, payload = %serde_json::Value::Object(payload.clone()), "Worker message");
        })
}
