//! Printing a finished job.

use crate::cli::ReportFormat;
use crate::theme::Themed;
use anyhow::Result;
use forkjob::fork::{AggregateValue, JobReport, LogEntry, ResultAggregate};
use serde_json::Value;
use std::io::Write;

/// Logs shown in the text report before the rest is summarized.
const MAX_LOGS_SHOWN: usize = 20;

pub fn print_report(report: &JobReport, format: ReportFormat) -> Result<()> {
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    match format {
        ReportFormat::Json => {
            serde_json::to_writer_pretty(&mut out, report)?;
            writeln!(out)?;
        }
        ReportFormat::Text => write_text(&mut out, report)?,
    }
    Ok(())
}

fn write_text(out: &mut impl Write, report: &JobReport) -> Result<()> {
    writeln!(out, "{}", "Job Summary".section_header())?;
    writeln!(
        out,
        "{} {}",
        "Workers:".label(),
        report.workers.len().count()
    )?;
    writeln!(
        out,
        "{} {} ({} items)",
        "Batches:".label(),
        report.total_batches().count(),
        report.total_items().count()
    )?;
    let failed = report.failed_batches();
    let failed = if failed == 0 {
        failed.count()
    } else {
        failed.error_style()
    };
    writeln!(out, "{} {}", "Failed batches:".label(), failed)?;
    writeln!(
        out,
        "{} {:.2}s",
        "Elapsed:".label(),
        report.elapsed_ms as f64 / 1000.0
    )?;

    if !report.workers.is_empty() {
        writeln!(out)?;
        writeln!(out, "{}", "Workers".section_header())?;
        for w in &report.workers {
            writeln!(
                out,
                "  #{} {} {} batches, {} items, {} errors",
                w.id,
                format!("(pid {})", w.pid).muted(),
                w.batches.count(),
                w.items.count(),
                w.errors.count()
            )?;
        }
    }

    writeln!(out)?;
    writeln!(out, "{}", "Result".section_header())?;
    if report.stats.result.is_empty() {
        writeln!(out, "  {}", "(empty)".muted())?;
    } else {
        write_aggregate(out, &report.stats.result, 1)?;
    }

    if !report.stats.conflicts.is_empty() {
        writeln!(out)?;
        writeln!(out, "{}", "Merge conflicts".section_header())?;
        for conflict in &report.stats.conflicts {
            writeln!(out, "  {}", conflict.to_string().warning())?;
        }
    }

    if !report.stats.logs.is_empty() {
        writeln!(out)?;
        writeln!(out, "{}", "Logs".section_header())?;
        for entry in report.stats.logs.iter().take(MAX_LOGS_SHOWN) {
            writeln!(out, "  {}", format_log(entry))?;
        }
        let hidden = report.stats.logs.len().saturating_sub(MAX_LOGS_SHOWN);
        if hidden > 0 {
            writeln!(out, "  {}", format!("... {} more", hidden).muted())?;
        }
    }

    Ok(())
}

fn write_aggregate(out: &mut impl Write, aggregate: &ResultAggregate, depth: usize) -> Result<()> {
    let indent = "  ".repeat(depth);
    for (key, value) in aggregate {
        let label = format!("{}:", key);
        match value {
            AggregateValue::Nested(inner) => {
                writeln!(out, "{}{}", indent, label.label())?;
                write_aggregate(out, inner, depth + 1)?;
            }
            AggregateValue::Number(n) => {
                writeln!(out, "{}{} {}", indent, label.label(), n.count())?
            }
            AggregateValue::Text(s) => writeln!(out, "{}{} {}", indent, label.label(), s)?,
            AggregateValue::Scalar(v) => writeln!(out, "{}{} {}", indent, label.label(), v)?,
            AggregateValue::Sequence(items) => writeln!(
                out,
                "{}{} {}",
                indent,
                label.label(),
                Value::Array(items.clone())
            )?,
        }
    }
    Ok(())
}

fn format_log(entry: &LogEntry) -> String {
    let time = entry.timestamp.format("%H:%M:%S%.3f").to_string().muted();
    let kind = if entry.is_error() {
        "error".error_style()
    } else {
        "log".label()
    };
    match &entry.data {
        Some(data) => format!("{} {} {} {}", time, kind, entry.message, data),
        None => format!("{} {} {}", time, kind, entry.message),
    }
}
