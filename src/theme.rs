//! Terminal colors for the job report and error output.
//!
//! Colors are off when `--no-color` or `NO_COLOR` is set, and owo-colors
//! drops them on its own when the stream is not a terminal.

use owo_colors::OwoColorize;
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};

static COLORS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Turn colors off for the rest of the process.
pub fn disable_colors() {
    COLORS_ENABLED.store(false, Ordering::Relaxed);
    owo_colors::set_override(false);
}

pub fn colors_enabled() -> bool {
    COLORS_ENABLED.load(Ordering::Relaxed)
}

fn paint(text: String, style: impl FnOnce(&String) -> String) -> String {
    if colors_enabled() { style(&text) } else { text }
}

/// Semantic styles used by the report.
pub trait Themed: Display {
    /// Bold and underlined.
    fn section_header(&self) -> String {
        paint(self.to_string(), |s| s.bold().underline().to_string())
    }

    /// Field names (yellow).
    fn label(&self) -> String {
        paint(self.to_string(), |s| s.yellow().to_string())
    }

    /// Numbers (cyan).
    fn count(&self) -> String {
        paint(self.to_string(), |s| s.cyan().to_string())
    }

    /// Bold green.
    fn success(&self) -> String {
        paint(self.to_string(), |s| s.green().bold().to_string())
    }

    /// Bold red.
    fn error_style(&self) -> String {
        paint(self.to_string(), |s| s.red().bold().to_string())
    }

    fn warning(&self) -> String {
        paint(self.to_string(), |s| s.yellow().to_string())
    }

    /// Secondary text (dimmed).
    fn muted(&self) -> String {
        paint(self.to_string(), |s| s.dimmed().to_string())
    }
}

impl Themed for String {}
impl Themed for &str {}
impl Themed for usize {}
impl Themed for i32 {}
impl Themed for f64 {}
