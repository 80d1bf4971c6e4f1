//! Logging setup shared by the orchestrating process and its workers.
//!
//! All output goes to stderr (and optionally a file). Stdout is the protocol
//! pipe inside worker processes and the report stream in the parent, so
//! nothing in here ever writes to it.
//!
//! # Environment Variables
//!
//! - `FORKJOB_LOG` - Log filter (overrides RUST_LOG)
//! - `FORKJOB_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `FORKJOB_LOG_FORMAT` - Output format: pretty, compact, json
//! - `FORKJOB_LOG_FILE` - Path to log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! Workers inherit the parent's environment, so these apply to both sides.
//!
//! # Example
//!
//! ```no_run
//! use forkjob::logging::{LogConfig, init};
//!
//! let config = LogConfig::for_parent(1, false).with_env_overrides();
//! init(config);
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer, Registry,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Full human-readable output
    #[default]
    Pretty,
    /// Single-line output
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    #[default]
    Daily,
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Also write to this file (stderr output is kept).
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    /// Emit an event when a span closes, with its timing.
    pub span_events: bool,
    /// Filter directive; takes precedence over `level`.
    pub filter: Option<String>,
    pub show_target: bool,
    pub show_thread_ids: bool,
    pub show_line_numbers: bool,
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Daily,
            span_events: false,
            filter: None,
            show_target: true,
            show_thread_ids: false,
            show_line_numbers: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the orchestrating process, driven by `-v` / `--quiet`.
    ///
    /// No flag logs warnings, `-v` info, `-vv` debug and `-vvv` trace.
    /// `--quiet` keeps errors only. Thread ids are shown from `-vv` up, since
    /// every worker channel runs on its own collector thread.
    pub fn for_parent(verbose: u8, quiet: bool) -> Self {
        let level = if quiet {
            Level::ERROR
        } else {
            match verbose {
                0 => Level::WARN,
                1 => Level::INFO,
                2 => Level::DEBUG,
                _ => Level::TRACE,
            }
        };
        let mut config = Self::default().with_level(level);
        if verbose >= 2 {
            config.show_thread_ids = true;
        }
        config
    }

    /// Preset for worker processes.
    ///
    /// Workers share the parent's stderr, so output stays on one line per
    /// event and never uses colors.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ansi: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Apply `FORKJOB_LOG*` and `RUST_LOG` overrides.
    ///
    /// An explicit filter set before this call wins over the environment.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    fn with_overrides_from(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if self.filter.is_none() {
            self.filter = var("FORKJOB_LOG").or_else(|| var("RUST_LOG"));
        }

        if self.filter.is_none()
            && let Some(level) = var("FORKJOB_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }

        if let Some(format) = var("FORKJOB_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if let Some(path) = var("FORKJOB_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(format!("{}", self.level).to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn fmt_layer<W>(&self, writer: W, ansi: bool) -> BoxedLayer
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let span_events = if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let layer = fmt::layer()
            .with_span_events(span_events)
            .with_target(self.show_target)
            .with_thread_ids(self.show_thread_ids)
            .with_line_number(self.show_line_numbers)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.boxed(),
        }
    }

    fn file_appender(&self) -> Option<RollingFileAppender> {
        let path = self.file_path.as_ref()?;
        let dir = path.parent().unwrap_or(Path::new("."));
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("forkjob.log");
        Some(RollingFileAppender::new(self.rotation.into(), dir, file_name))
    }
}

fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Install the global tracing subscriber.
///
/// Logs to stderr, plus the configured file if any. Calling this more than
/// once is a no-op.
pub fn init(config: LogConfig) {
    let mut layers: Vec<BoxedLayer> = vec![config.fmt_layer(std::io::stderr, config.ansi)];
    if let Some(appender) = config.file_appender() {
        layers.push(config.fmt_layer(appender, false));
    }

    let _ = tracing_subscriber::registry()
        .with(layers)
        .with(config.build_filter())
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_log_rotation_from_str() {
        assert_eq!("hourly".parse::<LogRotation>().unwrap(), LogRotation::Hourly);
        assert_eq!("never".parse::<LogRotation>().unwrap(), LogRotation::Never);
        assert!("weekly".parse::<LogRotation>().is_err());
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("warning"), Some(Level::WARN));
        assert_eq!(parse_level("TRACE"), Some(Level::TRACE));
        assert_eq!(parse_level("loud"), None);
    }

    #[test]
    fn test_parent_preset_levels() {
        assert_eq!(LogConfig::for_parent(0, false).level, Level::WARN);
        assert_eq!(LogConfig::for_parent(1, false).level, Level::INFO);
        assert_eq!(LogConfig::for_parent(2, false).level, Level::DEBUG);
        assert_eq!(LogConfig::for_parent(5, false).level, Level::TRACE);
        assert_eq!(LogConfig::for_parent(0, true).level, Level::ERROR);
        assert!(LogConfig::for_parent(2, false).show_thread_ids);
        assert!(!LogConfig::for_parent(1, false).show_thread_ids);
    }

    #[test]
    fn test_worker_preset() {
        let config = LogConfig::for_worker();
        assert_eq!(config.format, LogFormat::Compact);
        assert!(!config.ansi);
        assert!(!config.show_target);
    }

    #[test]
    fn test_env_overrides() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("FORKJOB_LOG_LEVEL", "debug"),
            ("FORKJOB_LOG_FORMAT", "json"),
            ("FORKJOB_LOG_FILE", "/tmp/forkjob.log"),
        ]));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/forkjob.log")));
        assert!(config.filter.is_none());
    }

    #[test]
    fn test_filter_env_precedence() {
        let config = LogConfig::new().with_overrides_from(env(&[
            ("FORKJOB_LOG", "forkjob=trace"),
            ("RUST_LOG", "info"),
            ("FORKJOB_LOG_LEVEL", "error"),
        ]));
        assert_eq!(config.filter.as_deref(), Some("forkjob=trace"));
        // A filter makes the level irrelevant, so it is left alone.
        assert_eq!(config.level, Level::WARN);

        let config = LogConfig::new().with_overrides_from(env(&[("RUST_LOG", "info")]));
        assert_eq!(config.filter.as_deref(), Some("info"));
    }

    #[test]
    fn test_explicit_filter_beats_env() {
        let config = LogConfig::new()
            .with_filter("forkjob=debug".into())
            .with_overrides_from(env(&[("FORKJOB_LOG", "off")]));
        assert_eq!(config.filter.as_deref(), Some("forkjob=debug"));
    }

    #[test]
    fn test_file_appender_only_when_configured() {
        assert!(LogConfig::new().file_appender().is_none());
        let dir = tempfile::tempdir().unwrap();
        let config = LogConfig::new()
            .with_rotation(LogRotation::Never)
            .with_file(dir.path().join("job.log"));
        assert!(config.file_appender().is_some());
    }
}
