//! Structured logging on `tracing`
//!
//! Every execution runs inside an `execution` span carrying its id and
//! workflow id, so JSON log lines can be grouped per run without threading
//! ids through every message.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::{Level, Span};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::FmtSubscriber;

/// Verbosity of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Error => Level::ERROR,
            LogLevel::Warn => Level::WARN,
            LogLevel::Info => Level::INFO,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Trace => Level::TRACE,
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            other => Err(format!("unknown log level '{}'", other)),
        }
    }
}

/// Line format of the global subscriber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// One JSON object per line, for log shippers
    #[default]
    Json,
    /// Human-readable lines for a terminal
    Pretty,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(LogFormat::Json),
            "pretty" | "text" => Ok(LogFormat::Pretty),
            other => Err(format!("unknown log format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    /// Emit a line when an execution span closes, with its busy/idle time
    pub span_timings: bool,
}

impl LogConfig {
    /// Parse settings strings. Unknown values fall back to the defaults
    /// with a note on stderr, since logging is not up yet.
    pub fn parse(level: &str, format: &str) -> Self {
        let level = level.parse().unwrap_or_else(|e| {
            eprintln!("{}, using info", e);
            LogLevel::default()
        });
        let format = format.parse().unwrap_or_else(|e| {
            eprintln!("{}, using json", e);
            LogFormat::default()
        });
        Self {
            level,
            format,
            span_timings: false,
        }
    }

    pub fn with_span_timings(mut self, enabled: bool) -> Self {
        self.span_timings = enabled;
        self
    }
}

/// Install the global subscriber. Logs go to stderr so stdout stays free
/// for command output.
pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let span_events = if config.span_timings {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let builder = FmtSubscriber::builder()
        .with_max_level(Level::from(config.level))
        .with_span_events(span_events)
        .with_writer(std::io::stderr);

    match config.format {
        LogFormat::Json => {
            let subscriber = builder.json().with_current_span(true).with_span_list(false).finish();
            tracing::subscriber::set_global_default(subscriber)?
        }
        LogFormat::Pretty => tracing::subscriber::set_global_default(builder.finish())?,
    }

    Ok(())
}

/// Span wrapping one drive of an execution
pub fn execution_span(execution_id: &str, workflow_id: &str) -> Span {
    tracing::info_span!("execution", execution_id = %execution_id, workflow_id = %workflow_id)
}
