//! Execution logs: what a function logged while it ran.
//!
//! Collection itself lives in `calcnode-services`; these are the
//! immutable results carried back on each result item.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// How much of an invocation's logging is kept.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionLogMode {
    /// Severities only.
    None,
    /// Severities and any exception, but no event text.
    #[default]
    Indicators,
    /// Severities, exception and every event in order.
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A single log event emitted by a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub level: LogLevel,
    pub message: String,
}

/// An error captured from an invocation.
///
/// May come from a live error or from strings formatted on another process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedException {
    pub class_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

/// Log captured for one job item.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionLog {
    pub log_levels: BTreeSet<LogLevel>,
    /// Present only in `Full` mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events: Option<Vec<LogEvent>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<CapturedException>,
}

impl ExecutionLog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn has_exception(&self) -> bool {
        self.exception.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.log_levels.is_empty() && self.exception.is_none()
    }
}
