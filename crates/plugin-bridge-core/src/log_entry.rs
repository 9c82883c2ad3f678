//! Captured console log entries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity of a captured console call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
}

impl LogLevel {
    /// Map a remote console call type (`log`, `warning`, `assert`, ...) to a level.
    #[must_use]
    pub fn from_console_type(kind: &str) -> Self {
        match kind {
            "info" => Self::Info,
            "warn" | "warning" => Self::Warn,
            "error" | "assert" => Self::Error,
            "debug" | "trace" | "verbose" => Self::Debug,
            _ => Self::Log,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Log => "log",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Debug => "debug",
        }
    }
}

/// Where a log entry originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    /// The plugin's isolated frame or a worker it spawned.
    Plugin,
    /// The design application's own frame.
    Host,
    /// Any other in-page script.
    Page,
    Unknown,
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub function_name: String,
    pub url: String,
    pub line_number: u32,
    pub column_number: u32,
}

/// A captured stack trace, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackTrace {
    pub frames: Vec<StackFrame>,
}

impl StackTrace {
    /// URL of the innermost frame that has one.
    #[must_use]
    pub fn top_url(&self) -> Option<&str> {
        self.frames
            .iter()
            .map(|f| f.url.as_str())
            .find(|url| !url.is_empty())
    }
}

/// A single captured console entry.
///
/// Entries are immutable once pushed into a [`crate::LogBuffer`]; the buffer
/// only ever hands out clones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    /// Unix epoch milliseconds.
    pub timestamp: i64,
    pub level: LogLevel,
    pub message: String,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTrace>,
    pub source: LogSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_url: Option<String>,
}

impl LogEntry {
    /// Create an entry stamped with the current time.
    #[must_use]
    pub fn new(level: LogLevel, message: impl Into<String>, source: LogSource) -> Self {
        Self {
            timestamp: now_millis(),
            level,
            message: message.into(),
            args: Vec::new(),
            stack_trace: None,
            source,
            worker_url: None,
        }
    }

    #[must_use]
    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<Value>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_stack_trace(mut self, stack_trace: StackTrace) -> Self {
        self.stack_trace = Some(stack_trace);
        self
    }

    #[must_use]
    pub fn with_worker_url(mut self, url: impl Into<String>) -> Self {
        self.worker_url = Some(url.into());
        self
    }
}

/// Current time as Unix epoch milliseconds.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Render console arguments into a single message line.
#[must_use]
pub fn format_message(args: &[Value]) -> String {
    args.iter()
        .map(|arg| match arg {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}
