//! Deployment log events

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Marker that makes a line render as an error in the console
pub const ERROR_MARKER: &str = "[ERROR]";

/// Prefix that makes a line render as an echoed command
pub const COMMAND_PREFIX: &str = "> ";

/// Kind of a log event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Info,
    Error,
    Command,
    Status,
}

impl LogKind {
    /// Classify a line the way a text-only client would
    pub fn infer(text: &str) -> Self {
        if text.starts_with('>') {
            LogKind::Command
        } else if text.contains(ERROR_MARKER) {
            LogKind::Error
        } else {
            LogKind::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Info => "info",
            LogKind::Error => "error",
            LogKind::Command => "command",
            LogKind::Status => "status",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ordered unit of output or status change for a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Monotonic per deployment, starting at 0
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub kind: LogKind,
    pub text: String,
}

/// Text of an error event, carrying the marker text-only clients look for
pub fn error_text(message: impl fmt::Display) -> String {
    format!("{} {}", ERROR_MARKER, message)
}

/// Text of an echoed command
pub fn command_text(command: &str) -> String {
    format!("{}{}", COMMAND_PREFIX, command)
}
