//! Per-client run log.
//!
//! Everything that happens during a backup run is appended here keyed by the
//! client id, then drained once at the end of the run into a [`LogSummary`].
//!
//! Wire format, one entry per line:
//!
//! ```text
//! <severity digit>-<unix timestamp>-<message>
//! ```
//!
//! The message may itself contain `-`; readers split on the first one after
//! the two-character severity prefix.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

const SEPARATOR: char = '-';

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info = 0,
    Warning = 1,
    Error = 2,
}

impl Severity {
    pub fn digit(self) -> char {
        match self {
            Severity::Info => '0',
            Severity::Warning => '1',
            Severity::Error => '2',
        }
    }

    pub fn from_digit(c: char) -> Option<Self> {
        match c {
            '0' => Some(Severity::Info),
            '1' => Some(Severity::Warning),
            '2' => Some(Severity::Error),
            _ => None,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Severity::Info),
            1 => Some(Severity::Warning),
            2 => Some(Severity::Error),
            _ => None,
        }
    }

    /// Word used in rendered report lines.
    pub fn word(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.word())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LogLineError {
    #[error("log line is too short")]
    TooShort,
    #[error("unknown severity digit {0:?}")]
    Severity(char),
    #[error("expected separator after severity, found {0:?}")]
    Separator(char),
    #[error("missing separator between timestamp and message")]
    MissingMessage,
    #[error("invalid timestamp {0:?}")]
    Timestamp(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogEntry {
    pub severity: Severity,
    pub timestamp: i64,
    pub message: String,
}

impl LogEntry {
    pub fn new(severity: Severity, timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            severity,
            timestamp,
            message: message.into(),
        }
    }

    pub fn to_line(&self) -> String {
        format!(
            "{}{}{}{}{}",
            self.severity.digit(),
            SEPARATOR,
            self.timestamp,
            SEPARATOR,
            self.message
        )
    }

    pub fn parse_line(line: &str) -> Result<Self, LogLineError> {
        let mut chars = line.chars();
        let digit = chars.next().ok_or(LogLineError::TooShort)?;
        let sep = chars.next().ok_or(LogLineError::TooShort)?;
        let severity = Severity::from_digit(digit).ok_or(LogLineError::Severity(digit))?;
        if sep != SEPARATOR {
            return Err(LogLineError::Separator(sep));
        }
        let (ts, message) = chars
            .as_str()
            .split_once(SEPARATOR)
            .ok_or(LogLineError::MissingMessage)?;
        let timestamp = ts
            .parse::<i64>()
            .map_err(|_| LogLineError::Timestamp(ts.to_string()))?;
        Ok(Self::new(severity, timestamp, message))
    }
}

/// Lenient view of one stored line, as used when rendering reports.
///
/// Never fails: an unknown digit reads as info, a bad timestamp as 0 and a
/// line without a second separator as an empty message.
pub fn parse_line_lenient(line: &str) -> LogEntry {
    let severity = line
        .chars()
        .next()
        .and_then(Severity::from_digit)
        .unwrap_or(Severity::Info);
    let rest: String = line.chars().skip(2).collect();
    let (ts, message) = match rest.split_once(SEPARATOR) {
        Some((ts, message)) => (ts.to_string(), message.to_string()),
        None => (rest, String::new()),
    };
    LogEntry::new(severity, ts.trim().parse().unwrap_or(0), message)
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub errors: i64,
    pub warnings: i64,
    pub infos: i64,
    pub logdata: String,
}

impl LogSummary {
    pub fn from_entries(entries: &[LogEntry]) -> Self {
        let mut summary = LogSummary::default();
        for entry in entries {
            match entry.severity {
                Severity::Info => summary.infos += 1,
                Severity::Warning => summary.warnings += 1,
                Severity::Error => summary.errors += 1,
            }
        }
        summary.logdata = entries
            .iter()
            .map(LogEntry::to_line)
            .collect::<Vec<_>>()
            .join("\n");
        summary
    }
}

/// Process-wide sink for per-client run logs.
pub struct ClientLogger {
    buffers: DashMap<i64, Vec<LogEntry>>,
}

impl ClientLogger {
    pub fn new() -> Self {
        Self {
            buffers: DashMap::new(),
        }
    }

    pub fn log(&self, client_id: i64, message: impl AsRef<str>, severity: Severity) {
        self.log_at(client_id, message, severity, chrono::Utc::now().timestamp());
    }

    pub fn log_at(&self, client_id: i64, message: impl AsRef<str>, severity: Severity, timestamp: i64) {
        let message = message.as_ref().replace(['\r', '\n'], " ");
        match severity {
            Severity::Info => tracing::info!(client_id, "{}", message),
            Severity::Warning => tracing::warn!(client_id, "{}", message),
            Severity::Error => tracing::error!(client_id, "{}", message),
        }
        self.buffers
            .entry(client_id)
            .or_default()
            .push(LogEntry::new(severity, timestamp, message));
    }

    /// Takes every entry logged since the last reset. Appends racing with the
    /// drain land either in the returned batch or in the next one.
    pub fn drain(&self, client_id: i64) -> Vec<LogEntry> {
        self.buffers
            .remove(&client_id)
            .map(|(_, entries)| entries)
            .unwrap_or_default()
    }

    pub fn finalize(&self, client_id: i64) -> LogSummary {
        LogSummary::from_entries(&self.drain(client_id))
    }

    pub fn reset(&self, client_id: i64) {
        self.buffers.remove(&client_id);
    }

    #[cfg(test)]
    pub fn pending(&self, client_id: i64) -> usize {
        self.buffers.get(&client_id).map(|b| b.len()).unwrap_or(0)
    }
}

impl Default for ClientLogger {
    fn default() -> Self {
        Self::new()
    }
}
