//! The watchdog logging pipeline.
//!
//! Every entry becomes a `tracing` event at the level matching its
//! [`Severity`] and is then handed to loaded modules implementing the
//! watchdog hook.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, error, info, warn};

/// Syslog severity levels (RFC 5424).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Emergency = 0,
    Alert = 1,
    Critical = 2,
    Error = 3,
    Warning = 4,
    Notice = 5,
    Info = 6,
    Debug = 7,
}

impl Severity {
    pub const ALL: [Severity; 8] = [
        Severity::Emergency,
        Severity::Alert,
        Severity::Critical,
        Severity::Error,
        Severity::Warning,
        Severity::Notice,
        Severity::Info,
        Severity::Debug,
    ];

    pub fn level(self) -> u8 {
        self as u8
    }

    pub fn from_level(level: u8) -> Option<Self> {
        Self::ALL.get(level as usize).copied()
    }

    pub fn label(self) -> &'static str {
        match self {
            Severity::Emergency => "emergency",
            Severity::Alert => "alert",
            Severity::Critical => "critical",
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Notice => "notice",
            Severity::Info => "info",
            Severity::Debug => "debug",
        }
    }
}

/// One watchdog entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogEntry {
    /// Category, e.g. `php`, `cron`, `page not found`.
    pub kind: String,
    /// Message with `%name`, `@name` or `!name` placeholders.
    pub message: String,
    pub variables: BTreeMap<String, String>,
    pub severity: Severity,
    pub link: Option<String>,
    pub uid: i64,
    pub request_uri: String,
    pub referer: String,
    pub ip: String,
    pub timestamp: i64,
}

impl LogEntry {
    /// The message with its placeholders substituted.
    ///
    /// Longer placeholder names are substituted first so that `%file` never
    /// clobbers part of `%filename`.
    pub fn formatted(&self) -> String {
        let mut names: Vec<&String> = self.variables.keys().collect();
        names.sort_by_key(|name| std::cmp::Reverse(name.len()));
        let mut message = self.message.clone();
        for name in names {
            message = message.replace(name.as_str(), &self.variables[name]);
        }
        message
    }
}

/// Emit the tracing event for an entry.
pub fn trace_entry(entry: &LogEntry) {
    let message = entry.formatted();
    match entry.severity {
        Severity::Emergency | Severity::Alert | Severity::Critical | Severity::Error => error!(
            kind = %entry.kind,
            severity = entry.severity.label(),
            uid = entry.uid,
            request_uri = %entry.request_uri,
            ip = %entry.ip,
            "{}",
            message
        ),
        Severity::Warning => warn!(
            kind = %entry.kind,
            severity = entry.severity.label(),
            request_uri = %entry.request_uri,
            "{}",
            message
        ),
        Severity::Notice | Severity::Info => {
            info!(kind = %entry.kind, severity = entry.severity.label(), "{}", message)
        }
        Severity::Debug => {
            debug!(kind = %entry.kind, severity = entry.severity.label(), "{}", message)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str, vars: &[(&str, &str)]) -> LogEntry {
        LogEntry {
            kind: "php".to_string(),
            message: message.to_string(),
            variables: vars
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            severity: Severity::Error,
            link: None,
            uid: 0,
            request_uri: "http://localhost/".to_string(),
            referer: String::new(),
            ip: "127.0.0.1".to_string(),
            timestamp: 0,
        }
    }

    #[test]
    fn test_severity_levels() {
        assert_eq!(Severity::Emergency.level(), 0);
        assert_eq!(Severity::Debug.level(), 7);
        assert_eq!(Severity::from_level(4), Some(Severity::Warning));
        assert_eq!(Severity::from_level(8), None);
        assert!(Severity::Error < Severity::Notice);
    }

    #[test]
    fn test_formatted_substitutes_placeholders() {
        let e = entry(
            "%type: !message in %file",
            &[("%type", "Warning"), ("!message", "oops"), ("%file", "a.rs")],
        );
        assert_eq!(e.formatted(), "Warning: oops in a.rs");
    }

    #[test]
    fn test_formatted_prefers_longer_names() {
        let e = entry("%filename %file", &[("%file", "f"), ("%filename", "full")]);
        assert_eq!(e.formatted(), "full f");
    }
}
