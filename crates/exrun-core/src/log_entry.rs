//! Run log entry model shared by the orchestrator, its collaborators and the gateway.

use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::time_utils::now_rfc3339;

/// Enumerates the kinds of entries a run log can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    Info,
    Warn,
    Error,
    Trace,
    Console,
    Navigation,
    State,
    Meta,
    End,
    Ping,
}

impl LogKind {
    /// Returns the stable wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Trace => "trace",
            Self::Console => "console",
            Self::Navigation => "navigation",
            Self::State => "state",
            Self::Meta => "meta",
            Self::End => "end",
            Self::Ping => "ping",
        }
    }
}

/// One immutable entry in a run's append-only log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: String,
    #[serde(rename = "type")]
    pub kind: LogKind,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl LogEntry {
    pub fn new(kind: LogKind, text: impl Into<String>) -> Self {
        Self {
            ts: now_rfc3339(),
            kind,
            text: text.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn info(text: impl Into<String>) -> Self {
        Self::new(LogKind::Info, text)
    }

    pub fn warn(text: impl Into<String>) -> Self {
        Self::new(LogKind::Warn, text)
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::new(LogKind::Error, text)
    }

    /// Keep-alive marker interleaved into live streams. Consumers ignore it.
    pub fn ping() -> Self {
        Self::new(LogKind::Ping, "")
    }
}

/// Single append entry point used by run collaborators to write into a run log.
pub trait LogSink: Send + Sync {
    fn emit(&self, entry: LogEntry);
}

/// Sink that keeps entries in memory; used where no store is attached.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn texts_of(&self, kind: LogKind) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| entry.text)
            .collect()
    }
}

impl LogSink for MemoryLogSink {
    fn emit(&self, entry: LogEntry) {
        match self.entries.lock() {
            Ok(mut guard) => guard.push(entry),
            Err(poisoned) => poisoned.into_inner().push(entry),
        }
    }
}
