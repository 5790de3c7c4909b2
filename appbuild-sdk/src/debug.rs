//! Debug side-channel.
//!
//! The server's `debug` events and the decoder's own diagnostics go to a
//! [`DebugSink`] handed to the decoder when it is built. Nothing written
//! here ever reaches a conversation log.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Error,
}

impl LogLevel {
    /// Parse the `level` field of a debug payload. Anything other than
    /// `error` is informational.
    pub fn from_wire(level: Option<&str>) -> Self {
        match level {
            Some("error") => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

/// Receives side-channel log lines.
pub trait DebugSink: Send + Sync {
    fn log(&self, message: &str, level: LogLevel);
}

/// Forwards side-channel lines into `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DebugSink for TracingSink {
    fn log(&self, message: &str, level: LogLevel) {
        match level {
            LogLevel::Info => tracing::debug!(target: "appbuild_sdk::debug", "{message}"),
            LogLevel::Error => tracing::warn!(target: "appbuild_sdk::debug", "{message}"),
        }
    }
}

/// A recorded side-channel line.
#[derive(Debug, Clone, Serialize)]
pub struct DebugEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub level: LogLevel,
}

/// Keeps every line in memory, for a debugger panel or tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<DebugEntry>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<DebugEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

impl DebugSink for MemorySink {
    fn log(&self, message: &str, level: LogLevel) {
        self.entries.lock().push(DebugEntry {
            timestamp: Utc::now(),
            message: message.to_string(),
            level,
        });
    }
}
