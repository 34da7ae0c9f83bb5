//! Logger Adapters
//!
//! Implements the `Logger` port with various backends.

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::domain::ports::Logger;

/// Logger that forwards to the `tracing` macros.
///
/// Structured fields are rendered as a JSON string in the `fields` field.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl TracingLogger {
    pub fn new() -> Self {
        Self
    }
}

fn render(fields: Option<&Value>) -> String {
    fields.map(Value::to_string).unwrap_or_default()
}

impl Logger for TracingLogger {
    fn debug(&self, message: &str, fields: Option<&Value>) {
        debug!(fields = %render(fields), "{}", message);
    }

    fn info(&self, message: &str) {
        info!("{}", message);
    }

    fn warn(&self, message: &str) {
        warn!("{}", message);
    }

    fn error(&self, message: &str, fields: Option<&Value>) {
        error!(fields = %render(fields), "{}", message);
    }
}

/// Logger that discards everything. Stands in for an absent logger.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn debug(&self, _message: &str, _fields: Option<&Value>) {}

    fn info(&self, _message: &str) {}

    fn warn(&self, _message: &str) {}

    fn error(&self, _message: &str, _fields: Option<&Value>) {}
}

/// Log level of a collected record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A single collected log line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub message: String,
    pub fields: Option<Value>,
}

/// In-memory log collector for testing.
///
/// Collects log lines in memory for later inspection during tests.
#[derive(Debug, Default)]
pub struct InMemoryLogCollector {
    records: parking_lot::RwLock<Vec<LogRecord>>,
}

impl InMemoryLogCollector {
    /// Create a new in-memory log collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get all collected records.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.read().clone()
    }

    /// Get records at a specific level.
    pub fn records_at(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .read()
            .iter()
            .filter(|r| r.level == level)
            .cloned()
            .collect()
    }

    /// Count records at `level` whose message contains `needle`.
    pub fn count_matching(&self, level: LogLevel, needle: &str) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.level == level && r.message.contains(needle))
            .count()
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    pub fn clear(&self) {
        self.records.write().clear();
    }

    fn push(&self, level: LogLevel, message: &str, fields: Option<&Value>) {
        self.records.write().push(LogRecord {
            level,
            message: message.to_string(),
            fields: fields.cloned(),
        });
    }
}

impl Logger for InMemoryLogCollector {
    fn debug(&self, message: &str, fields: Option<&Value>) {
        self.push(LogLevel::Debug, message, fields);
    }

    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message, None);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message, None);
    }

    fn error(&self, message: &str, fields: Option<&Value>) {
        self.push(LogLevel::Error, message, fields);
    }
}
