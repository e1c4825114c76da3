//! Logging
//!
//! Layers never log through a process-wide handle of their own. Each one is
//! handed a [`LayerLogger`] at construction: a layer name bound to a shared
//! [`LogSink`]. The default sink forwards to `tracing`; tests can swap in a
//! [`MemorySink`] and assert on what was logged.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Log severity understood by every sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Destination for layer log records
pub trait LogSink: Send + Sync {
    /// Record one message emitted by `layer`
    fn log(&self, level: LogLevel, layer: &str, args: fmt::Arguments<'_>);
}

/// Sink that emits `tracing` events with a `layer` field
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, layer: &str, args: fmt::Arguments<'_>) {
        match level {
            LogLevel::Debug => tracing::debug!(layer = layer, "{}", args),
            LogLevel::Info => tracing::info!(layer = layer, "{}", args),
            LogLevel::Warn => tracing::warn!(layer = layer, "{}", args),
            LogLevel::Error => tracing::error!(layer = layer, "{}", args),
        }
    }
}

/// A captured log record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: LogLevel,
    pub layer: String,
    pub message: String,
}

/// Sink that keeps every record in memory
#[derive(Debug, Default)]
pub struct MemorySink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemorySink {
    /// Create an empty sink
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Snapshot of the records captured so far
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }

    /// True if any record at `level` contains `needle`
    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn log(&self, level: LogLevel, layer: &str, args: fmt::Arguments<'_>) {
        if let Ok(mut records) = self.records.lock() {
            records.push(LogRecord {
                level,
                layer: layer.to_string(),
                message: args.to_string(),
            });
        }
    }
}

/// Logging handle owned by a single layer instance
#[derive(Clone)]
pub struct LayerLogger {
    layer: &'static str,
    sink: Arc<dyn LogSink>,
}

impl LayerLogger {
    /// Bind `layer` to `sink`
    pub fn new(layer: &'static str, sink: Arc<dyn LogSink>) -> Self {
        Self { layer, sink }
    }

    /// Logger for `layer` backed by [`TracingSink`]
    pub fn tracing(layer: &'static str) -> Self {
        Self::new(layer, Arc::new(TracingSink))
    }

    /// Same sink, different layer name
    pub fn for_layer(&self, layer: &'static str) -> Self {
        Self {
            layer,
            sink: self.sink.clone(),
        }
    }

    /// Layer name attached to every record
    pub fn layer(&self) -> &'static str {
        self.layer
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.sink.log(LogLevel::Debug, self.layer, args);
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.sink.log(LogLevel::Info, self.layer, args);
    }

    pub fn warn(&self, args: fmt::Arguments<'_>) {
        self.sink.log(LogLevel::Warn, self.layer, args);
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.sink.log(LogLevel::Error, self.layer, args);
    }
}

impl fmt::Debug for LayerLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerLogger")
            .field("layer", &self.layer)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_captures_records() {
        let sink = MemorySink::new();
        let log = LayerLogger::new("MAC", sink.clone());

        log.info(format_args!("TX MAC-PDU proc={}", 3));
        log.warn(format_args!("feedback for unknown process {}", 9));

        let records = sink.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].layer, "MAC");
        assert_eq!(records[0].message, "TX MAC-PDU proc=3");
        assert!(sink.contains(LogLevel::Warn, "unknown process 9"));
        assert!(!sink.contains(LogLevel::Error, "unknown"));
    }

    #[test]
    fn test_for_layer_shares_sink() {
        let sink = MemorySink::new();
        let mac = LayerLogger::new("MAC", sink.clone());
        let rlc = mac.for_layer("RLC");

        rlc.debug(format_args!("hello"));
        assert_eq!(rlc.layer(), "RLC");
        assert_eq!(sink.records()[0].layer, "RLC");
    }
}
