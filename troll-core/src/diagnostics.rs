//! Diagnostic output.
//!
//! Protocol clients never log directly. They are handed a sink and report
//! through it, so embedding applications decide where the text goes.

use log::Level;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Receives diagnostic messages from the core.
pub trait DiagnosticSink: Send + Sync {
    fn record(&self, level: Level, message: &str);
}

/// Forwards everything to the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl DiagnosticSink for LogSink {
    fn record(&self, level: Level, message: &str) {
        log::log!(target: "troll_core", level, "{}", message);
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn record(&self, _level: Level, _message: &str) {}
}

/// Keeps every message in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    messages: Mutex<Vec<(Level, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<(Level, String)> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }

    /// True if any recorded message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.messages().iter().any(|(_, m)| m.contains(needle))
    }
}

impl DiagnosticSink for MemorySink {
    fn record(&self, level: Level, message: &str) {
        if let Ok(mut messages) = self.messages.lock() {
            messages.push((level, message.to_string()));
        }
    }
}

/// Cheap handle held by every client.
#[derive(Clone)]
pub struct Diagnostics {
    sink: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Diagnostics")
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl Diagnostics {
    pub fn new(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self { sink }
    }

    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink))
    }

    pub fn trace(&self, message: impl fmt::Display) {
        self.emit(Level::Trace, message);
    }

    pub fn debug(&self, message: impl fmt::Display) {
        self.emit(Level::Debug, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.emit(Level::Info, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.emit(Level::Warn, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.emit(Level::Error, message);
    }

    fn emit(&self, level: Level, message: impl fmt::Display) {
        self.sink.record(level, &message.to_string());
    }
}
