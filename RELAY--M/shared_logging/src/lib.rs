#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured JSON logging and operator console sinks shared across the relay.

use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

/// Structured log record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Module emitting the log.
    pub module: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary JSON payload for metrics/fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(module: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            module: module.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }
}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line.
    ///
    /// The line goes out in a single append so records from other handles on
    /// the same file never interleave.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock();
        writer.write_all(&line)?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path (useful for tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// A single line destined for the operator console.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConsoleLine {
    /// Time the line was produced.
    pub timestamp: DateTime<Utc>,
    /// Logical source (`dispatch`, `rules`, `relay`, ...).
    pub source: String,
    /// Printed text.
    pub message: String,
}

impl ConsoleLine {
    /// Creates a line stamped with the current time.
    #[must_use]
    pub fn new(source: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ConsoleLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}",
            self.timestamp.format("%H:%M:%S"),
            self.source,
            self.message
        )
    }
}

/// Fire-and-forget text sink for human-readable output.
///
/// Implementations must not block the caller for any meaningful amount of time.
pub trait ConsoleSink: Send + Sync {
    /// Prints a line.
    fn print(&self, line: ConsoleLine);
}

impl ConsoleSink for JsonLogger {
    fn print(&self, line: ConsoleLine) {
        let mut record = LogRecord::new(line.source, LogLevel::Info, line.message);
        record.timestamp = line.timestamp;
        if let Err(err) = self.log(&record) {
            tracing::warn!("console log write failed: {err}");
        }
    }
}

/// Source-tagged handle onto a console sink.
#[derive(Clone)]
pub struct ConsoleWriter {
    source: Arc<str>,
    sink: Arc<dyn ConsoleSink>,
}

impl fmt::Debug for ConsoleWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleWriter")
            .field("source", &self.source)
            .finish()
    }
}

impl ConsoleWriter {
    /// Creates a writer tagging every line with `source`.
    #[must_use]
    pub fn new(source: impl Into<String>, sink: Arc<dyn ConsoleSink>) -> Self {
        Self {
            source: Arc::from(source.into()),
            sink,
        }
    }

    /// Returns a writer sharing the same sink under another source tag.
    #[must_use]
    pub fn with_source(&self, source: impl Into<String>) -> Self {
        Self::new(source, Arc::clone(&self.sink))
    }

    /// Source tag applied to every line.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Prints a message.
    pub fn print(&self, message: impl Into<String>) {
        self.sink
            .print(ConsoleLine::new(self.source.as_ref(), message.into()));
    }
}

/// Bounded in-memory console buffer.
///
/// Lines fall out once `capacity` is exceeded and, when a maximum age is set,
/// once they are older than that age.
#[derive(Debug)]
pub struct MemoryConsole {
    capacity: usize,
    max_age: Option<chrono::Duration>,
    lines: Mutex<VecDeque<ConsoleLine>>,
}

impl MemoryConsole {
    /// Creates a buffer retaining at most `capacity` lines.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            max_age: None,
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Expires lines older than `max_age`.
    #[must_use]
    pub fn with_max_age(mut self, max_age: std::time::Duration) -> Self {
        self.max_age = chrono::Duration::from_std(max_age).ok();
        self
    }

    fn expire(&self, lines: &mut VecDeque<ConsoleLine>) {
        if let Some(max_age) = self.max_age {
            let cutoff = Utc::now() - max_age;
            lines.retain(|line| line.timestamp >= cutoff);
        }
    }

    /// Snapshot of retained lines, oldest first.
    #[must_use]
    pub fn lines(&self) -> Vec<ConsoleLine> {
        let mut lines = self.lines.lock();
        self.expire(&mut lines);
        lines.iter().cloned().collect()
    }

    /// Returns true when any retained message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        let mut lines = self.lines.lock();
        self.expire(&mut lines);
        lines.iter().any(|line| line.message.contains(needle))
    }

    /// Drops every retained line.
    pub fn clear(&self) {
        self.lines.lock().clear();
    }
}

impl ConsoleSink for MemoryConsole {
    fn print(&self, line: ConsoleLine) {
        let mut lines = self.lines.lock();
        self.expire(&mut lines);
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }
}

/// Writes console lines to standard output.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutConsole;

impl ConsoleSink for StdoutConsole {
    fn print(&self, line: ConsoleLine) {
        println!("{line}");
    }
}

/// Forwards every line to each registered sink in order.
#[derive(Default, Clone)]
pub struct ConsoleFanout {
    sinks: Vec<Arc<dyn ConsoleSink>>,
}

impl fmt::Debug for ConsoleFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsoleFanout")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl ConsoleFanout {
    /// Creates an empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a sink.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ConsoleSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of registered sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether no sink is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ConsoleSink for ConsoleFanout {
    fn print(&self, line: ConsoleLine) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.print(line.clone());
            }
            last.print(line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn writes_json_lines() {
        let dir = tempdir().unwrap();
        let logger = JsonLogger::new(dir.path().join("test.log")).unwrap();
        logger
            .log(&LogRecord::new("module", LogLevel::Info, "hello"))
            .unwrap();
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"message\":\"hello\""));
    }

    #[test]
    fn memory_console_drops_oldest_lines() {
        let console = Arc::new(MemoryConsole::new(2));
        let writer = ConsoleWriter::new("dispatch", console.clone());
        writer.print("one");
        writer.print("two");
        writer.print("three");
        let lines = console.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].message, "two");
        assert_eq!(lines[1].source, "dispatch");
    }

    #[test]
    fn memory_console_expires_old_lines() {
        let console = MemoryConsole::new(8).with_max_age(std::time::Duration::from_secs(300));
        let mut stale = ConsoleLine::new("relay", "stale");
        stale.timestamp = Utc::now() - chrono::Duration::minutes(6);
        console.print(stale);
        console.print(ConsoleLine::new("relay", "fresh"));
        assert!(!console.contains("stale"));
        assert_eq!(console.lines().len(), 1);

        let unbounded = MemoryConsole::new(8);
        let mut old = ConsoleLine::new("relay", "old");
        old.timestamp = Utc::now() - chrono::Duration::hours(1);
        unbounded.print(old);
        assert!(unbounded.contains("old"));
    }

    #[test]
    fn loggers_sharing_a_file_keep_lines_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("shared.jsonl");
        let payload = "x".repeat(4_096);
        let writers: Vec<_> = ["dispatch", "rules"]
            .into_iter()
            .map(|module| {
                let logger = JsonLogger::new(&path).unwrap();
                let payload = payload.clone();
                std::thread::spawn(move || {
                    for index in 0..200 {
                        let mut record = LogRecord::new(module, LogLevel::Info, "tick");
                        record
                            .metadata
                            .insert("index".into(), serde_json::json!(index));
                        record
                            .metadata
                            .insert("payload".into(), serde_json::json!(payload));
                        logger.log(&record).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        let content = fs::read_to_string(&path).unwrap();
        let records: Vec<LogRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 400);
    }

    #[test]
    fn fanout_reaches_every_sink() {
        let dir = tempdir().unwrap();
        let logger = Arc::new(JsonLogger::new(dir.path().join("console.log")).unwrap());
        let memory = Arc::new(MemoryConsole::new(8));
        let fanout = ConsoleFanout::new()
            .with_sink(memory.clone())
            .with_sink(logger.clone());
        let writer = ConsoleWriter::new("rules", Arc::new(fanout)).with_source("relay");
        writer.print("Operations running");
        assert!(memory.contains("Operations running"));
        let content = fs::read_to_string(logger.path()).unwrap();
        assert!(content.contains("\"module\":\"relay\""));
    }
}
