use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{ConsoleWriter, JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};
use uuid::Uuid;

/// Builder for dispatch telemetry sinks.
pub struct DispatchTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    console: Option<ConsoleWriter>,
}

impl DispatchTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            event_publisher: None,
            console: None,
        }
    }

    /// Sets the log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Sets the operator console writer.
    #[must_use]
    pub fn console(mut self, console: ConsoleWriter) -> Self {
        self.console = Some(console);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<DispatchTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?;
        Ok(DispatchTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                logger,
                publisher: self.event_publisher,
                console: self.console,
            }),
        })
    }
}

/// Telemetry handle shared across dispatch components.
#[derive(Clone)]
pub struct DispatchTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for DispatchTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchTelemetry")
            .field("module", &self.inner.module)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    logger: Option<JsonLogger>,
    publisher: Option<Arc<dyn EventPublisher>>,
    console: Option<ConsoleWriter>,
}

impl DispatchTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> DispatchTelemetryBuilder {
        DispatchTelemetryBuilder::new(module)
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message);
            if let Some(obj) = metadata.as_object() {
                record.metadata = obj.clone();
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    ///
    /// Inside a runtime the publish is spawned; outside one it runs to completion
    /// on a throwaway current-thread runtime.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.inner.publisher else {
            return Ok(());
        };
        let record = EventRecord {
            id: format!("evt-{}", Uuid::new_v4()),
            source: self.inner.module.clone(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload,
        };
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!("dispatch telemetry publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            Builder::new_current_thread()
                .build()?
                .block_on(publisher.publish(record))
        }
    }

    /// Prints a line on the operator console, if one is attached.
    pub fn print(&self, message: impl Into<String>) {
        if let Some(console) = &self.inner.console {
            console.print(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use shared_logging::MemoryConsole;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_event_and_console() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("dispatch.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let console = Arc::new(MemoryConsole::new(8));
        let telemetry = DispatchTelemetry::builder("dispatch")
            .log_path(&path)
            .event_publisher(bus.clone())
            .console(ConsoleWriter::new("dispatch", console.clone()))
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "dispatch.start", json!({ "queued": 3 }))
            .unwrap();
        telemetry
            .event("dispatch.command.dropped", json!({ "attempts": 5 }))
            .unwrap();
        telemetry.print("connected to remote console");

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("dispatch.start"));
        assert_eq!(bus.snapshot().len(), 1);
        assert!(console.contains("connected"));
    }
}
