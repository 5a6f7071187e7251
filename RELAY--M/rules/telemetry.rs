use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{ConsoleWriter, JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Builder, Handle};
use uuid::Uuid;

/// Builder for rule telemetry sinks.
pub struct RulesTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
    console: Option<ConsoleWriter>,
}

impl RulesTelemetryBuilder {
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
    pub fn build(self) -> Result<RulesTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?),
            None => None,
        };
        Ok(RulesTelemetry {
            module: Arc::from(self.module),
            logger: logger.map(Arc::new),
            publisher: self.event_publisher,
            console: self.console,
        })
    }
}

/// Telemetry handle shared across rule components.
#[derive(Clone)]
pub struct RulesTelemetry {
    module: Arc<str>,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
    console: Option<ConsoleWriter>,
}

impl fmt::Debug for RulesTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RulesTelemetry")
            .field("module", &self.module)
            .field("console", &self.console.is_some())
            .finish()
    }
}

impl RulesTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RulesTelemetryBuilder {
        RulesTelemetryBuilder::new(module)
    }

    /// Handle that only prints to `console`.
    #[must_use]
    pub fn console_only(console: ConsoleWriter) -> Self {
        Self {
            module: Arc::from(console.source()),
            logger: None,
            publisher: None,
            console: Some(console),
        }
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            let mut record = LogRecord::new(self.module.as_ref(), level, message);
            if let Value::Object(map) = metadata {
                record.metadata = map;
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        let Some(publisher) = &self.publisher else {
            return Ok(());
        };
        let record = EventRecord {
            id: format!("evt-{}", Uuid::new_v4()),
            source: self.module.to_string(),
            event_type: event_type.into(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            payload,
        };
        match Handle::try_current() {
            Ok(handle) => {
                let publisher = Arc::clone(publisher);
                handle.spawn(async move {
                    if let Err(err) = publisher.publish(record).await {
                        tracing::warn!("rules telemetry publish failed: {err:?}");
                    }
                });
                Ok(())
            }
            Err(_) => Builder::new_current_thread()
                .build()?
                .block_on(publisher.publish(record)),
        }
    }

    /// Prints a console line, or traces it when no console is attached.
    pub fn print(&self, message: impl Into<String>) {
        let message = message.into();
        match &self.console {
            Some(console) => console.print(message),
            None => tracing::info!(module = %self.module, "{message}"),
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
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("rules.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = RulesTelemetry::builder("rules")
            .log_path(&path)
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "rules.matched", json!({ "rule": "bigdono" }))
            .unwrap();
        telemetry
            .event("rules.resolved", json!({ "actions": 2 }))
            .unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("rules.matched"));
        assert_eq!(bus.snapshot().len(), 1);
    }

    #[test]
    fn console_only_handle_prints_under_console_source() {
        let console = Arc::new(MemoryConsole::new(4));
        let telemetry = RulesTelemetry::console_only(ConsoleWriter::new("rules", console.clone()));
        telemetry.print("Using 3 actions");
        assert!(telemetry.log(LogLevel::Info, "ignored", json!({})).is_ok());
        assert_eq!(console.lines()[0].source, "rules");
    }
}
