use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{ConsoleWriter, JsonLogger, LogLevel, LogRecord};
use uuid::Uuid;

/// Builder for relay telemetry.
pub struct RelayTelemetryBuilder {
    module: String,
    console: ConsoleWriter,
    log_path: Option<PathBuf>,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl RelayTelemetryBuilder {
    /// Creates the builder; `console` receives every printed line.
    #[must_use]
    pub fn new(module: impl Into<String>, console: ConsoleWriter) -> Self {
        Self {
            module: module.into(),
            console,
            log_path: None,
            event_publisher: None,
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

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<RelayTelemetry> {
        let logger = self.log_path.map(JsonLogger::new).transpose()?.map(Arc::new);
        Ok(RelayTelemetry {
            module: self.module,
            console: self.console,
            logger,
            publisher: self.event_publisher,
        })
    }
}

/// Telemetry for the relay runtime and its event sources.
#[derive(Clone)]
pub struct RelayTelemetry {
    module: String,
    console: ConsoleWriter,
    logger: Option<Arc<JsonLogger>>,
    publisher: Option<Arc<dyn EventPublisher>>,
}

impl fmt::Debug for RelayTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelayTelemetry")
            .field("module", &self.module)
            .field("source", &self.console.source())
            .finish()
    }
}

impl RelayTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>, console: ConsoleWriter) -> RelayTelemetryBuilder {
        RelayTelemetryBuilder::new(module, console)
    }

    /// Same sinks, printing under another console source.
    #[must_use]
    pub fn for_source(&self, source: &str) -> Self {
        Self {
            module: format!("{}.{source}", self.module),
            console: self.console.with_source(source),
            ..self.clone()
        }
    }

    /// Console writer used by [`RelayTelemetry::print`].
    #[must_use]
    pub const fn console(&self) -> &ConsoleWriter {
        &self.console
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.logger {
            let mut record = LogRecord::new(&self.module, level, message);
            if let Some(obj) = metadata.as_object() {
                record.metadata = obj.clone();
            }
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Publishes an event; must be called inside a tokio runtime.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(publisher) = &self.publisher {
            let record = EventRecord {
                id: format!("evt-{}", Uuid::new_v4()),
                source: self.module.clone(),
                event_type: event_type.into(),
                timestamp: chrono::Utc::now().to_rfc3339(),
                payload,
            };
            let publisher = Arc::clone(publisher);
            tokio::spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    tracing::warn!("relay telemetry publish failed: {err:?}");
                }
            });
        }
        Ok(())
    }

    /// Prints a console line.
    pub fn print(&self, message: impl Into<String>) {
        self.console.print(message);
    }
}
