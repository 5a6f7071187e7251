//! Operator commands typed on the relay console.

use anyhow::Result;
use serde_json::json;
use shared_logging::LogLevel;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt},
    sync::mpsc::UnboundedSender,
};
use tracing::warn;

use crate::telemetry::RelayTelemetry;

/// One line of operator input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperatorCommand {
    /// Empty the in-memory console buffer.
    ClearConsole,
    /// Re-read the configuration file.
    Reload,
    /// Pause or resume the test source.
    ToggleTestSource,
    /// Toggle the game's pause state on the server.
    TogglePause,
    /// Drop queued commands and pending retries.
    CancelAll,
    /// Print session and queue status.
    Status,
    /// Stop the relay.
    Quit,
    /// Anything else, sent to the server verbatim.
    Raw(String),
}

impl OperatorCommand {
    /// Parses one input line; blank lines yield `None`.
    #[must_use]
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return None;
        }
        let command = match trimmed.to_lowercase().as_str() {
            "clear" | "cls" => Self::ClearConsole,
            "reload" => Self::Reload,
            "pause" | "unpause" | "resume" => Self::ToggleTestSource,
            "togglepause" => Self::TogglePause,
            "cancel" | "cancelall" => Self::CancelAll,
            "status" => Self::Status,
            "quit" | "exit" => Self::Quit,
            _ => Self::Raw(trimmed.to_string()),
        };
        Some(command)
    }
}

/// Reads operator lines and forwards parsed commands.
pub struct OperatorConsole {
    sender: UnboundedSender<OperatorCommand>,
    telemetry: Option<RelayTelemetry>,
}

impl OperatorConsole {
    /// Creates a console forwarding to `sender`.
    #[must_use]
    pub const fn new(
        sender: UnboundedSender<OperatorCommand>,
        telemetry: Option<RelayTelemetry>,
    ) -> Self {
        Self { sender, telemetry }
    }

    /// Reads stdin until end of input or `quit`.
    ///
    /// # Errors
    /// Read failures.
    pub async fn run_stdin(&self) -> Result<()> {
        self.run(tokio::io::BufReader::new(tokio::io::stdin())).await
    }

    /// Reads `reader` until end of input or `quit`; the `quit` itself is
    /// forwarded.
    ///
    /// # Errors
    /// Read failures.
    pub async fn run<R>(&self, reader: R) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        while let Some(line) = lines.next_line().await? {
            let Some(command) = OperatorCommand::parse(&line) else {
                continue;
            };
            let quit = command == OperatorCommand::Quit;
            if self.sender.send(command).is_err() || quit {
                break;
            }
        }
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.log(LogLevel::Info, "relay.operator.closed", json!({}))
            {
                warn!(error = %err, "telemetry log failed");
            }
        }
        Ok(())
    }
}
