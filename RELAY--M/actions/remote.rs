use std::{collections::VecDeque, sync::Arc};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;

/// Transport failures reported by a remote console.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// No session is open.
    #[error("not connected")]
    NotConnected,
    /// The server rejected the password.
    #[error("authentication rejected")]
    AuthRejected,
    /// No reply arrived in time.
    #[error("timed out waiting for reply")]
    Timeout,
    /// Socket level failure.
    #[error("transport: {0}")]
    Io(String),
    /// The peer sent bytes that do not form a valid packet.
    #[error("protocol: {0}")]
    Protocol(String),
}

impl From<std::io::Error> for RemoteError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Session against the game server's remote console.
///
/// A single dispatch worker owns the value and is the only caller.
#[async_trait]
pub trait RemoteConsole: Send {
    /// Opens (or re-opens) the session.
    async fn connect(&mut self) -> Result<(), RemoteError>;

    /// Sends `command` and awaits the full textual reply.
    async fn send_command(&mut self, command: &str) -> Result<String, RemoteError>;

    /// Counter bumped every time an open session is lost.
    fn disconnect_events(&self) -> watch::Receiver<u64>;
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: VecDeque<Result<String, RemoteError>>,
    fallback_reply: Option<String>,
    failing_connects: usize,
    connects: usize,
    connected: bool,
    sent: Vec<String>,
}

/// In-memory console replaying scripted replies, used for tests and dry runs.
///
/// Clones share state, so a test can keep one handle while the dispatch worker
/// owns another.
#[derive(Debug, Clone)]
pub struct ScriptedConsole {
    state: Arc<Mutex<ScriptState>>,
    disconnects: Arc<watch::Sender<u64>>,
}

impl Default for ScriptedConsole {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedConsole {
    /// Creates a console with no scripted replies.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = watch::channel(0);
        Self {
            state: Arc::default(),
            disconnects: Arc::new(sender),
        }
    }

    /// Queues a successful reply.
    pub fn push_reply(&self, reply: impl Into<String>) {
        self.state.lock().replies.push_back(Ok(reply.into()));
    }

    /// Queues a transport failure.
    pub fn push_error(&self, error: RemoteError) {
        self.state.lock().replies.push_back(Err(error));
    }

    /// Reply returned once the script runs dry.
    pub fn set_fallback_reply(&self, reply: impl Into<String>) {
        self.state.lock().fallback_reply = Some(reply.into());
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: usize) {
        self.state.lock().failing_connects = count;
    }

    /// Simulates the server dropping the session.
    pub fn drop_session(&self) {
        self.state.lock().connected = false;
        self.disconnects.send_modify(|count| *count += 1);
    }

    /// Every command text sent so far.
    #[must_use]
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    /// Number of successful connection attempts.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.state.lock().connects
    }
}

#[async_trait]
impl RemoteConsole for ScriptedConsole {
    async fn connect(&mut self) -> Result<(), RemoteError> {
        let mut state = self.state.lock();
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(RemoteError::Io("connection refused".into()));
        }
        state.connected = true;
        state.connects += 1;
        Ok(())
    }

    async fn send_command(&mut self, command: &str) -> Result<String, RemoteError> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(RemoteError::NotConnected);
        }
        state.sent.push(command.to_string());
        match state.replies.pop_front() {
            Some(reply) => reply,
            None => Ok(state.fallback_reply.clone().unwrap_or_default()),
        }
    }

    fn disconnect_events(&self) -> watch::Receiver<u64> {
        self.disconnects.subscribe()
    }
}
