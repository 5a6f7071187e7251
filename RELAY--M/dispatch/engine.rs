use std::{
    collections::VecDeque,
    fmt,
    net::{SocketAddr, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use parking_lot::{Mutex, RwLock};
use relay_actions::{
    builder::CommandBuilder,
    catalog::GameAction,
    command::{CommandKind, RetryPlan, RetryPolicy, ServerCommand},
    remote::RemoteConsole,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_logging::{ConsoleWriter, LogLevel, StdoutConsole};
use thiserror::Error;
use tokio::{sync::Notify, task::JoinHandle, time::sleep};
use tracing::{debug, error, info, warn};

use crate::{
    rcon::{RconClient, RconConfig},
    telemetry::DispatchTelemetry,
};

/// Callback invoked with the paused flag after every successful probe.
pub type PauseCallback = Arc<dyn Fn(bool) + Send + Sync>;

/// Errors raised while constructing or starting an engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The host name did not resolve.
    #[error("could not resolve server address {0}")]
    AddressResolution(String),
    /// The host resolved to an unspecified address.
    #[error("server address {0} is unspecified")]
    UnspecifiedAddress(String),
    /// The worker has already been taken or started.
    #[error("dispatch worker already running")]
    AlreadyRunning,
}

/// Tunables for the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Retries allowed before a command is dropped.
    pub max_attempts: u32,
    /// Idle wait when the queue is empty or the server is unreachable.
    pub poll_interval: Duration,
    /// Interval between pause probes.
    pub probe_interval: Duration,
    /// Backoff for delayed retries.
    pub retry: RetryPolicy,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            poll_interval: Duration::from_secs(1),
            probe_interval: Duration::from_secs(45),
            retry: RetryPolicy::default(),
        }
    }
}

/// Remote console session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No session.
    Disconnected,
    /// Connection attempt in flight.
    Connecting,
    /// Session open.
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// Counters describing the work done so far.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchStats {
    /// Executions attempted.
    pub executed: u64,
    /// Executions that succeeded.
    pub succeeded: u64,
    /// Retries scheduled.
    pub retried: u64,
    /// Commands dropped after exhausting their attempts.
    pub dropped: u64,
}

#[derive(Debug, Default)]
struct StatCounters {
    executed: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dropped: AtomicU64,
}

impl StatCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            executed: self.executed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// One-shot cancellation shared by every retry timer scheduled before a `clear`.
#[derive(Debug, Default)]
struct CancelSignal {
    tripped: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn trip(&self) {
        self.tripped.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_tripped() {
                return;
            }
            notified.await;
        }
    }
}

/// Resolves `host:port` once, rejecting unspecified addresses.
///
/// # Errors
/// Returns [`DispatchError`] when resolution fails or yields `0.0.0.0` / `::`.
pub fn resolve_server(host: &str, port: u16) -> Result<SocketAddr, DispatchError> {
    let label = format!("{host}:{port}");
    let address = (host.trim(), port)
        .to_socket_addrs()
        .map_err(|_| DispatchError::AddressResolution(label.clone()))?
        .next()
        .ok_or_else(|| DispatchError::AddressResolution(label.clone()))?;
    if address.ip().is_unspecified() {
        return Err(DispatchError::UnspecifiedAddress(label));
    }
    Ok(address)
}

struct EngineInner {
    settings: DispatchSettings,
    builder: Arc<CommandBuilder>,
    out: ConsoleWriter,
    telemetry: Option<DispatchTelemetry>,
    on_pause: Option<PauseCallback>,
    has_server: bool,
    queue: Mutex<VecDeque<ServerCommand>>,
    wake: Notify,
    cancel: Mutex<Arc<CancelSignal>>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    remote: Mutex<Option<Box<dyn RemoteConsole>>>,
    state: RwLock<SessionState>,
    running: AtomicBool,
    paused: AtomicBool,
    stats: StatCounters,
}

impl EngineInner {
    fn push_back(&self, command: ServerCommand) {
        self.queue.lock().push_back(command);
        self.wake.notify_one();
    }

    /// Re-queues a delayed retry unless `signal` was tripped; checked under the
    /// queue lock so a concurrent [`DispatchEngine::clear`] always wins.
    fn push_retry(&self, command: ServerCommand, signal: &CancelSignal) -> bool {
        let mut queue = self.queue.lock();
        if signal.is_tripped() {
            return false;
        }
        queue.push_back(command);
        drop(queue);
        self.wake.notify_one();
        true
    }

    fn push_front(&self, command: ServerCommand) {
        self.queue.lock().push_front(command);
        self.wake.notify_one();
    }

    fn pop(&self) -> Option<ServerCommand> {
        self.queue.lock().pop_front()
    }

    fn set_state(&self, state: SessionState) {
        *self.state.write() = state;
    }

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn record(&self, level: LogLevel, message: &str, metadata: serde_json::Value) {
        if let Some(tel) = &self.telemetry {
            if let Err(err) = tel.log(level, message, metadata.clone()) {
                warn!(error = %err, "telemetry log failed");
            }
            if let Err(err) = tel.event(message, metadata) {
                warn!(error = %err, "telemetry event failed");
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, command: ServerCommand, delay: Duration) {
        let signal = self.cancel.lock().clone();
        let engine: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::select! {
                () = sleep(delay) => {
                    let Some(engine) = engine.upgrade() else {
                        return;
                    };
                    if !engine.push_retry(command, &signal) {
                        debug!("dispatch.retry.cancelled");
                    }
                }
                () = signal.cancelled() => {
                    debug!(command = %command, "dispatch.retry.cancelled");
                }
            }
        });
        let mut timers = self.timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.push(handle);
    }

    async fn process(self: &Arc<Self>, mut command: ServerCommand, remote: &mut dyn RemoteConsole) {
        StatCounters::bump(&self.stats.executed);
        if command.execute(remote, &self.out).await {
            StatCounters::bump(&self.stats.succeeded);
            if command.kind() == CommandKind::CheckPause {
                self.report_pause(command.reports_paused());
            }
            return;
        }
        if !command.kind().is_retryable() {
            debug!(command = %command, "dispatch.command.discarded");
            return;
        }
        if command.attempts() >= self.settings.max_attempts {
            self.out.print(format!(
                "{command} timed out after {} attempts",
                command.attempts()
            ));
            StatCounters::bump(&self.stats.dropped);
            self.record(
                LogLevel::Warn,
                "dispatch.command.dropped",
                json!({ "command": command.text(), "attempts": command.attempts() }),
            );
            return;
        }
        match command.plan_retry(&self.settings.retry) {
            RetryPlan::Skip => return,
            RetryPlan::Immediate => self.push_front(command),
            RetryPlan::After(delay) => self.schedule_retry(command, delay),
        }
        StatCounters::bump(&self.stats.retried);
    }

    fn report_pause(&self, paused: bool) {
        let previous = self.paused.swap(paused, Ordering::SeqCst);
        if previous != paused {
            info!(paused, "dispatch.pause.changed");
        }
        if let Some(callback) = &self.on_pause {
            callback(paused);
        }
    }

    fn enqueue_probe(&self) -> bool {
        let mut queue = self.queue.lock();
        if queue
            .iter()
            .any(|command| command.kind() == CommandKind::CheckPause)
        {
            return false;
        }
        queue.push_back(ServerCommand::check_pause());
        drop(queue);
        self.wake.notify_one();
        true
    }
}

/// Result of a single [`DispatchWorker::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStep {
    /// A session was opened.
    Connected,
    /// Connecting failed; the worker waited one poll interval.
    ConnectFailed,
    /// One command went through its execute/retry cycle.
    Executed,
    /// Nothing was queued; the worker waited for work or the poll interval.
    Idle,
}

/// Owner of the remote console; drains the queue one command at a time.
pub struct DispatchWorker {
    inner: Arc<EngineInner>,
    remote: Box<dyn RemoteConsole>,
    disconnects: tokio::sync::watch::Receiver<u64>,
    ever_connected: bool,
    failure_reported: bool,
}

impl fmt::Debug for DispatchWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchWorker")
            .field("state", &self.inner.state())
            .field("ever_connected", &self.ever_connected)
            .finish_non_exhaustive()
    }
}

impl DispatchWorker {
    fn new(inner: Arc<EngineInner>, remote: Box<dyn RemoteConsole>) -> Self {
        let disconnects = remote.disconnect_events();
        Self {
            inner,
            remote,
            disconnects,
            ever_connected: false,
            failure_reported: false,
        }
    }

    /// Runs one iteration of the dispatch loop.
    pub async fn step(&mut self) -> WorkerStep {
        if self.disconnects.has_changed().unwrap_or(false) {
            self.disconnects.borrow_and_update();
            if self.inner.state() == SessionState::Connected {
                self.inner.set_state(SessionState::Disconnected);
                self.inner.out.print("lost connection to remote console");
            }
        }
        if self.inner.state() != SessionState::Connected {
            return self.connect().await;
        }
        let Some(command) = self.inner.pop() else {
            tokio::select! {
                () = self.inner.wake.notified() => {}
                () = sleep(self.inner.settings.poll_interval) => {}
            }
            return WorkerStep::Idle;
        };
        self.inner.process(command, self.remote.as_mut()).await;
        WorkerStep::Executed
    }

    async fn connect(&mut self) -> WorkerStep {
        self.inner.set_state(SessionState::Connecting);
        match self.remote.connect().await {
            Ok(()) => {
                self.disconnects.borrow_and_update();
                self.inner.set_state(SessionState::Connected);
                self.failure_reported = false;
                let message = if self.ever_connected {
                    "reconnected to remote console"
                } else {
                    "connected to remote console"
                };
                self.ever_connected = true;
                self.inner.out.print(message);
                self.inner
                    .record(LogLevel::Info, "dispatch.session.connected", json!({}));
                WorkerStep::Connected
            }
            Err(err) => {
                self.inner.set_state(SessionState::Disconnected);
                if self.failure_reported {
                    debug!(error = %err, "dispatch.connect.retry");
                } else {
                    self.failure_reported = true;
                    self.inner
                        .out
                        .print(format!("could not connect to remote console: {err}"));
                    warn!(error = %err, "dispatch.connect.failed");
                }
                sleep(self.inner.settings.poll_interval).await;
                WorkerStep::ConnectFailed
            }
        }
    }

    /// Loops until the engine shuts down.
    pub async fn run(mut self) {
        while self.inner.running.load(Ordering::SeqCst) {
            self.step().await;
        }
    }
}

/// Builder for [`DispatchEngine`].
pub struct DispatchEngineBuilder {
    settings: DispatchSettings,
    builder: Option<Arc<CommandBuilder>>,
    out: Option<ConsoleWriter>,
    telemetry: Option<DispatchTelemetry>,
    on_pause: Option<PauseCallback>,
}

impl DispatchEngineBuilder {
    /// Creates a builder with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            settings: DispatchSettings::default(),
            builder: None,
            out: None,
            telemetry: None,
            on_pause: None,
        }
    }

    /// Overrides the loop settings.
    #[must_use]
    pub const fn settings(mut self, settings: DispatchSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Shares a command builder used by the `enqueue_action*` helpers.
    #[must_use]
    pub fn command_builder(mut self, builder: Arc<CommandBuilder>) -> Self {
        self.builder = Some(builder);
        self
    }

    /// Sets the console writer for operator-facing lines.
    #[must_use]
    pub fn console(mut self, out: ConsoleWriter) -> Self {
        self.out = Some(out);
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: DispatchTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Registers the pause-status callback.
    #[must_use]
    pub fn on_pause_status(mut self, callback: PauseCallback) -> Self {
        self.on_pause = Some(callback);
        self
    }

    /// Builds an engine driving `remote`.
    #[must_use]
    pub fn build_with_console(self, remote: Box<dyn RemoteConsole>) -> DispatchEngine {
        self.assemble(Some(remote))
    }

    /// Builds an engine for a TCP RCON server.
    ///
    /// Resolution happens once here; on failure the engine is permanently inert.
    #[must_use]
    pub fn build_for_server(
        self,
        host: &str,
        port: u16,
        password: &str,
        reply_timeout: Duration,
    ) -> DispatchEngine {
        match resolve_server(host, port) {
            Ok(address) => {
                info!(%address, "dispatch.server.resolved");
                let client = RconClient::new(RconConfig {
                    address,
                    password: password.to_string(),
                    reply_timeout,
                });
                self.build_with_console(Box::new(client))
            }
            Err(err) => {
                let engine = self.assemble(None);
                error!(error = %err, "dispatch.server.invalid");
                engine
                    .inner
                    .out
                    .print(format!("no server available: {err}"));
                engine
            }
        }
    }

    /// Builds an engine with no server; every enqueue is a no-op.
    #[must_use]
    pub fn build_inert(self) -> DispatchEngine {
        self.assemble(None)
    }

    fn assemble(self, remote: Option<Box<dyn RemoteConsole>>) -> DispatchEngine {
        let out = self
            .out
            .unwrap_or_else(|| ConsoleWriter::new("dispatch", Arc::new(StdoutConsole)));
        DispatchEngine {
            inner: Arc::new(EngineInner {
                settings: self.settings,
                builder: self.builder.unwrap_or_default(),
                out,
                telemetry: self.telemetry,
                on_pause: self.on_pause,
                has_server: remote.is_some(),
                queue: Mutex::new(VecDeque::new()),
                wake: Notify::new(),
                cancel: Mutex::new(Arc::new(CancelSignal::default())),
                timers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                remote: Mutex::new(remote),
                state: RwLock::new(SessionState::Disconnected),
                running: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                stats: StatCounters::default(),
            }),
        }
    }
}

impl Default for DispatchEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Single-connection command dispatcher.
///
/// Cloning yields another handle onto the same queue and session.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl fmt::Debug for DispatchEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchEngine")
            .field("has_server", &self.inner.has_server)
            .field("state", &self.inner.state())
            .field("queued", &self.queue_len())
            .finish()
    }
}

impl DispatchEngine {
    /// Returns a builder.
    #[must_use]
    pub fn builder() -> DispatchEngineBuilder {
        DispatchEngineBuilder::new()
    }

    /// Whether a server is configured.
    #[must_use]
    pub fn has_server(&self) -> bool {
        self.inner.has_server
    }

    /// Queues a command at the back.
    pub fn enqueue(&self, command: ServerCommand) -> bool {
        if !self.inner.has_server {
            return false;
        }
        self.inner.push_back(command);
        true
    }

    /// Queues several commands in order; returns how many were accepted.
    pub fn enqueue_many(&self, commands: impl IntoIterator<Item = ServerCommand>) -> usize {
        commands
            .into_iter()
            .map(|command| self.enqueue(command))
            .filter(|queued| *queued)
            .count()
    }

    /// Builds and queues the command for `action`.
    pub fn enqueue_action(&self, action: GameAction, sender: &str) -> bool {
        if !self.inner.has_server {
            return false;
        }
        self.inner
            .builder
            .build(action, sender)
            .is_some_and(|command| self.enqueue(command))
    }

    /// Builds and queues commands for `actions` in order.
    pub fn enqueue_actions(&self, actions: &[GameAction], sender: &str) -> usize {
        actions
            .iter()
            .filter(|action| self.enqueue_action(**action, sender))
            .count()
    }

    /// Queues a pause probe unless one is already pending.
    pub fn enqueue_probe(&self) -> bool {
        self.inner.has_server && self.inner.enqueue_probe()
    }

    /// Drops every queued command and cancels every pending retry.
    pub fn clear(&self) -> usize {
        let dropped = {
            let mut queue = self.inner.queue.lock();
            let previous = std::mem::replace(
                &mut *self.inner.cancel.lock(),
                Arc::new(CancelSignal::default()),
            );
            previous.trip();
            let count = queue.len();
            queue.clear();
            count
        };
        self.inner.timers.lock().retain(|timer| !timer.is_finished());
        info!(dropped, "dispatch.queue.cleared");
        dropped
    }

    /// Commands waiting in the queue.
    #[must_use]
    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Retry timers still waiting to fire.
    #[must_use]
    pub fn pending_retries(&self) -> usize {
        let mut timers = self.inner.timers.lock();
        timers.retain(|timer| !timer.is_finished());
        timers.len()
    }

    /// Current session state.
    #[must_use]
    pub fn session_state(&self) -> SessionState {
        self.inner.state()
    }

    /// Whether the last probe reported a paused game.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Work counters.
    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.inner.stats.snapshot()
    }

    /// Takes ownership of the remote console for a manually driven worker.
    ///
    /// # Errors
    /// Returns [`DispatchError::AlreadyRunning`] once the console has been taken.
    pub fn take_worker(&self) -> Result<Option<DispatchWorker>, DispatchError> {
        if !self.inner.has_server {
            return Ok(None);
        }
        let remote = self
            .inner
            .remote
            .lock()
            .take()
            .ok_or(DispatchError::AlreadyRunning)?;
        Ok(Some(DispatchWorker::new(Arc::clone(&self.inner), remote)))
    }

    /// Spawns the dispatch worker and the probe loop on the current runtime.
    ///
    /// An engine without a server starts nothing.
    ///
    /// # Errors
    /// Returns [`DispatchError::AlreadyRunning`] when called twice.
    pub fn start(&self) -> Result<(), DispatchError> {
        let Some(worker) = self.take_worker()? else {
            return Ok(());
        };
        self.inner.running.store(true, Ordering::SeqCst);
        let probe_engine = Arc::downgrade(&self.inner);
        let interval = self.inner.settings.probe_interval;
        let probe = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let Some(engine) = probe_engine.upgrade() else {
                    break;
                };
                if !engine.running.load(Ordering::SeqCst) {
                    break;
                }
                engine.enqueue_probe();
            }
        });
        let dispatch = tokio::spawn(worker.run());
        self.inner.workers.lock().extend([dispatch, probe]);
        info!("dispatch.started");
        Ok(())
    }

    /// Stops the worker, the probe loop and every pending retry timer.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wake.notify_one();
        for handle in self.inner.workers.lock().drain(..) {
            handle.abort();
        }
        for handle in self.inner.timers.lock().drain(..) {
            handle.abort();
        }
        self.inner.set_state(SessionState::Disconnected);
    }
}
