//! Relay runtime wiring event sources, rules and the dispatch engine.

use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, SeedableRng};
use relay_actions::{builder::CommandBuilder, command::ServerCommand, remote::RemoteConsole};
use relay_dispatch::{DispatchEngine, DispatchTelemetry, PauseCallback};
use relay_rules::{summarize_actions, RuleResolver, RulesTelemetry, SourceEnvelope};
use serde_json::json;
use shared_event_bus::{EventHandler, EventPublisher, FanoutBus, FileEventPublisher};
use shared_logging::{
    ConsoleFanout, ConsoleSink, ConsoleWriter, JsonLogger, LogLevel, MemoryConsole, StdoutConsole,
};
use tokio::{sync::mpsc::UnboundedReceiver, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    operator::OperatorCommand,
    settings::{RelaySettings, SettingsError},
    telemetry::RelayTelemetry,
    test_source::TestSource,
};

const BUS_QUEUE_DEPTH: usize = 64;

/// Resolves source events and queues the resulting commands.
struct RuleBridge {
    resolver: Arc<RuleResolver>,
    engine: DispatchEngine,
    telemetry: RelayTelemetry,
}

#[async_trait]
impl EventHandler<SourceEnvelope> for RuleBridge {
    fn name(&self) -> &str {
        "rule-bridge"
    }

    async fn handle(&self, envelope: SourceEnvelope) {
        let SourceEnvelope {
            workflow,
            source,
            event,
        } = envelope;
        let actions = self.resolver.resolve(&workflow, &event).await;
        if actions.is_empty() {
            debug!(workflow = %workflow, event = %event, "relay.event.no_actions");
            return;
        }
        let queued = self.engine.enqueue_actions(&actions, &event.name);
        let summary = summarize_actions(&actions);
        self.telemetry.for_source(&source).print(summary.clone());
        if let Err(err) = self.telemetry.event(
            "relay.actions.queued",
            json!({
                "workflow": workflow,
                "source": source,
                "sender": event.name,
                "actions": summary,
                "queued": queued,
            }),
        ) {
            warn!(error = %err, "telemetry event failed");
        }
    }
}

/// Builder for [`RelayRuntime`].
pub struct RelayRuntimeBuilder {
    config_path: PathBuf,
    settings: RelaySettings,
    notice: Option<SettingsError>,
    stdout: bool,
    remote: Option<Box<dyn RemoteConsole>>,
    seed: Option<u64>,
}

impl RelayRuntimeBuilder {
    /// Starts from already loaded settings read from `config_path`.
    #[must_use]
    pub fn new(config_path: impl Into<PathBuf>, settings: RelaySettings) -> Self {
        Self {
            config_path: config_path.into(),
            settings,
            notice: None,
            stdout: false,
            remote: None,
            seed: None,
        }
    }

    /// Loads `config_path`, writing defaults when it is missing.
    ///
    /// # Errors
    /// Unreadable or unparsable configuration.
    pub fn from_file(config_path: impl Into<PathBuf>) -> Result<Self> {
        let config_path = config_path.into();
        let (settings, notice) = RelaySettings::load_or_create(&config_path)?;
        Ok(Self {
            notice,
            ..Self::new(config_path, settings)
        })
    }

    /// Mirrors console lines to standard output.
    #[must_use]
    pub const fn stdout(mut self, enabled: bool) -> Self {
        self.stdout = enabled;
        self
    }

    /// Uses `remote` instead of dialing the configured server.
    #[must_use]
    pub fn remote_console(mut self, remote: Box<dyn RemoteConsole>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Seeds every random source.
    #[must_use]
    pub const fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Assembles the runtime; must run inside a tokio runtime.
    ///
    /// # Errors
    /// Log sinks that cannot be opened.
    pub fn build(self) -> Result<RelayRuntime> {
        let Self {
            config_path,
            settings,
            notice,
            stdout,
            remote,
            seed,
        } = self;
        let logging = &settings.logging;
        let mut memory = MemoryConsole::new(logging.console_capacity);
        if let Some(max_age) = logging.console_max_age() {
            memory = memory.with_max_age(max_age);
        }
        let memory = Arc::new(memory);
        let mut fanout = ConsoleFanout::new().with_sink(memory.clone());
        if stdout {
            fanout = fanout.with_sink(Arc::new(StdoutConsole));
        }
        if let Some(path) = &logging.console_log {
            let path = RelaySettings::resolve_path(&config_path, path);
            let logger = JsonLogger::new(&path)
                .with_context(|| format!("opening console log {}", path.display()))?;
            fanout = fanout.with_sink(Arc::new(logger));
        }
        let sink: Arc<dyn ConsoleSink> = Arc::new(fanout);
        let publisher: Option<Arc<dyn EventPublisher>> = match &logging.event_log {
            Some(path) => {
                let path = RelaySettings::resolve_path(&config_path, path);
                Some(Arc::new(FileEventPublisher::new(&path).with_context(|| {
                    format!("opening event log {}", path.display())
                })?))
            }
            None => None,
        };

        let mut relay = RelayTelemetry::builder("relay", ConsoleWriter::new("relay", sink.clone()));
        let mut rules = RulesTelemetry::builder("rules").console(ConsoleWriter::new("rules", sink.clone()));
        let mut dispatch = DispatchTelemetry::builder("dispatch")
            .console(ConsoleWriter::new("dispatch", sink.clone()));
        if let Some(path) = logging.telemetry_log_for(&config_path, "relay") {
            relay = relay.log_path(path);
        }
        if let Some(path) = logging.telemetry_log_for(&config_path, "rules") {
            rules = rules.log_path(path);
        }
        if let Some(path) = logging.telemetry_log_for(&config_path, "dispatch") {
            dispatch = dispatch.log_path(path);
        }
        if let Some(publisher) = &publisher {
            relay = relay.event_publisher(Arc::clone(publisher));
            rules = rules.event_publisher(Arc::clone(publisher));
            dispatch = dispatch.event_publisher(Arc::clone(publisher));
        }
        let telemetry = relay.build()?;

        let mut valid = true;
        if let Some(notice) = &notice {
            telemetry.print(notice.to_string());
            valid = false;
        }
        if let Err(err) = settings.validate() {
            telemetry.print(err.to_string());
            valid = false;
        }

        let builder = Arc::new(seed.map_or_else(CommandBuilder::default, CommandBuilder::seeded));
        builder.initialize(&settings.weight_table(), settings.mob_sizes);

        let resolver = Arc::new(RuleResolver::new(rules.build()?));
        resolver.load_actions(&settings.action_map());
        resolver.load_engine_file(RelaySettings::resolve_path(
            &config_path,
            &settings.rules.rules_file,
        ));

        let engine_builder = DispatchEngine::builder()
            .settings(settings.dispatch.engine_settings())
            .command_builder(Arc::clone(&builder))
            .console(ConsoleWriter::new("dispatch", sink.clone()))
            .telemetry(dispatch.build()?)
            .on_pause_status(pause_reporter(telemetry.console().clone()));
        let engine = match (valid, remote) {
            (false, _) => engine_builder.build_inert(),
            (true, Some(remote)) => engine_builder.build_with_console(remote),
            (true, None) => engine_builder.build_for_server(
                &settings.server.host,
                settings.server.port,
                &settings.server.password,
                settings.dispatch.reply_timeout(),
            ),
        };

        let bus: Arc<FanoutBus<SourceEnvelope>> = Arc::new(FanoutBus::new(BUS_QUEUE_DEPTH));
        bus.subscribe(Arc::new(RuleBridge {
            resolver: Arc::clone(&resolver),
            engine: engine.clone(),
            telemetry: telemetry.clone(),
        }));

        let test_source = settings.test_source.enabled.then(|| {
            let source_telemetry = telemetry.for_source("test");
            let source = match seed {
                Some(seed) => TestSource::with_rng(
                    settings.test_source.clone(),
                    Arc::clone(&bus),
                    source_telemetry,
                    StdRng::seed_from_u64(seed.wrapping_add(1)),
                ),
                None => TestSource::new(
                    settings.test_source.clone(),
                    Arc::clone(&bus),
                    source_telemetry,
                ),
            };
            Arc::new(source)
        });

        if valid {
            telemetry.print("Operations Running!");
        } else {
            telemetry.print("Invalid configuration, please check configs and restart");
        }
        if let Err(err) = telemetry.log(
            LogLevel::Info,
            "relay.bootstrap",
            json!({
                "config": config_path.display().to_string(),
                "valid": valid,
                "has_server": engine.has_server(),
                "test_source": test_source.is_some(),
            }),
        ) {
            warn!(error = %err, "telemetry log failed");
        }

        Ok(RelayRuntime {
            config_path,
            settings: RwLock::new(settings),
            console: memory,
            telemetry,
            builder,
            resolver,
            engine,
            bus,
            test_source,
            tasks: Mutex::new(Vec::new()),
        })
    }
}

/// Prints a line whenever the server's pause state flips.
fn pause_reporter(out: ConsoleWriter) -> PauseCallback {
    let last = AtomicBool::new(false);
    Arc::new(move |paused| {
        if last.swap(paused, Ordering::SeqCst) != paused {
            out.print(if paused {
                "Server is currently paused."
            } else {
                "Server is running."
            });
        }
    })
}

/// The assembled relay.
pub struct RelayRuntime {
    config_path: PathBuf,
    settings: RwLock<RelaySettings>,
    console: Arc<MemoryConsole>,
    telemetry: RelayTelemetry,
    builder: Arc<CommandBuilder>,
    resolver: Arc<RuleResolver>,
    engine: DispatchEngine,
    bus: Arc<FanoutBus<SourceEnvelope>>,
    test_source: Option<Arc<TestSource>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for RelayRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayRuntime")
            .field("config_path", &self.config_path)
            .field("engine", &self.engine)
            .field("test_source", &self.test_source)
            .finish_non_exhaustive()
    }
}

impl RelayRuntime {
    /// Returns a builder over settings loaded from `config_path`.
    ///
    /// # Errors
    /// Unreadable or unparsable configuration.
    pub fn load(config_path: impl Into<PathBuf>) -> Result<RelayRuntimeBuilder> {
        RelayRuntimeBuilder::from_file(config_path)
    }

    /// Configuration file backing this runtime.
    #[must_use]
    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Snapshot of the active settings.
    #[must_use]
    pub fn settings(&self) -> RelaySettings {
        self.settings.read().clone()
    }

    /// In-memory console buffer.
    #[must_use]
    pub const fn console(&self) -> &Arc<MemoryConsole> {
        &self.console
    }

    /// Dispatch engine handle.
    #[must_use]
    pub const fn engine(&self) -> &DispatchEngine {
        &self.engine
    }

    /// Rule resolver.
    #[must_use]
    pub const fn resolver(&self) -> &Arc<RuleResolver> {
        &self.resolver
    }

    /// Synthetic source, when enabled.
    #[must_use]
    pub const fn test_source(&self) -> Option<&Arc<TestSource>> {
        self.test_source.as_ref()
    }

    /// Starts the dispatch engine and every event source.
    ///
    /// # Errors
    /// The engine was already started.
    pub fn start(&self) -> Result<()> {
        self.engine.start()?;
        if let Some(source) = &self.test_source {
            let task = tokio::spawn(Arc::clone(source).run());
            self.tasks.lock().push(task);
        }
        info!(has_server = self.engine.has_server(), "relay.started");
        if let Err(err) = self.telemetry.event(
            "relay.started",
            json!({ "has_server": self.engine.has_server() }),
        ) {
            warn!(error = %err, "telemetry event failed");
        }
        Ok(())
    }

    /// Publishes an event from a source to the rule bridge.
    pub async fn publish(&self, envelope: SourceEnvelope) {
        self.bus.publish(envelope).await;
    }

    /// Applies an operator command; returns `false` once the relay should stop.
    pub fn handle(&self, command: OperatorCommand) -> bool {
        debug!(?command, "relay.operator.command");
        match command {
            OperatorCommand::ClearConsole => self.console.clear(),
            OperatorCommand::Reload => {
                self.reload();
            }
            OperatorCommand::ToggleTestSource => match &self.test_source {
                Some(source) => {
                    source.toggle_pause();
                }
                None => self.telemetry.print("Test source is not enabled"),
            },
            OperatorCommand::TogglePause => self.send(ServerCommand::toggle_pause()),
            OperatorCommand::CancelAll => {
                let dropped = self.engine.clear();
                self.telemetry.print(format!(
                    "Cancelled {dropped} queued commands and every pending retry"
                ));
            }
            OperatorCommand::Status => self.telemetry.print(self.status()),
            OperatorCommand::Quit => return false,
            OperatorCommand::Raw(text) => self.send(ServerCommand::raw(text)),
        }
        true
    }

    fn send(&self, command: ServerCommand) {
        if !self.engine.enqueue(command) {
            self.telemetry.print("No server available");
        }
    }

    /// One-line summary of the session, queue and counters.
    #[must_use]
    pub fn status(&self) -> String {
        let stats = self.engine.stats();
        format!(
            "session {}, {} queued, {} retries pending, server {}, executed {}, succeeded {}, retried {}, dropped {}",
            self.engine.session_state(),
            self.engine.queue_len(),
            self.engine.pending_retries(),
            if self.engine.is_paused() { "paused" } else { "running" },
            stats.executed,
            stats.succeeded,
            stats.retried,
            stats.dropped,
        )
    }

    /// Re-reads the configuration and re-applies builder tables, rule actions
    /// and the rules file; the old settings stay active when parsing fails.
    ///
    /// Server and dispatch changes take effect on the next start.
    pub fn reload(&self) -> bool {
        let settings = match RelaySettings::load(&self.config_path) {
            Ok(settings) => settings,
            Err(err) => {
                self.telemetry
                    .print(format!("Could not reload configuration: {err:#}"));
                return false;
            }
        };
        if let Err(err) = settings.validate() {
            self.telemetry.print(err.to_string());
        }
        self.builder
            .initialize(&settings.weight_table(), settings.mob_sizes);
        self.resolver.load_actions(&settings.action_map());
        self.resolver.load_engine_file(RelaySettings::resolve_path(
            &self.config_path,
            &settings.rules.rules_file,
        ));
        *self.settings.write() = settings;
        self.telemetry.print("Configuration reloaded");
        if let Err(err) = self.telemetry.log(
            LogLevel::Info,
            "relay.reloaded",
            json!({ "config": self.config_path.display().to_string() }),
        ) {
            warn!(error = %err, "telemetry log failed");
        }
        true
    }

    /// Applies operator commands until `quit` or until every sender is gone.
    pub async fn run(&self, mut commands: UnboundedReceiver<OperatorCommand>) {
        while let Some(command) = commands.recv().await {
            if !self.handle(command) {
                break;
            }
        }
    }

    /// Stops the engine and every source task.
    pub fn shutdown(&self) {
        self.engine.shutdown();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.telemetry.print("Relay stopped");
        info!("relay.stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_actions::{command::SUPPLY_MARKER, remote::ScriptedConsole};
    use relay_dispatch::SessionState;
    use relay_rules::SourceEvent;
    use std::{fs, time::Duration};
    use tempfile::{tempdir, TempDir};

    const RULES: &str = r#"[
        {
            "workflow_name": "test",
            "rules": [
                {
                    "rule_name": "BigDono",
                    "when": { "op": "amount_at_least", "value": 20.0 }
                }
            ]
        }
    ]"#;

    const CONFIG: &str = r#"
[server]
password = "hunter2"

[dispatch]
poll_interval_ms = 50
retry_base_ms = 100
retry_cap_ms = 400

[rules.actions]
bigdono = ["SupplyCrate", "SupplyCrate", "HealPlayers"]
"#;

    fn workspace(config: &str) -> (TempDir, PathBuf) {
        let tmp = tempdir().unwrap();
        fs::write(tmp.path().join("rules.json"), RULES).unwrap();
        let path = tmp.path().join("relay.toml");
        fs::write(&path, config).unwrap();
        (tmp, path)
    }

    fn runtime(path: &Path, script: &ScriptedConsole) -> RelayRuntime {
        RelayRuntime::load(path)
            .unwrap()
            .remote_console(Box::new(script.clone()))
            .seed(3)
            .build()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn donation_is_resolved_and_sent_to_the_server() {
        let (_tmp, path) = workspace(CONFIG);
        let script = ScriptedConsole::new();
        script.set_fallback_reply(SUPPLY_MARKER);
        let relay = runtime(&path, &script);
        assert!(relay.console().contains("Operations Running!"));
        assert!(relay.resolver().has_engine());
        relay.start().unwrap();

        relay
            .publish(SourceEnvelope::new(
                "test",
                "test",
                SourceEvent::donation("Zoe!", 25.0, "USD"),
            ))
            .await;
        relay
            .publish(SourceEnvelope::new(
                "test",
                "test",
                SourceEvent::donation("Tiny", 1.0, "USD"),
            ))
            .await;
        tokio::time::sleep(Duration::from_secs(2)).await;

        let (probes, commands): (Vec<_>, Vec<_>) = script
            .sent()
            .into_iter()
            .partition(|command| command == "sm_bridge_checkpause");
        assert_eq!(probes.len(), 1);
        assert_eq!(
            commands,
            vec![
                "sm_bridge_supplycrate Zoe",
                "sm_bridge_supplycrate Zoe",
                "sm_bridge_healplayers Zoe",
            ]
        );
        assert!(relay
            .console()
            .lines()
            .iter()
            .any(|line| line.source == "test" && line.message == "Supply Crate (x2), Heal"));
        assert_eq!(relay.engine().stats().succeeded, 4);
        assert_eq!(relay.engine().session_state(), SessionState::Connected);
        relay.shutdown();
    }

    #[tokio::test]
    async fn missing_configuration_leaves_dispatcher_inert() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        let relay = RelayRuntime::load(&path).unwrap().build().unwrap();
        assert!(path.exists());
        assert!(!relay.engine().has_server());
        assert!(relay.console().contains("defaults have been written"));
        assert!(relay.console().contains("server.password"));
        assert!(relay
            .console()
            .contains("Invalid configuration, please check configs and restart"));

        assert!(relay.handle(OperatorCommand::Raw("status".into())));
        assert!(relay.console().contains("No server available"));
    }

    #[tokio::test]
    async fn operator_commands_drive_queue_and_console() {
        let (_tmp, path) = workspace(CONFIG);
        let script = ScriptedConsole::new();
        let relay = runtime(&path, &script);

        assert!(relay.handle(OperatorCommand::Raw("sm_cvar mp_gamemode".into())));
        assert!(relay.handle(OperatorCommand::TogglePause));
        assert_eq!(relay.engine().queue_len(), 2);

        assert!(relay.handle(OperatorCommand::Status));
        assert!(relay.console().contains("session disconnected, 2 queued"));

        assert!(relay.handle(OperatorCommand::CancelAll));
        assert_eq!(relay.engine().queue_len(), 0);
        assert!(relay.console().contains("Cancelled 2 queued commands"));

        assert!(relay.handle(OperatorCommand::ToggleTestSource));
        assert!(relay.console().contains("Test source is not enabled"));

        assert!(relay.handle(OperatorCommand::ClearConsole));
        assert!(relay.console().lines().is_empty());
        assert!(!relay.handle(OperatorCommand::Quit));
    }

    #[tokio::test]
    async fn test_source_pause_is_operator_controlled() {
        let config = format!("{CONFIG}\n[test_source]\nenabled = true\n");
        let (_tmp, path) = workspace(&config);
        let relay = runtime(&path, &ScriptedConsole::new());
        let source = relay.test_source().unwrap();
        assert!(!source.is_paused());
        relay.handle(OperatorCommand::ToggleTestSource);
        assert!(source.is_paused());
        relay.handle(OperatorCommand::ToggleTestSource);
        assert!(!source.is_paused());
    }

    #[tokio::test]
    async fn reload_reapplies_actions_and_keeps_settings_on_parse_error() {
        let (_tmp, path) = workspace(CONFIG);
        let relay = runtime(&path, &ScriptedConsole::new());
        assert_eq!(relay.resolver().action_count(), 1);

        let updated = format!("{CONFIG}smalldono = [\"Lootbox\"]\n");
        fs::write(&path, updated).unwrap();
        assert!(relay.reload());
        assert_eq!(relay.resolver().action_count(), 2);
        assert!(relay.console().contains("Configuration reloaded"));

        fs::write(&path, "[server\n").unwrap();
        relay.handle(OperatorCommand::Reload);
        assert!(relay.console().contains("Could not reload configuration"));
        assert_eq!(relay.settings().rules.actions.len(), 2);
    }

    #[tokio::test]
    async fn each_module_gets_its_own_telemetry_log() {
        let config = format!("{CONFIG}\n[logging]\ntelemetry_log = \"logs/telemetry.jsonl\"\n");
        let (tmp, path) = workspace(&config);
        let relay = runtime(&path, &ScriptedConsole::new());
        let logs = tmp.path().join("logs");
        for module in ["relay", "rules", "dispatch"] {
            assert!(logs.join(format!("telemetry.{module}.jsonl")).exists(), "{module}");
        }
        assert!(!logs.join("telemetry.jsonl").exists());
        let relay_log = fs::read_to_string(logs.join("telemetry.relay.jsonl")).unwrap();
        assert!(relay_log.contains("relay.bootstrap"));
        relay.shutdown();
    }
}
