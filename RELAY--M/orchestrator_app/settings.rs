use std::{
    collections::{BTreeMap, HashMap},
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result};
use relay_actions::{builder::MobSizeSettings, catalog::GameAction, command::RetryPolicy};
use relay_dispatch::DispatchSettings;
use relay_rules::ActionMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Default configuration file name.
pub const DEFAULT_SETTINGS_FILE: &str = "relay.toml";

/// Problems with the configuration that do not abort startup.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SettingsError {
    /// No configuration existed; defaults were written to the given path.
    #[error("configuration {0} was missing; defaults have been written")]
    Created(PathBuf),
    /// Required fields are empty or zero.
    #[error("configuration is missing: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

/// A settings section able to report its own missing fields.
pub trait VerifiableSettings {
    /// Section name as written in the TOML file.
    fn section(&self) -> &'static str;

    /// Names of required fields that are unset.
    fn validate(&self) -> Vec<&'static str>;
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Host name or IP literal.
    pub host: String,
    /// RCON port.
    pub port: u16,
    /// RCON password.
    pub password: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 27015,
            password: String::new(),
        }
    }
}

impl VerifiableSettings for ServerSettings {
    fn section(&self) -> &'static str {
        "server"
    }

    fn validate(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.host.trim().is_empty() {
            missing.push("host");
        }
        if self.port == 0 {
            missing.push("port");
        }
        if self.password.is_empty() {
            missing.push("password");
        }
        missing
    }
}

/// `[dispatch]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    /// Retries before a command is dropped.
    pub max_attempts: u32,
    /// Idle wait of the dispatch loop.
    pub poll_interval_ms: u64,
    /// Interval between pause probes.
    pub probe_interval_secs: u64,
    /// First retry delay.
    pub retry_base_ms: u64,
    /// Retry delay ceiling.
    pub retry_cap_ms: u64,
    /// Connect and reply timeout.
    pub reply_timeout_ms: u64,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            poll_interval_ms: 1_000,
            probe_interval_secs: 45,
            retry_base_ms: 2_000,
            retry_cap_ms: 60_000,
            reply_timeout_ms: 10_000,
        }
    }
}

impl VerifiableSettings for DispatchSection {
    fn section(&self) -> &'static str {
        "dispatch"
    }

    fn validate(&self) -> Vec<&'static str> {
        [
            ("max_attempts", u64::from(self.max_attempts)),
            ("poll_interval_ms", self.poll_interval_ms),
            ("probe_interval_secs", self.probe_interval_secs),
            ("reply_timeout_ms", self.reply_timeout_ms),
        ]
        .into_iter()
        .filter(|(_, value)| *value == 0)
        .map(|(name, _)| name)
        .collect()
    }
}

impl DispatchSection {
    /// Loop settings for the dispatch engine.
    #[must_use]
    pub const fn engine_settings(&self) -> DispatchSettings {
        DispatchSettings {
            max_attempts: self.max_attempts,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            probe_interval: Duration::from_secs(self.probe_interval_secs),
            retry: RetryPolicy {
                base_delay: Duration::from_millis(self.retry_base_ms),
                cap_delay: Duration::from_millis(self.retry_cap_ms),
            },
        }
    }

    /// RCON connect and reply timeout.
    #[must_use]
    pub const fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms)
    }
}

/// `[rules]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RulesSection {
    /// JSON workflow file.
    pub rules_file: PathBuf,
    /// Rule or success-event name to actions.
    pub actions: BTreeMap<String, Vec<GameAction>>,
}

impl Default for RulesSection {
    fn default() -> Self {
        Self {
            rules_file: PathBuf::from("rules.json"),
            actions: BTreeMap::new(),
        }
    }
}

/// `[test_source]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestSourceSettings {
    /// Whether synthetic donations are generated.
    pub enabled: bool,
    /// Workflow evaluated for generated events.
    pub workflow: String,
    /// Delay before the first event.
    pub start_delay_secs: u64,
    /// Shortest wait between draws.
    pub min_wait_secs: u64,
    /// Longest wait between draws, in minutes.
    pub max_minutes_to_wait: u64,
}

impl Default for TestSourceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            workflow: "test".into(),
            start_delay_secs: 60,
            min_wait_secs: 10,
            max_minutes_to_wait: 1,
        }
    }
}

impl VerifiableSettings for TestSourceSettings {
    fn section(&self) -> &'static str {
        "test_source"
    }

    fn validate(&self) -> Vec<&'static str> {
        if !self.enabled {
            return Vec::new();
        }
        let mut missing = Vec::new();
        if self.workflow.trim().is_empty() {
            missing.push("workflow");
        }
        if self.max_minutes_to_wait == 0 {
            missing.push("max_minutes_to_wait");
        }
        missing
    }
}

/// `[logging]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// JSON-lines copy of every console line.
    pub console_log: Option<PathBuf>,
    /// Base path for the structured telemetry logs; each module writes its own
    /// `<stem>.<module>.<ext>` file next to it.
    pub telemetry_log: Option<PathBuf>,
    /// JSON-lines telemetry event log.
    pub event_log: Option<PathBuf>,
    /// Lines kept in the in-memory console.
    pub console_capacity: usize,
    /// Seconds a line stays in the in-memory console; `0` keeps lines until
    /// they are pushed out by capacity.
    pub console_max_age_secs: u64,
}

impl LoggingSettings {
    /// Telemetry log for `module`, resolved against `config_path`.
    #[must_use]
    pub fn telemetry_log_for(&self, config_path: &Path, module: &str) -> Option<PathBuf> {
        let base = RelaySettings::resolve_path(config_path, self.telemetry_log.as_ref()?);
        let stem = base
            .file_stem()
            .map_or_else(|| "telemetry".to_string(), |stem| stem.to_string_lossy().into_owned());
        let name = match base.extension() {
            Some(ext) => format!("{stem}.{module}.{}", ext.to_string_lossy()),
            None => format!("{stem}.{module}"),
        };
        Some(base.with_file_name(name))
    }

    /// Age cutoff for the in-memory console, if any.
    #[must_use]
    pub const fn console_max_age(&self) -> Option<Duration> {
        if self.console_max_age_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.console_max_age_secs))
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            console_log: None,
            telemetry_log: None,
            event_log: None,
            console_capacity: 500,
            console_max_age_secs: 300,
        }
    }
}

/// Whole configuration document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Remote console endpoint.
    pub server: ServerSettings,
    /// Dispatch loop tuning.
    pub dispatch: DispatchSection,
    /// Rule file and action map.
    pub rules: RulesSection,
    /// Weights for the random negative and hostile tables, keyed by action name.
    pub weights: BTreeMap<String, i32>,
    /// Mob tier ranges.
    pub mob_sizes: MobSizeSettings,
    /// Synthetic event generator.
    pub test_source: TestSourceSettings,
    /// Log sinks.
    pub logging: LoggingSettings,
}

impl RelaySettings {
    /// Loads `path`, writing defaults there first when it does not exist.
    ///
    /// The second value is `Some` when the file had to be created.
    ///
    /// # Errors
    /// Unreadable or unparsable files.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<(Self, Option<SettingsError>)> {
        let path = path.as_ref();
        if !path.exists() {
            let defaults = Self::default();
            defaults.save(path)?;
            return Ok((defaults, Some(SettingsError::Created(path.to_path_buf()))));
        }
        Ok((Self::load(path)?, None))
    }

    /// Loads and parses `path`.
    ///
    /// # Errors
    /// Unreadable or unparsable files.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading relay config {}", path.display()))?;
        let settings: Self =
            toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
        Ok(settings)
    }

    /// Writes the settings as TOML.
    ///
    /// # Errors
    /// Serialization or filesystem failures.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let raw = toml::to_string_pretty(self).context("serializing relay config")?;
        fs::write(path, raw).with_context(|| format!("writing {}", path.display()))
    }

    /// Every section that can be validated.
    #[must_use]
    pub fn verifiable_sections(&self) -> [&dyn VerifiableSettings; 3] {
        [&self.server, &self.dispatch, &self.test_source]
    }

    /// Missing fields as `section.field`.
    #[must_use]
    pub fn missing_fields(&self) -> Vec<String> {
        self.verifiable_sections()
            .iter()
            .flat_map(|section| {
                let name = section.section();
                section
                    .validate()
                    .into_iter()
                    .map(move |field| format!("{name}.{field}"))
            })
            .collect()
    }

    /// Validates every section.
    ///
    /// # Errors
    /// [`SettingsError::Invalid`] listing every missing field.
    pub fn validate(&self) -> Result<(), SettingsError> {
        let missing = self.missing_fields();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SettingsError::Invalid(missing))
        }
    }

    /// Weight table keyed by action; unknown names are skipped with a warning.
    #[must_use]
    pub fn weight_table(&self) -> HashMap<GameAction, i32> {
        self.weights
            .iter()
            .filter_map(|(name, weight)| match name.parse::<GameAction>() {
                Ok(action) => Some((action, *weight)),
                Err(err) => {
                    warn!(error = %err, "settings.weights.unknown_action");
                    None
                }
            })
            .collect()
    }

    /// Rule action map.
    #[must_use]
    pub fn action_map(&self) -> ActionMap {
        self.rules
            .actions
            .iter()
            .map(|(name, actions)| (name.clone(), actions.clone()))
            .collect()
    }

    /// Resolves `candidate` against the directory holding `config_path`.
    #[must_use]
    pub fn resolve_path(config_path: &Path, candidate: &Path) -> PathBuf {
        if candidate.is_absolute() {
            return candidate.to_path_buf();
        }
        config_path
            .parent()
            .map_or_else(|| candidate.to_path_buf(), |dir| dir.join(candidate))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const SAMPLE: &str = r#"
[server]
host = "10.0.0.5"
port = 27016
password = "secret"

[dispatch]
max_attempts = 3

[rules.actions]
bigdono = ["SpawnTank", "SupplyCrate"]

[weights]
SpawnTank = 1
SpawnWitch = 4
NotAnAction = 9

[mob_sizes.small]
min = 1
max = 2

[test_source]
enabled = true
"#;

    #[test]
    fn telemetry_logs_are_split_per_module() {
        let logging = LoggingSettings {
            telemetry_log: Some(PathBuf::from("logs/telemetry.jsonl")),
            ..LoggingSettings::default()
        };
        let config = Path::new("/srv/relay/relay.toml");
        assert_eq!(
            logging.telemetry_log_for(config, "dispatch"),
            Some(PathBuf::from("/srv/relay/logs/telemetry.dispatch.jsonl"))
        );
        assert_ne!(
            logging.telemetry_log_for(config, "rules"),
            logging.telemetry_log_for(config, "relay")
        );
        assert_eq!(LoggingSettings::default().telemetry_log_for(config, "relay"), None);
        assert_eq!(
            LoggingSettings::default().console_max_age(),
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn parses_partial_documents_over_defaults() {
        let settings: RelaySettings = toml::from_str(SAMPLE).unwrap();
        assert_eq!(settings.server.port, 27016);
        assert_eq!(settings.dispatch.max_attempts, 3);
        assert_eq!(settings.dispatch.probe_interval_secs, 45);
        assert_eq!(settings.mob_sizes.small.max, 2);
        assert_eq!(settings.mob_sizes.large.max, 25);
        assert_eq!(settings.test_source.workflow, "test");
        assert_eq!(
            settings.action_map()["bigdono"],
            vec![GameAction::SpawnTank, GameAction::SupplyCrate]
        );
        let weights = settings.weight_table();
        assert_eq!(weights.len(), 2);
        assert_eq!(weights[&GameAction::SpawnWitch], 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn every_section_is_enumerated_for_validation() {
        let settings = RelaySettings::default();
        let names: Vec<_> = settings
            .verifiable_sections()
            .iter()
            .map(|section| section.section())
            .collect();
        assert_eq!(names, vec!["server", "dispatch", "test_source"]);

        let mut broken = RelaySettings::default();
        broken.server.host.clear();
        broken.dispatch.max_attempts = 0;
        broken.test_source.enabled = true;
        broken.test_source.workflow.clear();
        assert_eq!(
            broken.missing_fields(),
            vec![
                "server.host",
                "server.password",
                "dispatch.max_attempts",
                "test_source.workflow"
            ]
        );
    }

    #[test]
    fn missing_file_writes_defaults_and_reports_invalid() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join(DEFAULT_SETTINGS_FILE);
        let (settings, created) = RelaySettings::load_or_create(&path).unwrap();
        assert_eq!(created, Some(SettingsError::Created(path.clone())));
        assert!(path.exists());
        assert_eq!(settings.missing_fields(), vec!["server.password"]);

        let reloaded = RelaySettings::load(&path).unwrap();
        assert_eq!(reloaded, settings);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("broken.toml");
        fs::write(&path, "[server\nport = ").unwrap();
        let err = RelaySettings::load(&path).unwrap_err();
        assert!(err.to_string().contains("parsing"));
    }
}
