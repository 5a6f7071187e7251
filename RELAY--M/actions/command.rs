use std::{fmt, time::Duration};

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use shared_logging::ConsoleWriter;

use crate::remote::RemoteConsole;

/// Reply fragment printed by the bridge plugin after a mob spawn.
pub const MOB_SPAWN_MARKER: &str = "[Bridge] mob spawn success";
/// Reply fragment printed after a special infected spawn.
pub const INFECTED_SPAWN_MARKER: &str = "[Bridge] infected spawn success";
/// Reply fragment printed after a lootbox spawn.
pub const LOOTBOX_MARKER: &str = "[Bridge] lootbox spawned";
/// Reply fragment printed after a supply crate spawn.
pub const SUPPLY_MARKER: &str = "[Bridge] supplies spawned";
/// Reply fragment of a pause check while the game is paused.
pub const PAUSED_MARKER: &str = "[Bridge] game paused";
/// Longest sender name kept on a command, in characters.
pub const MAX_SENDER_LEN: usize = 100;

static LOG_ECHO: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^L \d{2}/\d{2}/\d{4} - \d{2}:\d{2}:\d{2}:").expect("log echo pattern is valid")
});

/// Concrete command category understood by the server plugin.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Operator supplied text sent verbatim.
    Raw,
    /// Health probe reporting whether the game is paused.
    CheckPause,
    /// Flips the pause state.
    TogglePause,
    /// Spawns a horde of common infected.
    SpawnMob,
    /// Spawns one special infected.
    SpawnHostile,
    /// Spawns a lootbox.
    SpawnLootbox,
    /// Spawns a supply crate.
    SpawnSupply,
    /// Heals every survivor.
    HealAll,
    /// Respawns dead survivors.
    RespawnAll,
    /// Revives incapacitated survivors.
    ReviveAll,
}

impl CommandKind {
    /// Short label used in console output.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::CheckPause => "check-pause",
            Self::TogglePause => "toggle-pause",
            Self::SpawnMob => "spawn-mob",
            Self::SpawnHostile => "spawn-hostile",
            Self::SpawnLootbox => "spawn-lootbox",
            Self::SpawnSupply => "spawn-supply",
            Self::HealAll => "heal-all",
            Self::RespawnAll => "respawn-all",
            Self::ReviveAll => "revive-all",
        }
    }

    /// Substring a reply must contain for a spawner to count as successful.
    #[must_use]
    pub const fn success_marker(self) -> Option<&'static str> {
        match self {
            Self::SpawnMob => Some(MOB_SPAWN_MARKER),
            Self::SpawnHostile => Some(INFECTED_SPAWN_MARKER),
            Self::SpawnLootbox => Some(LOOTBOX_MARKER),
            Self::SpawnSupply => Some(SUPPLY_MARKER),
            _ => None,
        }
    }

    /// Whether success is decided by inspecting the reply.
    #[must_use]
    pub const fn is_spawner(self) -> bool {
        self.success_marker().is_some()
    }

    /// Whether a failed execution may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::CheckPause)
    }

    /// Whether a retry skips the backoff and goes to the front of the queue.
    #[must_use]
    pub const fn retries_immediately(self) -> bool {
        matches!(self, Self::TogglePause)
    }

    /// Whether the reply is forwarded to the console on success.
    #[must_use]
    pub const fn echoes_reply(self) -> bool {
        !matches!(self, Self::CheckPause | Self::TogglePause)
    }
}

/// Exponential backoff applied to delayed retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retries.
    pub base_delay: Duration,
    /// Upper bound for any delay.
    pub cap_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            cap_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay for a command that has been retried `attempts` times:
    /// `min(base * 2^(attempts / 2), cap)`.
    #[must_use]
    pub fn delay_for(&self, attempts: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempts / 2);
        self.base_delay.saturating_mul(factor).min(self.cap_delay)
    }
}

/// What the dispatcher should do with a command after a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPlan {
    /// Drop the command quietly.
    Skip,
    /// Put it back at the front of the queue now.
    Immediate,
    /// Put it at the back of the queue once the delay elapses.
    After(Duration),
}

/// Strips everything but letters, digits and whitespace, keeping at most
/// [`MAX_SENDER_LEN`] characters.
#[must_use]
pub fn sanitize_sender(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .take(MAX_SENDER_LEN)
        .collect()
}

/// One unit of work for the remote console together with its execution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerCommand {
    kind: CommandKind,
    sender: String,
    detail: Option<String>,
    text: String,
    reply: String,
    has_run: bool,
    succeeded: bool,
    attempts: u32,
}

impl ServerCommand {
    fn new(
        kind: CommandKind,
        sender: &str,
        detail: Option<String>,
        render: impl FnOnce(&str) -> String,
    ) -> Self {
        let sender = sanitize_sender(sender);
        let text = render(&sender).trim_end().to_string();
        Self {
            kind,
            sender,
            detail,
            text,
            reply: String::new(),
            has_run: false,
            succeeded: false,
            attempts: 0,
        }
    }

    /// Operator text sent verbatim.
    #[must_use]
    pub fn raw(command: impl Into<String>) -> Self {
        let command = command.into();
        Self::new(CommandKind::Raw, "", Some(command.clone()), |_| command)
    }

    /// Pause probe.
    #[must_use]
    pub fn check_pause() -> Self {
        Self::new(CommandKind::CheckPause, "", None, |_| {
            "sm_bridge_checkpause".into()
        })
    }

    /// Pause toggle.
    #[must_use]
    pub fn toggle_pause() -> Self {
        Self::new(CommandKind::TogglePause, "", None, |_| {
            "sm_bridge_togglepause".into()
        })
    }

    /// Horde of `count` common infected credited to `sender`.
    #[must_use]
    pub fn spawn_mob(count: u32, sender: &str) -> Self {
        Self::new(CommandKind::SpawnMob, sender, Some(count.to_string()), |s| {
            format!("sm_bridge_spawnmob {count} {s}")
        })
    }

    /// Single special infected of type `infected` credited to `sender`.
    #[must_use]
    pub fn spawn_hostile(infected: &str, sender: &str) -> Self {
        let infected = infected.to_lowercase();
        Self::new(
            CommandKind::SpawnHostile,
            sender,
            Some(infected.clone()),
            |s| format!("sm_bridge_spawnmob {infected} {s}"),
        )
    }

    /// Lootbox credited to `sender`.
    #[must_use]
    pub fn spawn_lootbox(sender: &str) -> Self {
        Self::new(CommandKind::SpawnLootbox, sender, None, |s| {
            format!("sm_bridge_spawnlootbox {s}")
        })
    }

    /// Supply crate credited to `sender`.
    #[must_use]
    pub fn spawn_supply(sender: &str) -> Self {
        Self::new(CommandKind::SpawnSupply, sender, None, |s| {
            format!("sm_bridge_supplycrate {s}")
        })
    }

    /// Full heal credited to `sender`.
    #[must_use]
    pub fn heal_all(sender: &str) -> Self {
        Self::new(CommandKind::HealAll, sender, None, |s| {
            format!("sm_bridge_healplayers {s}")
        })
    }

    /// Respawn credited to `sender`.
    #[must_use]
    pub fn respawn_all(sender: &str) -> Self {
        Self::new(CommandKind::RespawnAll, sender, None, |s| {
            format!("sm_bridge_respawnplayers {s}")
        })
    }

    /// Revive credited to `sender`.
    #[must_use]
    pub fn revive_all(sender: &str) -> Self {
        Self::new(CommandKind::ReviveAll, sender, None, |s| {
            format!("sm_bridge_unincapplayers {s}")
        })
    }

    /// Sends the command and classifies the reply.
    ///
    /// Returns `true` when the command succeeded. A transport failure leaves
    /// the previous reply untouched and returns `false`.
    pub async fn execute(&mut self, remote: &mut dyn RemoteConsole, out: &ConsoleWriter) -> bool {
        let reply = match remote.send_command(&self.text).await {
            Ok(reply) => reply,
            Err(err) => {
                out.print(format!("Failed to execute {self}: {err}"));
                return false;
            }
        };
        self.reply = reply;
        self.has_run = true;
        self.succeeded = self
            .kind
            .success_marker()
            .map_or(true, |marker| self.reply.contains(marker));
        if self.succeeded {
            self.on_finish(out);
        }
        self.succeeded
    }

    fn on_finish(&self, out: &ConsoleWriter) {
        if !self.kind.echoes_reply() {
            return;
        }
        let text = strip_log_echo(&self.reply);
        if !text.trim().is_empty() {
            out.print(text);
        }
    }

    /// Prepares the command for another attempt.
    ///
    /// Non-retryable kinds are left untouched. Otherwise the attempt counter
    /// is incremented and the returned plan tells the dispatcher where the
    /// command goes next.
    pub fn plan_retry(&mut self, policy: &RetryPolicy) -> RetryPlan {
        if !self.kind.is_retryable() {
            return RetryPlan::Skip;
        }
        self.attempts += 1;
        self.has_run = false;
        if self.kind.retries_immediately() {
            RetryPlan::Immediate
        } else {
            RetryPlan::After(policy.delay_for(self.attempts))
        }
    }

    /// Whether a successful pause probe reported a paused game.
    #[must_use]
    pub fn reports_paused(&self) -> bool {
        self.kind == CommandKind::CheckPause && self.succeeded && self.reply.contains(PAUSED_MARKER)
    }

    /// Command category.
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Sanitized sender name.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Rendered command text.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Last reply received.
    #[must_use]
    pub fn reply(&self) -> &str {
        &self.reply
    }

    /// Whether the latest execution got a reply.
    #[must_use]
    pub const fn has_run(&self) -> bool {
        self.has_run
    }

    /// Whether the latest execution succeeded.
    #[must_use]
    pub const fn was_successful(&self) -> bool {
        self.succeeded
    }

    /// Number of retries scheduled so far.
    #[must_use]
    pub const fn attempts(&self) -> u32 {
        self.attempts
    }
}

impl fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind.label())?;
        if let Some(detail) = &self.detail {
            write!(f, "[{detail}]")?;
        }
        if !self.sender.is_empty() {
            write!(f, " from {}", self.sender)?;
        }
        Ok(())
    }
}

/// Removes server log lines echoed back inside a reply.
#[must_use]
pub fn strip_log_echo(reply: &str) -> String {
    reply
        .lines()
        .filter(|line| !LOG_ECHO.is_match(line))
        .collect::<Vec<_>>()
        .join("\n")
}
