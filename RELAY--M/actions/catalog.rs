use std::{fmt, str::FromStr};

use once_cell::sync::Lazy;
use serde::{
    de::{value::StrDeserializer, IntoDeserializer},
    Deserialize, Serialize,
};
use thiserror::Error;

/// Platform-independent effect that can be applied to the game session.
///
/// Variants are serialized by name, which is how rule action lists and weight
/// tables refer to them in configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GameAction {
    /// Does nothing.
    None,
    /// Spawns a tank.
    SpawnTank,
    /// Spawns a spitter.
    SpawnSpitter,
    /// Spawns a jockey.
    SpawnJockey,
    /// Spawns a witch.
    SpawnWitch,
    /// Spawns a boomer.
    SpawnBoomer,
    /// Spawns a hunter.
    SpawnHunter,
    /// Spawns a charger.
    SpawnCharger,
    /// Spawns a smoker.
    SpawnSmoker,
    /// Spawns a mob of random size.
    SpawnMob,
    /// Spawns a small mob.
    SpawnMobSmall,
    /// Spawns a medium mob.
    SpawnMobMedium,
    /// Spawns a large mob.
    SpawnMobLarge,
    /// Drops a lootbox.
    Lootbox,
    /// Drops a supply crate.
    SupplyCrate,
    /// Heals every survivor.
    HealPlayers,
    /// Respawns dead survivors.
    RespawnPlayers,
    /// Revives incapacitated survivors.
    UnincapPlayers,
    /// Any positive action.
    RandomPositive,
    /// Any negative action, weighted by configuration.
    RandomNegative,
    /// Any hostile spawn, weighted by configuration.
    RandomHostile,
    /// Coin flip between [`GameAction::RandomPositive`] and [`GameAction::RandomNegative`].
    Random,
}

/// Classification flags attached to every action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Classification {
    /// Helps the survivors.
    pub positive: bool,
    /// Hurts the survivors.
    pub negative: bool,
    /// Spawns a special hostile rather than a mob.
    pub spawns_hostile: bool,
}

/// Static description of an action.
#[derive(Debug, Clone, Copy)]
pub struct ActionInfo {
    /// The action described.
    pub action: GameAction,
    /// Name shown to operators and chat; absent for no-ops.
    pub display_name: Option<&'static str>,
    /// Classification flags.
    pub class: Classification,
}

const fn info(
    action: GameAction,
    display_name: &'static str,
    positive: bool,
    negative: bool,
    spawns_hostile: bool,
) -> ActionInfo {
    ActionInfo {
        action,
        display_name: Some(display_name),
        class: Classification {
            positive,
            negative,
            spawns_hostile,
        },
    }
}

/// Every action with its metadata, in declaration order.
pub static CATALOG: [ActionInfo; 22] = [
    ActionInfo {
        action: GameAction::None,
        display_name: None,
        class: Classification {
            positive: false,
            negative: false,
            spawns_hostile: false,
        },
    },
    info(GameAction::SpawnTank, "Tank", false, true, true),
    info(GameAction::SpawnSpitter, "Spitter", false, true, true),
    info(GameAction::SpawnJockey, "Jockey", false, true, true),
    info(GameAction::SpawnWitch, "Witch", false, true, true),
    info(GameAction::SpawnBoomer, "Boomer", false, true, true),
    info(GameAction::SpawnHunter, "Hunter", false, true, true),
    info(GameAction::SpawnCharger, "Charger", false, true, true),
    info(GameAction::SpawnSmoker, "Smoker", false, true, true),
    info(GameAction::SpawnMob, "Mob", false, true, false),
    info(GameAction::SpawnMobSmall, "Small Mob", false, true, false),
    info(GameAction::SpawnMobMedium, "Medium Mob", false, true, false),
    info(GameAction::SpawnMobLarge, "Large Mob", false, true, false),
    info(GameAction::Lootbox, "Lootbox", true, false, false),
    info(GameAction::SupplyCrate, "Supply Crate", true, false, false),
    info(GameAction::HealPlayers, "Heal", true, false, false),
    info(GameAction::RespawnPlayers, "Respawn", true, false, false),
    info(GameAction::UnincapPlayers, "Revive", true, false, false),
    info(GameAction::RandomPositive, "Random Positive", false, false, false),
    info(GameAction::RandomNegative, "Random Negative", false, false, false),
    info(GameAction::RandomHostile, "Random Infected", false, false, false),
    info(GameAction::Random, "Random", false, false, false),
];

static POSITIVE: Lazy<Vec<GameAction>> = Lazy::new(|| collect(|class| class.positive));
static NEGATIVE: Lazy<Vec<GameAction>> = Lazy::new(|| collect(|class| class.negative));
static HOSTILE: Lazy<Vec<GameAction>> = Lazy::new(|| collect(|class| class.spawns_hostile));

fn collect(filter: impl Fn(&Classification) -> bool) -> Vec<GameAction> {
    CATALOG
        .iter()
        .filter(|entry| filter(&entry.class))
        .map(|entry| entry.action)
        .collect()
}

impl GameAction {
    /// Looks up the catalog entry for this action.
    #[must_use]
    pub fn info(self) -> &'static ActionInfo {
        // Declaration order matches the catalog.
        &CATALOG[self as usize]
    }

    /// Classification flags.
    #[must_use]
    pub fn classify(self) -> Classification {
        self.info().class
    }

    /// Human readable name, absent for [`GameAction::None`].
    #[must_use]
    pub fn display_name(self) -> Option<&'static str> {
        self.info().display_name
    }

    /// Whether this action is resolved into another action when built.
    #[must_use]
    pub const fn is_meta(self) -> bool {
        matches!(
            self,
            Self::RandomPositive | Self::RandomNegative | Self::RandomHostile | Self::Random
        )
    }

    /// Actions flagged positive.
    #[must_use]
    pub fn positive_actions() -> &'static [Self] {
        &POSITIVE
    }

    /// Actions flagged negative.
    #[must_use]
    pub fn negative_actions() -> &'static [Self] {
        &NEGATIVE
    }

    /// Actions that spawn a special hostile.
    #[must_use]
    pub fn hostile_actions() -> &'static [Self] {
        &HOSTILE
    }
}

impl fmt::Display for GameAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.display_name() {
            Some(name) => f.write_str(name),
            None => f.write_str("None"),
        }
    }
}

impl FromStr for GameAction {
    type Err = ActionError;

    /// Parses the variant name used in configuration (`"SpawnTank"`).
    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let deserializer: StrDeserializer<'_, serde::de::value::Error> =
            name.trim().into_deserializer();
        Self::deserialize(deserializer)
            .map_err(|_| ActionError::InvalidConfig(format!("unknown action {name}")))
    }
}

/// Errors surfaced while building selectors or commands.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    /// Configuration cannot produce a usable selector or command.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
