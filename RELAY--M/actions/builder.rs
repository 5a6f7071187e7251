use std::{collections::HashMap, sync::Arc};

use parking_lot::{Mutex, RwLock};
use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{
    catalog::GameAction,
    command::ServerCommand,
    selector::{WeightedOption, WeightedSelector},
};

/// Inclusive bounds for a mob spawn count.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnSizeRange {
    /// Lower bound; negative values are clamped to zero.
    pub min: i32,
    /// Upper bound; values below `min` collapse the range to `min`.
    pub max: i32,
}

impl SpawnSizeRange {
    /// Creates a range.
    #[must_use]
    pub const fn new(min: i32, max: i32) -> Self {
        Self { min, max }
    }

    /// Draws a count uniformly from the range.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        let min = u32::try_from(self.min).unwrap_or(0);
        let max = u32::try_from(self.max).unwrap_or(0).max(min);
        rng.gen_range(min..=max)
    }
}

/// Count ranges for every mob tier.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct MobSizeSettings {
    /// Range for [`GameAction::SpawnMobSmall`].
    pub small: SpawnSizeRange,
    /// Range for [`GameAction::SpawnMobMedium`].
    pub medium: SpawnSizeRange,
    /// Range for [`GameAction::SpawnMobLarge`].
    pub large: SpawnSizeRange,
    /// Range for an unsized [`GameAction::SpawnMob`].
    pub random: SpawnSizeRange,
}

impl Default for MobSizeSettings {
    fn default() -> Self {
        Self {
            small: SpawnSizeRange::new(3, 5),
            medium: SpawnSizeRange::new(6, 12),
            large: SpawnSizeRange::new(15, 25),
            random: SpawnSizeRange::new(4, 20),
        }
    }
}

/// Immutable tables consulted by [`CommandBuilder::build`].
#[derive(Debug, Default)]
pub struct BuilderSnapshot {
    /// Mob tier ranges.
    pub mob_sizes: MobSizeSettings,
    /// Weighted table for [`GameAction::RandomNegative`], if configured.
    pub negative: Option<WeightedSelector<GameAction>>,
    /// Weighted table for [`GameAction::RandomHostile`], if configured.
    pub hostile: Option<WeightedSelector<GameAction>>,
}

/// Turns abstract actions into concrete server commands.
#[derive(Debug)]
pub struct CommandBuilder {
    snapshot: RwLock<Arc<BuilderSnapshot>>,
    rng: Mutex<StdRng>,
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new(StdRng::from_entropy())
    }
}

impl CommandBuilder {
    /// Creates a builder with default tables drawing from `rng`.
    #[must_use]
    pub fn new(rng: StdRng) -> Self {
        Self {
            snapshot: RwLock::new(Arc::default()),
            rng: Mutex::new(rng),
        }
    }

    /// Creates a deterministic builder.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }

    /// Replaces the weight tables and mob ranges in one step.
    ///
    /// A table without any positive weight is left unset and the matching
    /// meta-action falls back to a uniform draw.
    pub fn initialize(&self, weights: &HashMap<GameAction, i32>, mob_sizes: MobSizeSettings) {
        let snapshot = BuilderSnapshot {
            mob_sizes,
            negative: weighted_table("negative", GameAction::negative_actions(), weights),
            hostile: weighted_table("hostile", GameAction::hostile_actions(), weights),
        };
        *self.snapshot.write() = Arc::new(snapshot);
    }

    /// Current tables.
    #[must_use]
    pub fn snapshot(&self) -> Arc<BuilderSnapshot> {
        self.snapshot.read().clone()
    }

    /// Builds the command for `action` credited to `sender`.
    ///
    /// Meta-actions are resolved to a concrete action first. Returns `None`
    /// for [`GameAction::None`].
    pub fn build(&self, action: GameAction, sender: &str) -> Option<ServerCommand> {
        let snapshot = self.snapshot();
        let concrete = self.resolve(action, &snapshot);
        let mut rng = self.rng.lock();
        let command = match concrete {
            GameAction::None
            | GameAction::Random
            | GameAction::RandomPositive
            | GameAction::RandomNegative
            | GameAction::RandomHostile => return None,
            GameAction::SpawnTank
            | GameAction::SpawnSpitter
            | GameAction::SpawnJockey
            | GameAction::SpawnWitch
            | GameAction::SpawnBoomer
            | GameAction::SpawnHunter
            | GameAction::SpawnCharger
            | GameAction::SpawnSmoker => {
                ServerCommand::spawn_hostile(concrete.display_name()?, sender)
            }
            GameAction::SpawnMob => {
                ServerCommand::spawn_mob(snapshot.mob_sizes.random.sample(&mut *rng), sender)
            }
            GameAction::SpawnMobSmall => {
                ServerCommand::spawn_mob(snapshot.mob_sizes.small.sample(&mut *rng), sender)
            }
            GameAction::SpawnMobMedium => {
                ServerCommand::spawn_mob(snapshot.mob_sizes.medium.sample(&mut *rng), sender)
            }
            GameAction::SpawnMobLarge => {
                ServerCommand::spawn_mob(snapshot.mob_sizes.large.sample(&mut *rng), sender)
            }
            GameAction::Lootbox => ServerCommand::spawn_lootbox(sender),
            GameAction::SupplyCrate => ServerCommand::spawn_supply(sender),
            GameAction::HealPlayers => ServerCommand::heal_all(sender),
            GameAction::RespawnPlayers => ServerCommand::respawn_all(sender),
            GameAction::UnincapPlayers => ServerCommand::revive_all(sender),
        };
        Some(command)
    }

    /// Resolves meta-actions until a concrete action remains.
    fn resolve(&self, action: GameAction, snapshot: &BuilderSnapshot) -> GameAction {
        let mut rng = self.rng.lock();
        let mut current = action;
        loop {
            current = match current {
                GameAction::Random => {
                    if rng.gen_bool(0.5) {
                        GameAction::RandomPositive
                    } else {
                        GameAction::RandomNegative
                    }
                }
                GameAction::RandomPositive => {
                    pick_uniform(GameAction::positive_actions(), &mut *rng)
                }
                GameAction::RandomNegative => match &snapshot.negative {
                    Some(selector) => selector.next(&mut *rng),
                    None => pick_uniform(GameAction::negative_actions(), &mut *rng),
                },
                GameAction::RandomHostile => match &snapshot.hostile {
                    Some(selector) => selector.next(&mut *rng),
                    None => pick_uniform(GameAction::hostile_actions(), &mut *rng),
                },
                concrete => return concrete,
            };
        }
    }
}

fn pick_uniform<R: Rng + ?Sized>(candidates: &[GameAction], rng: &mut R) -> GameAction {
    candidates.choose(rng).copied().unwrap_or(GameAction::None)
}

fn weighted_table(
    label: &str,
    candidates: &[GameAction],
    weights: &HashMap<GameAction, i32>,
) -> Option<WeightedSelector<GameAction>> {
    if weights.is_empty() {
        return None;
    }
    let options = candidates.iter().map(|action| {
        WeightedOption::new(*action, weights.get(action).copied().unwrap_or(0))
    });
    match WeightedSelector::new(options) {
        Ok(selector) => Some(selector),
        Err(err) => {
            warn!(table = label, error = %err, "builder.weights.fallback_uniform");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandKind;

    #[test]
    fn no_op_builds_nothing() {
        let builder = CommandBuilder::seeded(1);
        assert!(builder.build(GameAction::None, "x").is_none());
    }

    #[test]
    fn builds_concrete_commands_with_sanitized_sender() {
        let builder = CommandBuilder::seeded(1);
        let tank = builder.build(GameAction::SpawnTank, "Al$ice_42").unwrap();
        assert_eq!(tank.kind(), CommandKind::SpawnHostile);
        assert_eq!(tank.text(), "sm_bridge_spawnmob tank Alice42");

        let crate_drop = builder.build(GameAction::SupplyCrate, "bob").unwrap();
        assert_eq!(crate_drop.text(), "sm_bridge_supplycrate bob");
        let revive = builder.build(GameAction::UnincapPlayers, "bob").unwrap();
        assert_eq!(revive.kind(), CommandKind::ReviveAll);
    }

    #[test]
    fn mob_counts_follow_tier_ranges() {
        let builder = CommandBuilder::seeded(9);
        for _ in 0..200 {
            let command = builder.build(GameAction::SpawnMobSmall, "").unwrap();
            let count: u32 = command
                .text()
                .split_whitespace()
                .nth(1)
                .unwrap()
                .parse()
                .unwrap();
            assert!((3..=5).contains(&count), "{count}");
        }

        let mut sizes = MobSizeSettings::default();
        sizes.large = SpawnSizeRange::new(-3, -1);
        builder.initialize(&HashMap::new(), sizes);
        let command = builder.build(GameAction::SpawnMobLarge, "").unwrap();
        assert_eq!(command.text(), "sm_bridge_spawnmob 0");
    }

    #[test]
    fn random_meta_actions_resolve_to_their_class() {
        let builder = CommandBuilder::seeded(3);
        for _ in 0..200 {
            let positive = builder.build(GameAction::RandomPositive, "p").unwrap();
            assert!(matches!(
                positive.kind(),
                CommandKind::SpawnLootbox
                    | CommandKind::SpawnSupply
                    | CommandKind::HealAll
                    | CommandKind::RespawnAll
                    | CommandKind::ReviveAll
            ));
            let hostile = builder.build(GameAction::RandomHostile, "h").unwrap();
            assert_eq!(hostile.kind(), CommandKind::SpawnHostile);
            assert!(builder.build(GameAction::Random, "r").is_some());
        }
    }

    #[test]
    fn reinitializing_replaces_weight_tables() {
        let builder = CommandBuilder::seeded(5);
        let first = HashMap::from([(GameAction::SpawnWitch, 10)]);
        builder.initialize(&first, MobSizeSettings::default());
        let second = HashMap::from([(GameAction::SpawnCharger, 4), (GameAction::SpawnWitch, 0)]);
        builder.initialize(&second, MobSizeSettings::default());

        let snapshot = builder.snapshot();
        let hostile = snapshot.hostile.as_ref().unwrap();
        assert_eq!(hostile.values(), &[GameAction::SpawnCharger]);
        for _ in 0..100 {
            let command = builder.build(GameAction::RandomHostile, "w").unwrap();
            assert_eq!(command.text(), "sm_bridge_spawnmob charger w");
        }
    }

    #[test]
    fn negative_weights_shape_random_negative_draws() {
        let builder = CommandBuilder::seeded(13);
        builder.initialize(
            &HashMap::from([(GameAction::SpawnMobLarge, 9), (GameAction::SpawnTank, 1)]),
            MobSizeSettings::default(),
        );
        let snapshot = builder.snapshot();
        let negative = snapshot.negative.as_ref().unwrap();
        assert!((negative.probability(0) + negative.probability(1) - 1.0).abs() < 1e-9);

        let draws = 2_000;
        let mut large = 0;
        for _ in 0..draws {
            let command = builder.build(GameAction::RandomNegative, "n").unwrap();
            match command.kind() {
                CommandKind::SpawnMob => large += 1,
                CommandKind::SpawnHostile => assert_eq!(command.text(), "sm_bridge_spawnmob tank n"),
                other => panic!("unexpected {other:?}"),
            }
        }
        let share = f64::from(large) / f64::from(draws);
        assert!((0.86..=0.94).contains(&share), "{share}");
    }

    #[test]
    fn empty_weight_table_falls_back_to_uniform() {
        let builder = CommandBuilder::seeded(8);
        builder.initialize(
            &HashMap::from([(GameAction::Lootbox, 5)]),
            MobSizeSettings::default(),
        );
        let snapshot = builder.snapshot();
        assert!(snapshot.hostile.is_none());
        assert!(snapshot.negative.is_none());
        assert!(builder.build(GameAction::RandomNegative, "n").is_some());
    }
}
