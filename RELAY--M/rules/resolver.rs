use std::{collections::HashMap, path::Path, sync::Arc};

use indexmap::IndexMap;
use parking_lot::RwLock;
use relay_actions::catalog::GameAction;
use serde_json::json;
use shared_logging::LogLevel;
use tracing::{debug, warn};

use crate::{
    engine::{DeclarativeRuleEngine, RuleEngine, RuleResult},
    events::SourceEvent,
    telemetry::RulesTelemetry,
};

/// Rule or success-event name mapped to the actions it triggers.
pub type ActionMap = HashMap<String, Vec<GameAction>>;

/// Maps rule engine results onto configured action lists.
pub struct RuleResolver {
    engine: RwLock<Option<Arc<dyn RuleEngine>>>,
    actions: RwLock<Arc<ActionMap>>,
    telemetry: RulesTelemetry,
}

impl std::fmt::Debug for RuleResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleResolver")
            .field("has_engine", &self.has_engine())
            .field("actions", &self.action_count())
            .finish()
    }
}

impl RuleResolver {
    /// Creates a resolver with no engine and no actions.
    #[must_use]
    pub fn new(telemetry: RulesTelemetry) -> Self {
        Self {
            engine: RwLock::new(None),
            actions: RwLock::new(Arc::default()),
            telemetry,
        }
    }

    /// Installs (or removes) the rule engine.
    pub fn set_engine(&self, engine: Option<Arc<dyn RuleEngine>>) {
        *self.engine.write() = engine;
    }

    /// Loads the rules file and installs the resulting engine.
    ///
    /// Failures are reported once on the console and leave the resolver
    /// without an engine, so every later resolution is empty.
    pub fn load_engine_file(&self, path: impl AsRef<Path>) -> bool {
        let path = path.as_ref();
        match DeclarativeRuleEngine::load(path) {
            Ok(engine) => {
                let count = engine.workflow_count();
                self.set_engine(Some(Arc::new(engine)));
                self.telemetry
                    .print(format!("Rules engine started with {count} workflows"));
                true
            }
            Err(err) => {
                self.set_engine(None);
                self.telemetry
                    .print(format!("Cannot run rules engine: {err}"));
                if let Err(err) = self.telemetry.log(
                    LogLevel::Error,
                    "rules.engine.unavailable",
                    json!({ "path": path.display().to_string(), "error": err.to_string() }),
                ) {
                    warn!(error = %err, "telemetry log failed");
                }
                false
            }
        }
    }

    /// Replaces the action map; keys are lowercased.
    pub fn load_actions(&self, actions: &ActionMap) {
        let normalized: ActionMap = actions
            .iter()
            .map(|(name, list)| (name.to_lowercase(), list.clone()))
            .collect();
        let count = normalized.len();
        *self.actions.write() = Arc::new(normalized);
        self.telemetry
            .print(format!("Using {count} actions for rule results"));
    }

    /// Whether an engine is installed.
    #[must_use]
    pub fn has_engine(&self) -> bool {
        self.engine.read().is_some()
    }

    /// Number of configured action entries.
    #[must_use]
    pub fn action_count(&self) -> usize {
        self.actions.read().len()
    }

    /// Evaluates `workflow` against `event` and returns the matched actions in
    /// rule order.
    pub async fn resolve(&self, workflow: &str, event: &SourceEvent) -> Vec<GameAction> {
        let Some(engine) = self.engine.read().clone() else {
            return Vec::new();
        };
        debug!(workflow, event = %event, "rules.resolve");
        let results = match engine.evaluate_workflow(workflow, event).await {
            Ok(results) => results,
            Err(err) => {
                self.telemetry.print(format!("Rule evaluation failed: {err}"));
                return Vec::new();
            }
        };
        let actions = self.actions.read().clone();
        self.collect(&results, &actions)
    }

    fn collect(&self, results: &[RuleResult], actions: &ActionMap) -> Vec<GameAction> {
        let mut output = Vec::new();
        for result in results.iter().filter(|result| result.is_success) {
            let rule_name = result.rule_name.to_lowercase();
            let matched = actions.get(&rule_name).or_else(|| {
                result
                    .success_event
                    .as_ref()
                    .and_then(|alias| actions.get(&alias.to_lowercase()))
            });
            if let Some(list) = matched {
                self.telemetry.print(format!("Matched with rule {rule_name}"));
                output.extend_from_slice(list);
            } else {
                self.telemetry
                    .print(format!("Could not find any actions tied to rule {rule_name}"));
            }
        }
        if !output.is_empty() {
            if let Err(err) = self.telemetry.event(
                "rules.resolved",
                json!({ "actions": output.len(), "summary": summarize_actions(&output) }),
            ) {
                warn!(error = %err, "telemetry event failed");
            }
        }
        output
    }
}

/// Renders `"Tank (x2), Supply Crate"`: grouped by action in first-seen order.
#[must_use]
pub fn summarize_actions(actions: &[GameAction]) -> String {
    let mut counts: IndexMap<GameAction, usize> = IndexMap::new();
    for action in actions {
        *counts.entry(*action).or_default() += 1;
    }
    counts
        .into_iter()
        .map(|(action, count)| {
            if count > 1 {
                format!("{action} (x{count})")
            } else {
                action.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RulesError;
    use async_trait::async_trait;
    use shared_logging::{ConsoleWriter, MemoryConsole};
    use tempfile::tempdir;

    struct FixedEngine(Vec<RuleResult>);

    #[async_trait]
    impl RuleEngine for FixedEngine {
        async fn evaluate_workflow(
            &self,
            _workflow: &str,
            _event: &SourceEvent,
        ) -> Result<Vec<RuleResult>, RulesError> {
            Ok(self.0.clone())
        }

        fn workflow_count(&self) -> usize {
            1
        }
    }

    fn result(name: &str, alias: Option<&str>, is_success: bool) -> RuleResult {
        RuleResult {
            rule_name: name.into(),
            success_event: alias.map(Into::into),
            is_success,
        }
    }

    fn resolver() -> (RuleResolver, Arc<MemoryConsole>) {
        let console = Arc::new(MemoryConsole::new(32));
        let telemetry = RulesTelemetry::console_only(ConsoleWriter::new("rules", console.clone()));
        (RuleResolver::new(telemetry), console)
    }

    #[tokio::test]
    async fn maps_matched_rule_to_configured_actions() {
        let (resolver, _console) = resolver();
        resolver.set_engine(Some(Arc::new(FixedEngine(vec![result(
            "bigdono", None, true,
        )]))));
        resolver.load_actions(&HashMap::from([(
            "BigDono".to_string(),
            vec![GameAction::SpawnTank, GameAction::SupplyCrate],
        )]));
        let actions = resolver.resolve("test", &SourceEvent::default()).await;
        assert_eq!(actions, vec![GameAction::SpawnTank, GameAction::SupplyCrate]);
    }

    #[tokio::test]
    async fn falls_back_to_success_event_and_reports_unmapped_rules() {
        let (resolver, console) = resolver();
        resolver.set_engine(Some(Arc::new(FixedEngine(vec![
            result("SmallDono", Some("AnyDono"), true),
            result("Failing", None, false),
            result("Orphan", None, true),
            result("Raid", None, true),
        ]))));
        resolver.load_actions(&HashMap::from([
            ("anydono".to_string(), vec![GameAction::Lootbox]),
            ("raid".to_string(), vec![GameAction::SpawnMobLarge]),
            ("failing".to_string(), vec![GameAction::SpawnWitch]),
        ]));
        let actions = resolver.resolve("test", &SourceEvent::default()).await;
        assert_eq!(actions, vec![GameAction::Lootbox, GameAction::SpawnMobLarge]);
        assert!(console.contains("Could not find any actions tied to rule orphan"));
    }

    #[tokio::test]
    async fn without_engine_resolution_is_empty() {
        let tmp = tempdir().unwrap();
        let (resolver, console) = resolver();
        assert!(!resolver.load_engine_file(tmp.path().join("rules.json")));
        assert!(!resolver.has_engine());
        assert!(console.contains("Cannot run rules engine"));
        let actions = resolver
            .resolve("test", &SourceEvent::donation("x", 5.0, "USD"))
            .await;
        assert!(actions.is_empty());
    }

    #[test]
    fn summary_groups_in_first_seen_order() {
        assert_eq!(
            summarize_actions(&[
                GameAction::SpawnTank,
                GameAction::SpawnTank,
                GameAction::SupplyCrate
            ]),
            "Tank (x2), Supply Crate"
        );
        assert_eq!(
            summarize_actions(&[
                GameAction::Lootbox,
                GameAction::SpawnWitch,
                GameAction::Lootbox
            ]),
            "Lootbox (x2), Witch"
        );
        assert_eq!(summarize_actions(&[]), "");
    }
}
