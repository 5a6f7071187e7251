use std::{fs, path::Path};

use async_trait::async_trait;
use indexmap::IndexMap;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::{SourceEvent, SourceEventKind};

/// Failures loading or evaluating rules.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RulesError {
    /// The rules file did not exist; an empty one was created in its place.
    #[error("rules file {0} was missing and has been created empty")]
    Missing(String),
    /// The rules file exists but does not describe any workflow.
    #[error("rules file is invalid: {0}")]
    Malformed(String),
    /// Filesystem failure.
    #[error("rules file i/o: {0}")]
    Io(String),
    /// No workflow with the requested name.
    #[error("unknown workflow {0}")]
    UnknownWorkflow(String),
}

/// Outcome of evaluating one rule against an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleResult {
    /// Rule name as written in the rules file.
    pub rule_name: String,
    /// Optional alias used to look up actions when the rule name has none.
    pub success_event: Option<String>,
    /// Whether the rule matched.
    pub is_success: bool,
}

/// Black-box rule evaluator.
#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Evaluates every rule of `workflow` against `event`, in declaration order.
    async fn evaluate_workflow(
        &self,
        workflow: &str,
        event: &SourceEvent,
    ) -> Result<Vec<RuleResult>, RulesError>;

    /// Number of workflows known to the engine.
    fn workflow_count(&self) -> usize;
}

/// Predicate over a [`SourceEvent`], tagged by `op` in JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    /// Always true.
    Always,
    /// True when every child holds.
    All {
        /// Children.
        conditions: Vec<Condition>,
    },
    /// True when any child holds.
    Any {
        /// Children.
        conditions: Vec<Condition>,
    },
    /// Negates its child.
    Not {
        /// Child.
        condition: Box<Condition>,
    },
    /// Event kind equals `kind`.
    KindIs {
        /// Expected kind.
        kind: SourceEventKind,
    },
    /// Amount is at least `value`.
    AmountAtLeast {
        /// Inclusive threshold.
        value: f64,
    },
    /// Amount is strictly below `value`.
    AmountBelow {
        /// Exclusive threshold.
        value: f64,
    },
    /// Message is not blank.
    HasMessage,
    /// Message contains `value`, or any item when `value` is a comma list.
    MessageContains {
        /// Needle or comma separated needles.
        value: String,
    },
    /// Display name equals `value`, ignoring case.
    NameIs {
        /// Expected name.
        value: String,
    },
    /// Origin channel equals `value`, ignoring case.
    ChannelIs {
        /// Expected channel.
        value: String,
    },
    /// Currency code equals `value`, ignoring case.
    CurrencyIs {
        /// Expected currency.
        value: String,
    },
    /// Random roll succeeding `chance` percent of the time.
    PercentChance {
        /// Percentage; at or below zero never, at or above 100 always.
        chance: i32,
    },
}

/// Whether `input` contains `value_or_csv`, or any of its comma separated items.
#[must_use]
pub fn check_contains(input: &str, value_or_csv: &str) -> bool {
    if input.trim().is_empty() || value_or_csv.trim().is_empty() {
        return false;
    }
    let haystack = input.to_lowercase();
    value_or_csv
        .split(',')
        .map(|item| item.trim().to_lowercase())
        .filter(|item| !item.is_empty())
        .any(|item| haystack.contains(&item))
}

/// Rolls `0..=100` and succeeds when the roll is at most `chance`.
pub fn percent_chance<R: Rng + ?Sized>(chance: i32, rng: &mut R) -> bool {
    if chance <= 0 {
        return false;
    }
    if chance >= 100 {
        return true;
    }
    rng.gen_range(0..=100) <= chance
}

impl Condition {
    /// Evaluates the condition against `event`.
    pub fn evaluate<R: Rng + ?Sized>(&self, event: &SourceEvent, rng: &mut R) -> bool {
        match self {
            Self::Always => true,
            Self::All { conditions } => conditions.iter().all(|c| c.evaluate(event, &mut *rng)),
            Self::Any { conditions } => conditions.iter().any(|c| c.evaluate(event, &mut *rng)),
            Self::Not { condition } => !condition.evaluate(event, &mut *rng),
            Self::KindIs { kind } => event.kind == *kind,
            Self::AmountAtLeast { value } => event.amount >= *value,
            Self::AmountBelow { value } => event.amount < *value,
            Self::HasMessage => !event.message.trim().is_empty(),
            Self::MessageContains { value } => check_contains(&event.message, value),
            Self::NameIs { value } => event.name.eq_ignore_ascii_case(value),
            Self::ChannelIs { value } => event.channel.eq_ignore_ascii_case(value),
            Self::CurrencyIs { value } => event.currency.eq_ignore_ascii_case(value),
            Self::PercentChance { chance } => percent_chance(*chance, rng),
        }
    }
}

const fn enabled_by_default() -> bool {
    true
}

/// One named rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Rule name; lowercased for action lookup.
    pub rule_name: String,
    /// Alias consulted when the rule name maps to no actions.
    #[serde(default)]
    pub success_event: Option<String>,
    /// Disabled rules are skipped entirely.
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    /// Predicate deciding success.
    pub when: Condition,
}

/// Named, ordered list of rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    /// Workflow name used by event sources.
    pub workflow_name: String,
    /// Rules in evaluation order.
    #[serde(default)]
    pub rules: Vec<RuleDefinition>,
}

/// [`RuleEngine`] driven by a JSON document of workflows.
#[derive(Debug)]
pub struct DeclarativeRuleEngine {
    workflows: IndexMap<String, Workflow>,
    rng: Mutex<StdRng>,
}

impl DeclarativeRuleEngine {
    /// Creates an engine from parsed workflows.
    #[must_use]
    pub fn new(workflows: Vec<Workflow>) -> Self {
        Self::with_rng(workflows, StdRng::from_entropy())
    }

    /// Creates an engine using `rng` for chance conditions.
    #[must_use]
    pub fn with_rng(workflows: Vec<Workflow>, rng: StdRng) -> Self {
        Self {
            workflows: workflows
                .into_iter()
                .map(|workflow| (workflow.workflow_name.clone(), workflow))
                .collect(),
            rng: Mutex::new(rng),
        }
    }

    /// Parses a JSON array of workflows.
    ///
    /// # Errors
    /// Returns [`RulesError::Malformed`] for invalid JSON or an empty document.
    pub fn from_json(raw: &str) -> Result<Self, RulesError> {
        if raw.trim().is_empty() {
            return Err(RulesError::Malformed("document is empty".into()));
        }
        let workflows: Vec<Workflow> =
            serde_json::from_str(raw).map_err(|err| RulesError::Malformed(err.to_string()))?;
        Ok(Self::new(workflows))
    }

    /// Loads the rules file, creating an empty one when it is missing.
    ///
    /// # Errors
    /// [`RulesError::Missing`] after creating the file, [`RulesError::Malformed`]
    /// for unusable content, [`RulesError::Io`] for filesystem failures.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, RulesError> {
        let path = path.as_ref();
        if !path.exists() {
            fs::File::create(path).map_err(|err| RulesError::Io(err.to_string()))?;
            return Err(RulesError::Missing(path.display().to_string()));
        }
        let raw = fs::read_to_string(path).map_err(|err| RulesError::Io(err.to_string()))?;
        Self::from_json(&raw)
    }

    /// Workflow names in file order.
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }
}

#[async_trait]
impl RuleEngine for DeclarativeRuleEngine {
    async fn evaluate_workflow(
        &self,
        workflow: &str,
        event: &SourceEvent,
    ) -> Result<Vec<RuleResult>, RulesError> {
        let definition = self
            .workflows
            .get(workflow)
            .ok_or_else(|| RulesError::UnknownWorkflow(workflow.to_string()))?;
        let mut rng = self.rng.lock();
        Ok(definition
            .rules
            .iter()
            .filter(|rule| rule.enabled)
            .map(|rule| RuleResult {
                rule_name: rule.rule_name.clone(),
                success_event: rule.success_event.clone(),
                is_success: rule.when.evaluate(event, &mut *rng),
            })
            .collect())
    }

    fn workflow_count(&self) -> usize {
        self.workflows.len()
    }
}
