#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Rule evaluation: normalized source events in, ordered game actions out.

/// Telemetry builder/hook for rule components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Normalized events produced by chat, donation and test sources.
#[path = "../events.rs"]
pub mod events;

/// Rule engine contract and the JSON-driven implementation.
#[path = "../engine.rs"]
pub mod engine;

/// Rule results to action lists.
#[path = "../resolver.rs"]
pub mod resolver;

pub use engine::{
    Condition, DeclarativeRuleEngine, RuleDefinition, RuleEngine, RuleResult, RulesError, Workflow,
};
pub use events::{SourceEnvelope, SourceEvent, SourceEventKind};
pub use resolver::{summarize_actions, ActionMap, RuleResolver};
pub use telemetry::{RulesTelemetry, RulesTelemetryBuilder};
