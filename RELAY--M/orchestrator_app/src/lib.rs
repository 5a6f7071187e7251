#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Console relay runtime: configuration, event sources, operator console and
//! the wiring between rules and the dispatch engine.

/// TOML configuration and validation.
#[path = "../settings.rs"]
pub mod settings;

/// Telemetry handle shared by the runtime and its sources.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Operator command parsing and the stdin reader.
#[path = "../operator.rs"]
pub mod operator;

/// Synthetic donation generator.
#[path = "../test_source.rs"]
pub mod test_source;

/// Runtime assembly and the operator command loop.
#[path = "../runtime.rs"]
pub mod runtime;

pub use operator::{OperatorCommand, OperatorConsole};
pub use runtime::{RelayRuntime, RelayRuntimeBuilder};
pub use settings::{
    DispatchSection, LoggingSettings, RelaySettings, RulesSection, ServerSettings,
    SettingsError, TestSourceSettings, VerifiableSettings, DEFAULT_SETTINGS_FILE,
};
pub use telemetry::{RelayTelemetry, RelayTelemetryBuilder};
pub use test_source::{TestSource, TEST_SENDER};
