#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Game actions and the server commands that realize them.

/// Static action registry and classification flags.
#[path = "../catalog.rs"]
pub mod catalog;

/// Weighted random selection.
#[path = "../selector.rs"]
pub mod selector;

/// Concrete server commands, success detection and retry planning.
#[path = "../command.rs"]
pub mod command;

/// Abstract action to command translation.
#[path = "../builder.rs"]
pub mod builder;

/// Remote console abstraction and scripted test double.
#[path = "../remote.rs"]
pub mod remote;

/// Prelude exports for crates that build and execute commands.
pub mod prelude {
    pub use crate::builder::{BuilderSnapshot, CommandBuilder, MobSizeSettings, SpawnSizeRange};
    pub use crate::catalog::{ActionError, ActionInfo, Classification, GameAction};
    pub use crate::command::{CommandKind, RetryPlan, RetryPolicy, ServerCommand};
    pub use crate::remote::{RemoteConsole, RemoteError, ScriptedConsole};
    pub use crate::selector::{WeightedOption, WeightedSelector};
}
