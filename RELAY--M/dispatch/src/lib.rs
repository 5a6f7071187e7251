#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Dispatch runtime: owns the remote console session and drains the command queue.

/// Telemetry builder/hook for dispatch components.
#[path = "../telemetry.rs"]
pub mod telemetry;

/// Source RCON client.
#[path = "../rcon.rs"]
pub mod rcon;

/// Queue, execute/retry loop and health probe.
#[path = "../engine.rs"]
pub mod engine;

pub use engine::{
    resolve_server, DispatchEngine, DispatchEngineBuilder, DispatchError, DispatchSettings,
    DispatchStats, DispatchWorker, PauseCallback, SessionState, WorkerStep,
};
pub use rcon::{RconClient, RconConfig};
pub use telemetry::{DispatchTelemetry, DispatchTelemetryBuilder};
