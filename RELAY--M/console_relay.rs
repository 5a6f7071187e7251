use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use relay_orchestrator::{OperatorConsole, RelayRuntime, DEFAULT_SETTINGS_FILE};
use tokio::sync::mpsc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "console_relay",
    version,
    about = "Relays stream events to a game server's remote console"
)]
struct Cli {
    /// Configuration file; defaults are written here when it is missing.
    #[arg(long, default_value = DEFAULT_SETTINGS_FILE)]
    config: PathBuf,
    /// Diagnostic filter, overriding `RUST_LOG`.
    #[arg(long)]
    log_filter: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let filter = match &cli.log_filter {
        Some(directives) => EnvFilter::try_new(directives)
            .with_context(|| format!("invalid log filter {directives}"))?,
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .compact()
        .with_writer(std::io::stderr)
        .init();

    let relay = RelayRuntime::load(&cli.config)?.stdout(true).build()?;
    relay.start()?;
    info!(config = %cli.config.display(), "console_relay.ready");

    let (sender, receiver) = mpsc::unbounded_channel();
    let operator = OperatorConsole::new(sender, None);
    let reader = tokio::spawn(async move {
        if let Err(err) = operator.run_stdin().await {
            error!(error = %err, "console_relay.stdin_failed");
        }
    });

    relay.run(receiver).await;
    reader.abort();
    relay.shutdown();
    Ok(())
}
