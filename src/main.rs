// anonrelay node binary

use anonrelay::cli::RelayCli;
use anonrelay::commands::execute_command;
use anonrelay::config::RelayConfig;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "anonrelay=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    // Parse CLI arguments
    let cli = RelayCli::parse();

    let config = RelayConfig::load(cli.config.as_deref())?;

    // Execute command
    if let Err(e) = execute_command(config, cli.command).await {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
