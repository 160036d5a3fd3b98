//! ClipStash - clipboard history manager
//!
//! This is the main entry point for the ClipStash daemon and CLI.

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use clipstash::cli::{Cli, CliHandler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut handler = CliHandler::new(cli.config)?;

    // Initialize logging
    let log_level = if cli.verbose {
        "debug".to_string()
    } else {
        handler.settings().log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("clipstash={}", log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    debug!(
        "ClipStash v{} ({}, {}, built {})",
        clipstash::VERSION,
        env!("TARGET"),
        env!("PROFILE"),
        env!("BUILD_DATE")
    );

    handler.handle_command(cli.command).await?;

    Ok(())
}
