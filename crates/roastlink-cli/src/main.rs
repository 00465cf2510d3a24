//! Command-line client for the roastlink coffee analyzer.
//!
//! Scans for analyzers, reads device information, runs measurements and
//! saves them to the roastery backend, queueing them locally when the
//! backend is unreachable.

mod cli;
mod commands;
mod config;
mod format;
mod style;
mod util;

use std::io;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands, QueueAction};
use commands::Context;
use config::Config;
use format::FormatOptions;

#[tokio::main]
async fn main() -> Result<()> {
    human_panic::setup_panic!();

    let cli = Cli::parse();

    // Handle completions command early (before tracing init)
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "roastlink", &mut io::stdout());
        return Ok(());
    }

    // When quiet mode is enabled, suppress info-level logging
    let filter = if cli.quiet {
        EnvFilter::new("warn")
    } else if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load(&config_path);
    tracing::debug!("Using config {}", config_path.display());

    let ctx = Context {
        config: &config,
        config_path: &config_path,
        output: cli.output.as_ref(),
        quiet: cli.quiet,
        opts: FormatOptions::new(cli.no_color, cli.style).with_compact(cli.compact),
    };

    match cli.command {
        Commands::Scan { timeout, format } => commands::cmd_scan(&ctx, timeout, format).await,
        Commands::Info { device, format } => commands::cmd_info(&ctx, device, format).await,
        Commands::Measure(args) => commands::cmd_measure(&ctx, args).await,
        Commands::Queue { action } => match action {
            QueueAction::List { format } => commands::cmd_queue_list(&ctx, format),
            QueueAction::Flush => commands::cmd_queue_flush(&ctx).await,
        },
        Commands::Recent { limit, format } => commands::cmd_recent(&ctx, limit, format).await,
        Commands::Config { action } => commands::cmd_config(&ctx, action),
        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
