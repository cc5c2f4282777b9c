//! usbwatch CLI
//!
//! Lists attached USB devices and prints attach/detach events as they happen.

use clap::Parser;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::EnvFilter;

// CLI definitions
mod cli;
use cli::{Cli, Commands};

// Command handlers
mod commands;

mod config;
use config::AppConfig;

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let config_path = cli.config.clone().unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load(&config_path)?;
    if let Some(ms) = cli.poll_interval {
        config.monitor.poll_interval = Duration::from_millis(ms);
    }
    debug!("Using config from {}", config_path.display());

    match cli.command {
        Commands::List { filter, json } => {
            commands::list::run(&config, filter.to_filter(), json)?;
        }
        Commands::Monitor {
            filter,
            topic,
            json,
            no_initial,
        } => {
            let selection = commands::monitor::EventSelection {
                filter: filter.to_filter(),
                topics: topic,
            };
            commands::monitor::run(&config, selection, json, !no_initial)?;
        }
        Commands::Config { init, force } => {
            commands::config::run(&config_path, &config, init, force)?;
        }
    }

    Ok(())
}

/// Log to stderr so stdout stays machine-readable; RUST_LOG adds directives
fn init_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("usbwatch={level}").parse()?)
        .add_directive(format!("usbwatch_core={level}").parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}
