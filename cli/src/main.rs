// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Conductor CLI
//!
//! The `conductor` binary runs agent sessions against the configured runtime
//! backend, driven by a decision script.
//!
//! ## Commands
//!
//! - `conductor run --goal .. --script ..` - Run one session
//! - `conductor swarm --goal .. --script ..` - Run one session per planned subtask
//! - `conductor config show|validate|generate` - Configuration management

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;

use conductor_cli::commands::{self, ConfigCommand, RunArgs, SwarmArgs};
use conductor_cli::context::load_config;
use conductor_cli::telemetry::{init_logging, init_metrics};

/// Conductor - event-sourced agent sessions
#[derive(Parser)]
#[command(name = "conductor")]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to configuration file (overrides discovery)
    #[arg(short, long, global = true, env = "CONDUCTOR_CONFIG_PATH", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); defaults to the configured level
    #[arg(long, global = true, env = "CONDUCTOR_LOG_LEVEL")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single session
    #[command(name = "run")]
    Run(RunArgs),

    /// Split a goal into subtasks and run them as a swarm
    #[command(name = "swarm")]
    Swarm(SwarmArgs),

    /// Configuration management
    #[command(name = "config")]
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Config { command }) => {
            init_logging(&Default::default(), Some(cli.log_level.as_deref().unwrap_or("warn")))?;
            commands::config::handle_command(command, cli.config).await
        }
        Some(Commands::Run(args)) => {
            let config = load_config(cli.config)?;
            init_logging(&config.spec.observability.logging, cli.log_level.as_deref())?;
            init_metrics(&config.spec.observability.metrics)?;
            commands::run::execute(args, config).await
        }
        Some(Commands::Swarm(args)) => {
            let config = load_config(cli.config)?;
            init_logging(&config.spec.observability.logging, cli.log_level.as_deref())?;
            init_metrics(&config.spec.observability.metrics)?;
            commands::swarm::execute(args, config).await
        }
        None => {
            // No command provided - show help
            eprintln!("{}", "No command specified. Use --help for usage.".yellow());
            std::process::exit(1);
        }
    }
}
