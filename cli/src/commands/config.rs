// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Configuration management commands
//!
//! Commands: show, validate, generate

use anyhow::{Context, Result};
use clap::Subcommand;
use colored::Colorize;
use std::path::PathBuf;

use conductor_core::domain::config::{ConductorConfig, RuntimeBackendConfig};
use conductor_core::domain::repository::StorageBackend;

const ANNOTATED_TEMPLATE: &str = include_str!("../../templates/conductor-config.yaml");

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Show current configuration
    Show {
        /// Show config file paths checked
        #[arg(long)]
        paths: bool,

        /// Print the effective configuration as YAML
        #[arg(long)]
        yaml: bool,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (default: discover)
        #[arg(value_name = "FILE")]
        file: Option<PathBuf>,
    },

    /// Generate sample configuration
    Generate {
        /// Output path (default: ./conductor-config.yaml)
        #[arg(short, long, default_value = "./conductor-config.yaml")]
        output: PathBuf,

        /// Write the annotated template with every option
        #[arg(long)]
        examples: bool,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn handle_command(command: ConfigCommand, config_override: Option<PathBuf>) -> Result<()> {
    match command {
        ConfigCommand::Show { paths, yaml } => show(config_override, paths, yaml).await,
        ConfigCommand::Validate { file } => validate(file.or(config_override)).await,
        ConfigCommand::Generate {
            output,
            examples,
            force,
        } => generate(output, examples, force).await,
    }
}

async fn show(config_override: Option<PathBuf>, show_paths: bool, as_yaml: bool) -> Result<()> {
    let config = ConductorConfig::load_or_default(config_override.clone()).context("Failed to load configuration")?;

    if show_paths {
        println!("{}", "Configuration discovery paths:".bold());
        if let Some(path) = &config_override {
            println!("  1. --config flag: {}", path.display());
        } else {
            println!("  1. --config flag: {}", "(not set)".dimmed());
        }
        println!(
            "  2. CONDUCTOR_CONFIG_PATH: {}",
            std::env::var("CONDUCTOR_CONFIG_PATH")
                .unwrap_or_else(|_| "(not set)".to_string())
                .dimmed()
        );
        println!("  3. ./conductor-config.yaml");
        println!("  4. ~/.conductor/config.yaml");
        println!("  5. /etc/conductor/config.yaml");
        println!();
    }

    if as_yaml {
        print!("{}", serde_yaml::to_string(&config).context("Failed to render configuration")?);
        return Ok(());
    }

    println!("{}", "Current configuration:".bold());
    println!("  Name: {}", config.metadata.name);
    println!();

    let controller = &config.spec.controller;
    println!("{}", "Controller:".bold());
    println!("  Max steps: {}", controller.max_steps);
    println!("  Max wall time: {:?}", controller.max_wall_time);
    println!("  Thinker timeout: {:?}", controller.thinker_timeout);
    println!("  Action timeout: {:?}", controller.action_timeout);
    println!("  Cancel grace: {:?}", controller.cancel_grace);
    println!("  Dispose timeout: {:?}", controller.dispose_timeout);
    println!("  Loop threshold: {}", controller.loop_threshold);
    println!(
        "  History window: {}",
        controller
            .history_window
            .max_events
            .map(|n| format!("last {} events", n))
            .unwrap_or_else(|| "full history".to_string())
    );
    println!();

    println!("{}", "Runtime:".bold());
    match &config.spec.runtime {
        RuntimeBackendConfig::Process(process) => {
            println!("  Backend: process");
            println!("  Shell: {}", process.shell);
            println!(
                "  Workspace root: {}",
                process
                    .workspace_root
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "(system temp)".to_string())
            );
            println!("  Command timeout: {:?}", process.command_timeout);
        }
        RuntimeBackendConfig::Docker(docker) => {
            println!("  Backend: docker");
            println!("  Image: {}", docker.image);
            println!("  Workdir: {}", docker.workdir);
            if let Some(network) = &docker.network_mode {
                println!("  Network: {}", network);
            }
        }
        RuntimeBackendConfig::Remote(remote) => {
            println!("  Backend: remote");
            println!("  Endpoint: {}", remote.endpoint);
            println!(
                "  Auth: {}",
                if remote.auth_token.is_some() { "bearer token" } else { "none" }
            );
        }
    }
    println!();

    println!("{}", "Event log:".bold());
    match &config.spec.event_log {
        StorageBackend::InMemory => println!("  Backend: in-memory"),
        StorageBackend::File { directory } => println!("  Backend: file ({})", directory.display()),
    }
    println!();

    println!("{}", "Swarm:".bold());
    println!("  Max sessions: {}", config.spec.swarm.max_sessions);
    println!("  Default concurrency: {}", config.spec.swarm.default_concurrency);
    println!("  Cancel grace: {:?}", config.spec.swarm.cancel_grace);
    println!();

    let metrics = &config.spec.observability.metrics;
    println!("{}", "Observability:".bold());
    println!(
        "  Logging: {} ({})",
        config.spec.observability.logging.level, config.spec.observability.logging.format
    );
    if metrics.enabled {
        println!("  Metrics: http://{}:{}/metrics", metrics.bind_address, metrics.port);
    } else {
        println!("  Metrics: {}", "disabled".dimmed());
    }

    Ok(())
}

async fn validate(config_path: Option<PathBuf>) -> Result<()> {
    println!("Validating configuration...");

    let config = ConductorConfig::load_or_default(config_path).context("Failed to load configuration")?;

    config.validate().context("Configuration validation failed")?;

    println!("{}", "✓ Configuration is valid".green());

    Ok(())
}

async fn generate(output: PathBuf, with_examples: bool, force: bool) -> Result<()> {
    if output.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let sample = if with_examples {
        ANNOTATED_TEMPLATE.to_string()
    } else {
        serde_yaml::to_string(&ConductorConfig::default()).context("Failed to render default configuration")?
    };

    std::fs::write(&output, sample).with_context(|| format!("Failed to write config to {:?}", output))?;

    println!("{}", format!("✓ Configuration generated: {}", output.display()).green());

    Ok(())
}
