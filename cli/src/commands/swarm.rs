// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run a goal as a swarm of sessions, one per planned subtask.

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;

use conductor_core::domain::config::ConductorConfig;
use conductor_core::domain::thinker::Planner;
use conductor_core::infrastructure::{LinePlanner, StaticPlanner};
use conductor_swarm::{SubtaskState, SwarmTask};

use crate::context::{load_script, AppContext};
use crate::render::{describe_swarm, subtask_label};

#[derive(Args)]
pub struct SwarmArgs {
    /// Overall goal; without --subtask, each non-empty line becomes a subtask
    #[arg(short, long)]
    pub goal: String,

    /// Decision script (YAML) replayed by every subtask session
    #[arg(short, long, value_name = "FILE")]
    pub script: PathBuf,

    /// Sessions allowed to run at once (default: spec.swarm.default_concurrency)
    #[arg(short = 'n', long)]
    pub concurrency: Option<usize>,

    /// Explicit subtask description (repeatable)
    #[arg(long = "subtask", value_name = "TEXT")]
    pub subtasks: Vec<String>,

    /// Print the final task as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: SwarmArgs, config: ConductorConfig) -> Result<()> {
    let context = AppContext::new(config)?;
    let thinker = load_script(&args.script)?;
    let planner: Arc<dyn Planner> = if args.subtasks.is_empty() {
        Arc::new(LinePlanner::new())
    } else {
        Arc::new(StaticPlanner::new(args.subtasks.clone()))
    };
    let concurrency = args
        .concurrency
        .unwrap_or(context.config.spec.swarm.default_concurrency);

    let coordinator = context.swarm_coordinator(thinker, planner);
    let task = coordinator.dispatch(&args.goal, concurrency).await?;
    eprintln!(
        "{} {} ({} subtasks, concurrency {})",
        "Swarm task dispatched:".bold(),
        task.id,
        task.subtasks.len(),
        concurrency
    );

    let mut progress = coordinator.watch(task.id)?;
    let mut last = task.clone();
    loop {
        tokio::select! {
            changed = progress.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = progress.borrow_and_update().clone();
                print_transitions(&last, &current);
                let complete = current.is_complete();
                last = current;
                if complete {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                eprintln!("{}", "Interrupted, cancelling swarm task...".yellow());
                coordinator.cancel(task.id).await?;
                break;
            }
        }
    }

    let outcome = coordinator.wait(task.id).await?;
    let task = coordinator.reap(task.id)?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&task)?);
    } else {
        println!("{}", describe_swarm(&task));
    }

    if !outcome.is_success() {
        anyhow::bail!(
            "{} of {} subtasks did not finish",
            outcome.failures().len(),
            task.subtasks.len()
        );
    }
    Ok(())
}

fn print_transitions(before: &SwarmTask, after: &SwarmTask) {
    for (old, new) in before.subtasks.iter().zip(&after.subtasks) {
        if old.state != new.state && new.state != SubtaskState::Queued {
            eprintln!("  [{}] {} {}", new.index + 1, subtask_label(&new.state), new.description);
        }
    }
}
