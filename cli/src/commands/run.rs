// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Run a single session to completion.
//!
//! Questions from `ask_user` actions are read from stdin. Ctrl-C records a
//! cancel request and waits for the session to wind down.

use anyhow::{Context, Result};
use clap::Args;
use colored::Colorize;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::warn;

use conductor_core::application::{SessionHandle, SessionService};
use conductor_core::domain::config::ConductorConfig;
use conductor_core::domain::event_log::EventSubscription;

use crate::context::{load_script, AppContext};
use crate::render::{describe_event, describe_report};

#[derive(Args)]
pub struct RunArgs {
    /// What the agent should accomplish
    #[arg(short, long)]
    pub goal: String,

    /// Decision script (YAML) that drives the session
    #[arg(short, long, value_name = "FILE")]
    pub script: PathBuf,

    /// Stream events as they are appended
    #[arg(short, long)]
    pub follow: bool,

    /// Override the configured step budget
    #[arg(long)]
    pub max_steps: Option<u32>,

    /// Print the final report as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn execute(args: RunArgs, config: ConductorConfig) -> Result<()> {
    let context = AppContext::new(config)?;
    let thinker = load_script(&args.script)?;
    let service = context.session_service(thinker);

    let handle = match args.max_steps {
        Some(max_steps) => {
            let mut budget = context.config.spec.controller.budget();
            budget.max_steps = max_steps;
            service.start_with_budget(&args.goal, budget).await?
        }
        None => service.start_session(&args.goal).await?,
    };
    eprintln!("{} {}", "Session started:".bold(), handle.id());

    let follower = args.follow.then(|| tokio::spawn(follow(handle.subscribe())));
    let questions = tokio::spawn(answer_questions(handle.clone()));

    let report = tokio::select! {
        report = handle.wait() => report,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("{}", "Interrupted, cancelling session...".yellow());
            handle.cancel(Some("interrupted by user".to_string())).await?;
            handle.wait().await
        }
    };
    questions.abort();
    if let Some(follower) = follower {
        follower.await.context("Event follower failed")?;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", describe_report(&report));
    }

    if !report.is_success() {
        anyhow::bail!("Session {} ended {}", report.session_id, report.status);
    }
    Ok(())
}

/// Print every event until the log closes.
pub async fn follow(mut events: EventSubscription) {
    while let Some(event) = events.next().await {
        match event {
            Ok(event) => println!("{}", describe_event(&event)),
            Err(e) => {
                warn!(error = %e, "Event stream ended early");
                break;
            }
        }
    }
}

async fn answer_questions(handle: SessionHandle) -> Result<()> {
    let mut status = handle.watch_status();
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let question = {
            let snapshot = status
                .wait_for(|s| s.pending_question.is_some() || s.status.is_terminal())
                .await?;
            match &snapshot.pending_question {
                Some(pending) => pending.question.clone(),
                None => return Ok(()),
            }
        };

        eprintln!("{} {}", "?".yellow().bold(), question);
        let Some(answer) = stdin.next_line().await? else {
            return Ok(());
        };
        handle.respond(answer).await?;
        status.wait_for(|s| s.pending_question.is_none()).await?;
    }
}
