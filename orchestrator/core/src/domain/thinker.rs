// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Reasoning Capabilities (Anti-Corruption Layer)
//!
//! The controller and the swarm coordinator depend on two external
//! capabilities, each with a single entry point:
//!
//! - [`Thinker::decide`]: given the session history, choose the next action
//!   or terminate.
//! - [`Planner::plan`]: split a goal into ordered subtask descriptions.
//!
//! Implementations are interchangeable strategies (LLM-backed, scripted,
//! human-in-the-loop). `decide` must be safe to retry: the chosen action is
//! only committed to the event log after the thinker returns.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::events::{ActionKind, Event, SessionId};

/// Input to a single `decide` call.
#[derive(Debug, Clone)]
pub struct ThinkingContext<'a> {
    pub session_id: SessionId,
    pub goal: &'a str,
    /// Ordered history, already windowed by [`HistoryWindow`].
    pub history: &'a [Event],
    /// Attempt number for this step, starting at 1. Retries after transient
    /// failures reuse the same history.
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum Decision {
    Act { action: ActionKind },
    Terminate { signal: TerminationSignal },
}

impl Decision {
    pub fn act(action: ActionKind) -> Self {
        Decision::Act { action }
    }

    pub fn finish(reason: impl Into<String>) -> Self {
        Decision::Terminate {
            signal: TerminationSignal {
                outcome: TerminationOutcome::Success,
                reason: reason.into(),
            },
        }
    }

    pub fn give_up(reason: impl Into<String>) -> Self {
        Decision::Terminate {
            signal: TerminationSignal {
                outcome: TerminationOutcome::GiveUp,
                reason: reason.into(),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminationSignal {
    pub outcome: TerminationOutcome,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationOutcome {
    Success,
    GiveUp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ThinkerError {
    /// Temporarily unreachable; retried with backoff.
    #[error("Thinker unavailable: {0}")]
    Unavailable(String),

    /// The response could not be turned into an action.
    #[error("Malformed thinker output: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Thinker: Send + Sync {
    async fn decide(&self, context: ThinkingContext<'_>) -> Result<Decision, ThinkerError>;

    /// Called once when `session_id` has ended, however it ended. Drop any
    /// per-session state here.
    fn end_session(&self, _session_id: SessionId) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlannerError {
    #[error("Planner unavailable: {0}")]
    Unavailable(String),

    #[error("Goal could not be planned: {0}")]
    Unplannable(String),
}

#[async_trait]
pub trait Planner: Send + Sync {
    /// Ordered subtask descriptions for `goal`. Invoked once per swarm task.
    async fn plan(&self, goal: &str) -> Result<Vec<String>, PlannerError>;
}

/// How much history the thinker sees per call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryWindow {
    /// Keep only the most recent `max_events`; `None` passes the full history.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<usize>,
}

impl HistoryWindow {
    pub fn apply<'a>(&self, history: &'a [Event]) -> &'a [Event] {
        match self.max_events {
            Some(max) if history.len() > max => &history[history.len() - max..],
            _ => history,
        }
    }
}
