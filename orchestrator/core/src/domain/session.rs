// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Aggregate
//!
//! A session binds one goal to exactly one event log and one runtime for its
//! whole lifetime. The controller drives it; the session service
//! (`crate::application::session`) owns spawning, cancellation and cleanup.
//!
//! ## Lifecycle
//! ```text
//! Created ──► Running ◄──► AwaitingInput
//!    │           │               │
//!    └───────────┴───────┬───────┘
//!                        ▼
//!          Finished | Failed | Cancelled
//! ```
//! Terminal states are final.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::domain::controller::ControllerState;
use crate::domain::event_log::EventLog;
use crate::domain::events::{ActionId, SessionId};
use crate::domain::failure::SessionFailure;
use crate::domain::runtime::Runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Created,
    Running,
    AwaitingInput,
    Finished,
    Failed,
    Cancelled,
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Finished | SessionStatus::Failed | SessionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Created => "created",
            SessionStatus::Running => "running",
            SessionStatus::AwaitingInput => "awaiting_input",
            SessionStatus::Finished => "finished",
            SessionStatus::Failed => "failed",
            SessionStatus::Cancelled => "cancelled",
        }
    }

    fn can_transition_to(&self, to: SessionStatus) -> bool {
        use SessionStatus::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Finished | Failed | Cancelled) => true,
            (Created, Running) => true,
            (Running, AwaitingInput) | (AwaitingInput, Running) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-session resource limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Maximum number of actions dispatched before the session fails.
    pub max_steps: u32,
    #[serde(with = "humantime_serde")]
    pub max_wall_time: Duration,
}

impl Default for Budget {
    fn default() -> Self {
        Self {
            max_steps: 50,
            max_wall_time: Duration::from_secs(30 * 60),
        }
    }
}

/// A question posed by `AskUser` that has not been answered yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingQuestion {
    pub action_id: ActionId,
    pub question: String,
}

/// Point-in-time view of a running session, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub state: ControllerState,
    pub step_count: u32,
    pub pending_question: Option<PendingQuestion>,
}

impl SessionSnapshot {
    pub fn created() -> Self {
        Self {
            status: SessionStatus::Created,
            state: ControllerState::Idle,
            step_count: 0,
            pending_question: None,
        }
    }
}

/// Final outcome of a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionReport {
    pub session_id: SessionId,
    pub goal: String,
    pub status: SessionStatus,
    pub step_count: u32,
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<SessionFailure>,
}

impl SessionReport {
    pub fn is_success(&self) -> bool {
        self.status == SessionStatus::Finished
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: SessionStatus, to: SessionStatus },

    #[error("Session {0} is not running")]
    NotRunning(SessionId),
}

pub struct Session {
    pub id: SessionId,
    pub goal: String,
    pub budget: Budget,
    status: SessionStatus,
    step_count: u32,
    pub created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    log: Arc<EventLog>,
    runtime: Arc<dyn Runtime>,
}

impl Session {
    /// The session takes its id from the log it owns.
    pub fn new(goal: impl Into<String>, budget: Budget, log: Arc<EventLog>, runtime: Arc<dyn Runtime>) -> Self {
        Self {
            id: log.session_id(),
            goal: goal.into(),
            budget,
            status: SessionStatus::Created,
            step_count: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            log,
            runtime,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn step_count(&self) -> u32 {
        self.step_count
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn runtime(&self) -> &Arc<dyn Runtime> {
        &self.runtime
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.ended_at
    }

    pub fn transition(&mut self, to: SessionStatus) -> Result<(), SessionError> {
        if self.status == to {
            return Ok(());
        }
        if !self.status.can_transition_to(to) {
            return Err(SessionError::InvalidTransition { from: self.status, to });
        }
        match to {
            SessionStatus::Running if self.started_at.is_none() => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.ended_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    /// Count one dispatched action and return the new total.
    pub fn record_step(&mut self) -> Result<u32, SessionError> {
        if self.status != SessionStatus::Running {
            return Err(SessionError::NotRunning(self.id));
        }
        self.step_count += 1;
        Ok(self.step_count)
    }

    pub fn steps_exhausted(&self) -> bool {
        self.step_count >= self.budget.max_steps
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("goal", &self.goal)
            .field("status", &self.status)
            .field("step_count", &self.step_count)
            .field("runtime", &self.runtime.kind())
            .finish()
    }
}
