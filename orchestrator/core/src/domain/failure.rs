// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Failure Taxonomy
//!
//! Classification shared by the controller, session service and swarm
//! coordinator. Component-level errors (`RuntimeError`, `ThinkerError`,
//! `EventLogError`) map onto a [`FailureKind`] when they end a session.
//!
//! | Kind | Scope | Terminal |
//! |------|-------|----------|
//! | `TransientInfra` | thinker / runtime | only once retries are exhausted |
//! | `ActionRejected` | action | never (fed back to the thinker) |
//! | `ExecutionTimeout`, `EnvironmentUnavailable` | runtime | by policy |
//! | `BudgetExhausted`, `LoopDetected` | session | always |
//! | `ClosedLog` | programming error | always |

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::events::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientInfra,
    ActionRejected,
    ExecutionTimeout,
    EnvironmentUnavailable,
    BudgetExhausted,
    LoopDetected,
    ClosedLog,
    /// The thinker gave up on the goal.
    ThinkerTerminated,
    Cancelled,
    /// The control loop died unexpectedly (panic or forced abort).
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientInfra => "transient_infra",
            FailureKind::ActionRejected => "action_rejected",
            FailureKind::ExecutionTimeout => "execution_timeout",
            FailureKind::EnvironmentUnavailable => "environment_unavailable",
            FailureKind::BudgetExhausted => "budget_exhausted",
            FailureKind::LoopDetected => "loop_detected",
            FailureKind::ClosedLog => "closed_log",
            FailureKind::ThinkerTerminated => "thinker_terminated",
            FailureKind::Cancelled => "cancelled",
            FailureKind::Internal => "internal",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended in a non-successful terminal state, with the tail of
/// its event log for context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFailure {
    pub kind: FailureKind,
    pub reason: String,
    pub recent_events: Vec<Event>,
}

impl SessionFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            recent_events: Vec::new(),
        }
    }

    pub fn with_context(mut self, recent_events: Vec<Event>) -> Self {
        self.recent_events = recent_events;
        self
    }
}

impl fmt::Display for SessionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}
