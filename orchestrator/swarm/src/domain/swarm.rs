// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Task Aggregate
//!
//! A [`SwarmTask`] is one overarching goal split into ordered [`Subtask`]s,
//! each driven by its own session. The task only refers to sessions by
//! [`SessionId`]; the coordinator's registry owns the handles.
//!
//! # Invariants
//!
//! - A subtask gets an `assigned_session_id` exactly when it leaves `Queued`
//!   for `Running`. A subtask cancelled while queued never gets one.
//! - `aggregation_state` becomes `Complete` only once every subtask is terminal.
//! - The outcome is `Success` only if every subtask `Finished`.

use chrono::{DateTime, Utc};
use conductor_core::domain::events::SessionId;
use conductor_core::domain::failure::FailureKind;
use conductor_core::domain::session::{SessionReport, SessionStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a [`SwarmTask`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SwarmTaskId(pub Uuid);

impl SwarmTaskId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SwarmTaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SwarmTaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SubtaskState {
    Queued,
    Running,
    Finished,
    Failed { kind: FailureKind, reason: String },
    Cancelled,
}

impl SubtaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskState::Finished | SubtaskState::Failed { .. } | SubtaskState::Cancelled
        )
    }

    /// Terminal state for a session that ended with `report`.
    pub fn from_report(report: &SessionReport) -> Self {
        match report.status {
            SessionStatus::Finished => SubtaskState::Finished,
            SessionStatus::Cancelled => SubtaskState::Cancelled,
            status => {
                let (kind, reason) = match &report.failure {
                    Some(failure) => (failure.kind, failure.reason.clone()),
                    None => (FailureKind::Internal, format!("session ended in state {}", status)),
                };
                SubtaskState::Failed { kind, reason }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subtask {
    pub index: usize,
    pub description: String,
    /// Set when the subtask is admitted and its session created.
    pub assigned_session_id: Option<SessionId>,
    pub state: SubtaskState,
}

/// One failed (or cancelled) subtask in a [`SwarmOutcome::PartialFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskFailure {
    pub index: usize,
    pub description: String,
    pub session_id: Option<SessionId>,
    pub kind: FailureKind,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwarmOutcome {
    Success,
    PartialFailure { failures: Vec<SubtaskFailure> },
}

impl SwarmOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SwarmOutcome::Success)
    }

    pub fn failures(&self) -> &[SubtaskFailure] {
        match self {
            SwarmOutcome::Success => &[],
            SwarmOutcome::PartialFailure { failures } => failures,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregation", rename_all = "snake_case")]
pub enum AggregationState {
    Pending,
    Running,
    Complete(SwarmOutcome),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwarmTask {
    pub id: SwarmTaskId,
    pub parent_goal: String,
    pub concurrency_limit: usize,
    pub subtasks: Vec<Subtask>,
    pub aggregation_state: AggregationState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SwarmTask {
    pub fn new(parent_goal: impl Into<String>, descriptions: Vec<String>, concurrency_limit: usize) -> Self {
        let subtasks = descriptions
            .into_iter()
            .enumerate()
            .map(|(index, description)| Subtask {
                index,
                description,
                assigned_session_id: None,
                state: SubtaskState::Queued,
            })
            .collect();
        Self {
            id: SwarmTaskId::new(),
            parent_goal: parent_goal.into(),
            concurrency_limit,
            subtasks,
            aggregation_state: AggregationState::Pending,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.aggregation_state, AggregationState::Complete(_))
    }

    pub fn outcome(&self) -> Option<&SwarmOutcome> {
        match &self.aggregation_state {
            AggregationState::Complete(outcome) => Some(outcome),
            _ => None,
        }
    }

    pub fn running_count(&self) -> usize {
        self.count(|state| matches!(state, SubtaskState::Running))
    }

    pub fn queued_count(&self) -> usize {
        self.count(|state| matches!(state, SubtaskState::Queued))
    }

    pub fn finished_count(&self) -> usize {
        self.count(|state| matches!(state, SubtaskState::Finished))
    }

    fn count(&self, predicate: impl Fn(&SubtaskState) -> bool) -> usize {
        self.subtasks.iter().filter(|s| predicate(&s.state)).count()
    }

    /// Assign a session to a queued subtask. Returns `false`, changing
    /// nothing, if the subtask is no longer queued.
    pub fn mark_running(&mut self, index: usize, session_id: SessionId) -> bool {
        let Some(subtask) = self.subtasks.get_mut(index) else {
            return false;
        };
        if subtask.state != SubtaskState::Queued {
            return false;
        }
        subtask.assigned_session_id = Some(session_id);
        subtask.state = SubtaskState::Running;
        if self.aggregation_state == AggregationState::Pending {
            self.aggregation_state = AggregationState::Running;
        }
        true
    }

    /// Record a terminal state. Already terminal subtasks are left alone.
    pub fn mark_terminal(&mut self, index: usize, state: SubtaskState) {
        if let Some(subtask) = self.subtasks.get_mut(index) {
            if !subtask.state.is_terminal() {
                subtask.state = state;
            }
        }
    }

    /// Cancel one subtask if it is still queued.
    pub fn cancel_subtask(&mut self, index: usize) -> bool {
        match self.subtasks.get_mut(index) {
            Some(subtask) if subtask.state == SubtaskState::Queued => {
                subtask.state = SubtaskState::Cancelled;
                true
            }
            _ => false,
        }
    }

    /// Cancel every subtask that was never admitted. Returns their indices.
    pub fn cancel_queued(&mut self) -> Vec<usize> {
        self.subtasks
            .iter_mut()
            .filter(|s| s.state == SubtaskState::Queued)
            .map(|s| {
                s.state = SubtaskState::Cancelled;
                s.index
            })
            .collect()
    }

    /// Compute the outcome and mark the task complete.
    ///
    /// Returns `None` while any subtask is still queued or running.
    pub fn aggregate(&mut self) -> Option<SwarmOutcome> {
        if let Some(outcome) = self.outcome() {
            return Some(outcome.clone());
        }
        if !self.subtasks.iter().all(|s| s.state.is_terminal()) {
            return None;
        }

        let failures: Vec<SubtaskFailure> = self
            .subtasks
            .iter()
            .filter_map(|s| {
                let (kind, reason) = match &s.state {
                    SubtaskState::Finished => return None,
                    SubtaskState::Failed { kind, reason } => (*kind, reason.clone()),
                    _ => (FailureKind::Cancelled, "subtask was cancelled".to_string()),
                };
                Some(SubtaskFailure {
                    index: s.index,
                    description: s.description.clone(),
                    session_id: s.assigned_session_id,
                    kind,
                    reason,
                })
            })
            .collect();

        let outcome = if failures.is_empty() {
            SwarmOutcome::Success
        } else {
            SwarmOutcome::PartialFailure { failures }
        };
        self.aggregation_state = AggregationState::Complete(outcome.clone());
        self.completed_at = Some(Utc::now());
        Some(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(n: usize) -> SwarmTask {
        SwarmTask::new("goal", (0..n).map(|i| format!("part {}", i)).collect(), 2)
    }

    #[test]
    fn test_new_task_is_pending_and_queued() {
        let task = task(3);
        assert_eq!(task.aggregation_state, AggregationState::Pending);
        assert_eq!(task.queued_count(), 3);
        assert!(task.subtasks.iter().all(|s| s.assigned_session_id.is_none()));
        assert_eq!(task.subtasks[2].index, 2);
    }

    #[test]
    fn test_aggregate_waits_for_all_subtasks() {
        let mut task = task(2);
        task.mark_running(0, SessionId::new());
        task.mark_terminal(0, SubtaskState::Finished);
        assert_eq!(task.aggregation_state, AggregationState::Running);
        assert_eq!(task.aggregate(), None);
        assert!(!task.is_complete());
    }

    #[test]
    fn test_all_finished_is_success() {
        let mut task = task(2);
        for i in 0..2 {
            task.mark_running(i, SessionId::new());
            task.mark_terminal(i, SubtaskState::Finished);
        }
        assert_eq!(task.aggregate(), Some(SwarmOutcome::Success));
        assert!(task.completed_at.is_some());
    }

    #[test]
    fn test_partial_failure_names_failed_and_cancelled() {
        let mut task = task(3);
        let failed_session = SessionId::new();
        task.mark_running(0, SessionId::new());
        task.mark_terminal(0, SubtaskState::Finished);
        task.mark_running(1, failed_session);
        task.mark_terminal(
            1,
            SubtaskState::Failed {
                kind: FailureKind::BudgetExhausted,
                reason: "step budget exhausted".to_string(),
            },
        );
        assert_eq!(task.cancel_queued(), vec![2]);

        let outcome = task.aggregate().unwrap();
        let failures = outcome.failures();
        assert_eq!(failures.len(), 2);
        assert_eq!(failures[0].index, 1);
        assert_eq!(failures[0].session_id, Some(failed_session));
        assert_eq!(failures[0].kind, FailureKind::BudgetExhausted);
        assert_eq!(failures[1].index, 2);
        assert_eq!(failures[1].session_id, None);
        assert_eq!(failures[1].kind, FailureKind::Cancelled);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut task = task(1);
        task.mark_running(0, SessionId::new());
        task.mark_terminal(0, SubtaskState::Finished);
        task.mark_terminal(0, SubtaskState::Cancelled);
        assert_eq!(task.subtasks[0].state, SubtaskState::Finished);
    }

    #[test]
    fn test_cancelled_subtask_cannot_start() {
        let mut task = task(2);
        assert_eq!(task.cancel_queued(), vec![0, 1]);
        assert!(!task.mark_running(0, SessionId::new()));
        assert_eq!(task.subtasks[0].state, SubtaskState::Cancelled);
        assert!(task.subtasks[0].assigned_session_id.is_none());
        assert_eq!(task.aggregation_state, AggregationState::Pending);

        let mut task = self::task(1);
        assert!(task.mark_running(0, SessionId::new()));
        assert!(!task.cancel_subtask(0));
        assert!(!task.mark_running(0, SessionId::new()));
    }

    #[test]
    fn test_state_from_report() {
        let report = SessionReport {
            session_id: SessionId::new(),
            goal: "g".to_string(),
            status: SessionStatus::Failed,
            step_count: 3,
            elapsed: std::time::Duration::from_secs(1),
            failure: Some(conductor_core::domain::failure::SessionFailure::new(
                FailureKind::LoopDetected,
                "same action repeated",
            )),
        };
        assert_eq!(
            SubtaskState::from_report(&report),
            SubtaskState::Failed {
                kind: FailureKind::LoopDetected,
                reason: "same action repeated".to_string()
            }
        );
    }

    #[test]
    fn test_outcome_serialises_tagged() {
        let json = serde_json::to_value(SwarmOutcome::Success).unwrap();
        assert_eq!(json["outcome"], "success");
    }
}
