// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Process-level notifications about sessions and swarm tasks.
//!
//! These are published on the best-effort `EventBus` for live displays and
//! metrics. They are not part of any session's event log and carry no
//! ordering or delivery guarantee.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::controller::ControllerState;
use crate::domain::events::{ActionId, SessionId};
use crate::domain::failure::FailureKind;
use crate::domain::session::SessionStatus;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionLifecycleEvent {
    StateChanged {
        session_id: SessionId,
        from: ControllerState,
        to: ControllerState,
        changed_at: DateTime<Utc>,
    },
    ActionDispatched {
        session_id: SessionId,
        action_id: ActionId,
        action: String,
        dispatched_at: DateTime<Utc>,
    },
    SessionEnded {
        session_id: SessionId,
        status: SessionStatus,
        step_count: u32,
        failure_kind: Option<FailureKind>,
        reason: Option<String>,
        ended_at: DateTime<Utc>,
    },
}

impl SessionLifecycleEvent {
    pub fn session_id(&self) -> SessionId {
        match self {
            SessionLifecycleEvent::StateChanged { session_id, .. }
            | SessionLifecycleEvent::ActionDispatched { session_id, .. }
            | SessionLifecycleEvent::SessionEnded { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SwarmEvent {
    TaskDispatched {
        swarm_task_id: Uuid,
        goal: String,
        subtask_count: usize,
        concurrency_limit: usize,
        dispatched_at: DateTime<Utc>,
    },
    SubtaskStarted {
        swarm_task_id: Uuid,
        index: usize,
        session_id: SessionId,
    },
    SubtaskCompleted {
        swarm_task_id: Uuid,
        index: usize,
        session_id: Option<SessionId>,
        status: SessionStatus,
    },
    TaskCompleted {
        swarm_task_id: Uuid,
        succeeded: usize,
        failed: usize,
        completed_at: DateTime<Utc>,
    },
    CancellationRequested {
        swarm_task_id: Uuid,
        requested_at: DateTime<Utc>,
    },
}

impl SwarmEvent {
    pub fn swarm_task_id(&self) -> Uuid {
        match self {
            SwarmEvent::TaskDispatched { swarm_task_id, .. }
            | SwarmEvent::SubtaskStarted { swarm_task_id, .. }
            | SwarmEvent::SubtaskCompleted { swarm_task_id, .. }
            | SwarmEvent::TaskCompleted { swarm_task_id, .. }
            | SwarmEvent::CancellationRequested { swarm_task_id, .. } => *swarm_task_id,
        }
    }
}
