// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Events
//!
//! The immutable records that make up a session's history: actions issued by
//! the agent, observations returned by the runtime, error records, and control
//! signals such as cancellation.
//!
//! An [`Event`]'s `kind` is always derived from its payload; there is no way
//! to construct an event whose kind and payload disagree.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::domain::failure::FailureKind;

/// Unique identifier for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates an [`Observation`] with the [`Action`] that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ActionId(pub Uuid);

impl ActionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ActionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of an event within its session log. The first event is `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SequenceId(pub u64);

impl SequenceId {
    pub const ZERO: SequenceId = SequenceId(0);

    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SequenceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Action,
    Observation,
    Error,
    ControlSignal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Agent,
    Runtime,
    System,
    User,
}

/// A single entry in a session's event log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub sequence_id: SequenceId,
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub source: EventSource,
    pub payload: EventPayload,
}

impl Event {
    /// Builds an event stamped with the current time. Only the event log
    /// assigns sequence ids, so this is crate-private.
    pub(crate) fn new(
        session_id: SessionId,
        sequence_id: SequenceId,
        source: EventSource,
        payload: EventPayload,
    ) -> Self {
        Self {
            sequence_id,
            session_id,
            timestamp: Utc::now(),
            kind: payload.kind(),
            source,
            payload,
        }
    }

    pub fn as_action(&self) -> Option<&Action> {
        match &self.payload {
            EventPayload::Action(action) => Some(action),
            _ => None,
        }
    }

    pub fn as_observation(&self) -> Option<&Observation> {
        match &self.payload {
            EventPayload::Observation(observation) => Some(observation),
            _ => None,
        }
    }

    pub fn is_cancel_signal(&self) -> bool {
        matches!(self.payload, EventPayload::Control(ControlSignal::Cancel { .. }))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Action(Action),
    Observation(Observation),
    Error(ErrorRecord),
    Control(ControlSignal),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Action(_) => EventKind::Action,
            EventPayload::Observation(_) => EventKind::Observation,
            EventPayload::Error(_) => EventKind::Error,
            EventPayload::Control(_) => EventKind::ControlSignal,
        }
    }
}

/// A typed request issued by the agent's reasoning step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub action_id: ActionId,
    pub kind: ActionKind,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            action_id: ActionId::new(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ActionKind {
    RunCommand {
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    EditFile {
        path: String,
        edit: FileEdit,
    },
    ReadFile {
        path: String,
        /// 1-based, inclusive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_line: Option<usize>,
        /// 1-based, inclusive.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        end_line: Option<usize>,
    },
    Browse {
        url: String,
    },
    FinishTask {
        #[serde(default)]
        summary: String,
    },
    AskUser {
        question: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum FileEdit {
    /// Replace the whole file, creating it (and missing parents) if needed.
    Overwrite { content: String },
    /// Replace the single exact occurrence of `old` with `new`.
    Replace { old: String, new: String },
}

impl ActionKind {
    /// Short label used in logs and metrics.
    pub fn name(&self) -> &'static str {
        match self {
            ActionKind::RunCommand { .. } => "run_command",
            ActionKind::EditFile { .. } => "edit_file",
            ActionKind::ReadFile { .. } => "read_file",
            ActionKind::Browse { .. } => "browse",
            ActionKind::FinishTask { .. } => "finish_task",
            ActionKind::AskUser { .. } => "ask_user",
        }
    }

    /// Actions the controller resolves itself instead of dispatching to a runtime.
    pub fn is_control(&self) -> bool {
        matches!(self, ActionKind::FinishTask { .. } | ActionKind::AskUser { .. })
    }

    /// Structural validation. A failure here is an `ActionRejected` fed back to the thinker.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            ActionKind::RunCommand { command, .. } => {
                if command.trim().is_empty() {
                    return Err("run_command requires a non-empty command".to_string());
                }
            }
            ActionKind::EditFile { path, edit } => {
                validate_path(path)?;
                if let FileEdit::Replace { old, .. } = edit {
                    if old.is_empty() {
                        return Err("edit_file replace requires a non-empty `old` string".to_string());
                    }
                }
            }
            ActionKind::ReadFile {
                path,
                start_line,
                end_line,
            } => {
                validate_path(path)?;
                if let (Some(start), Some(end)) = (start_line, end_line) {
                    if start > end {
                        return Err(format!(
                            "read_file range is inverted: start_line {} > end_line {}",
                            start, end
                        ));
                    }
                }
                if *start_line == Some(0) || *end_line == Some(0) {
                    return Err("read_file line numbers are 1-based".to_string());
                }
            }
            ActionKind::Browse { url } => {
                let parsed = url::Url::parse(url).map_err(|e| format!("invalid url '{}': {}", url, e))?;
                if !matches!(parsed.scheme(), "http" | "https") {
                    return Err(format!("unsupported url scheme '{}'", parsed.scheme()));
                }
            }
            ActionKind::FinishTask { .. } => {}
            ActionKind::AskUser { question } => {
                if question.trim().is_empty() {
                    return Err("ask_user requires a question".to_string());
                }
            }
        }
        Ok(())
    }
}

fn validate_path(path: &str) -> Result<(), String> {
    if path.trim().is_empty() {
        return Err("path must not be empty".to_string());
    }
    if path.contains('\0') {
        return Err("path contains a null byte".to_string());
    }
    Ok(())
}

/// The typed result of executing an [`Action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub action_id: ActionId,
    pub kind: ObservationKind,
}

impl Observation {
    pub fn new(action_id: ActionId, kind: ObservationKind) -> Self {
        Self { action_id, kind }
    }

    pub fn error(action_id: ActionId, error: ObservationErrorKind, message: impl Into<String>) -> Self {
        Self {
            action_id,
            kind: ObservationKind::Error {
                error,
                message: message.into(),
            },
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.kind, ObservationKind::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "observation", rename_all = "snake_case")]
pub enum ObservationKind {
    CommandResult {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
    FileContent {
        path: String,
        content: String,
    },
    FileEdited {
        path: String,
        bytes_written: u64,
    },
    BrowseResult {
        url: String,
        status: u16,
        content: String,
    },
    UserResponse {
        text: String,
    },
    Acknowledged {
        summary: String,
    },
    Error {
        error: ObservationErrorKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationErrorKind {
    /// The action was malformed or disallowed.
    Rejected,
    /// The action exceeded its wall-clock budget.
    Timeout,
    /// The execution environment was lost.
    Unavailable,
    /// The action was dispatched but never resolved before cancellation.
    Abandoned,
    /// The action ran but the backend reported a failure.
    Failed,
}

/// Error entries that are not tied to a runtime observation, e.g. malformed
/// thinker output or a thinker timeout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub kind: FailureKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ActionKind>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum ControlSignal {
    Cancel {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}
