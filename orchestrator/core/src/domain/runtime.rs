// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Runtime Contract
//!
//! A runtime executes one action at a time against an isolated execution
//! environment owned by a single session. Backends (local process, Docker,
//! remote executor) live in `crate::infrastructure::runtime` and are chosen
//! by configuration.
//!
//! ## Failure modes
//! | Error | Meaning | Controller policy |
//! |-------|---------|-------------------|
//! | `ActionRejected` | malformed / disallowed action | observation, loop back to thinking |
//! | `ExecutionTimeout` | action exceeded its budget | observation, optional `reset()` |
//! | `EnvironmentUnavailable` | sandbox crashed or reclaimed | `reset()` if reconnects remain, else fail |
//! | `Transient` | backend temporarily unreachable | retried with backoff |
//!
//! Backends that enforce their own timeout report it as an
//! [`ObservationKind::Error`](crate::domain::events::ObservationKind) with
//! `ObservationErrorKind::Timeout` rather than hanging the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::domain::events::{Action, Observation, SessionId};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuntimeError {
    #[error("Action rejected: {0}")]
    ActionRejected(String),

    #[error("Execution timed out: {0}")]
    ExecutionTimeout(String),

    #[error("Environment unavailable: {0}")]
    EnvironmentUnavailable(String),

    #[error("Transient runtime failure: {0}")]
    Transient(String),
}

/// Which kind of backend a runtime instance is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    Process,
    Docker,
    Remote,
    /// Test doubles and embedder-provided runtimes.
    Custom,
}

impl fmt::Display for RuntimeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RuntimeKind::Process => "process",
            RuntimeKind::Docker => "docker",
            RuntimeKind::Remote => "remote",
            RuntimeKind::Custom => "custom",
        };
        f.write_str(name)
    }
}

#[async_trait]
pub trait Runtime: Send + Sync {
    /// Execute one action. May block for as long as the action runs.
    async fn execute(&self, action: &Action) -> Result<Observation, RuntimeError>;

    /// Restore a clean environment (fresh workspace / container).
    async fn reset(&self) -> Result<(), RuntimeError>;

    /// Release the environment. Must be idempotent; called on every session
    /// end, including abnormal ones.
    async fn dispose(&self) -> Result<(), RuntimeError>;

    fn kind(&self) -> RuntimeKind;
}

/// Creates one runtime per session. Runtimes are never shared across sessions.
#[async_trait]
pub trait RuntimeFactory: Send + Sync {
    async fn create(&self, session_id: SessionId) -> Result<Box<dyn Runtime>, RuntimeError>;
}
