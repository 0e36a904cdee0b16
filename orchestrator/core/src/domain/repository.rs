// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Event Store Interface
//!
//! Persistence contract behind [`crate::domain::event_log::EventLog`]. The
//! domain only needs an append-only, per-session ordered store; concrete
//! backends live in `crate::infrastructure::event_store`.
//!
//! | Implementation | Durability |
//! |----------------|------------|
//! | `InMemoryEventStore` | process lifetime |
//! | `FileEventStore` | JSON lines, synced before acknowledgment |
//!
//! ## Contract
//!
//! - `append` returns only once the event is visible to `read`
//!   (durability-before-acknowledgment).
//! - `read(session, from, limit)` returns events with `sequence_id >= from`
//!   in ascending order, at most `limit` of them.
//! - After a crash, `read` returns exactly the events previously acknowledged.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::domain::events::{Event, SequenceId, SessionId};

/// Storage backend selection for event logs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    InMemory,
    /// One JSON-lines file per session under `directory`.
    File { directory: PathBuf },
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Persist one event. Callers guarantee sequence ids arrive in order.
    async fn append(&self, event: &Event) -> Result<(), StoreError>;

    /// Read up to `limit` events starting at `from` (inclusive).
    async fn read(
        &self,
        session_id: SessionId,
        from: SequenceId,
        limit: usize,
    ) -> Result<Vec<Event>, StoreError>;

    /// Highest acknowledged sequence id, if the session has any events.
    async fn last_sequence(&self, session_id: SessionId) -> Result<Option<SequenceId>, StoreError>;
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Out-of-order append for session {session_id}: expected {expected}, got {got}")]
    OutOfOrder {
        session_id: SessionId,
        expected: SequenceId,
        got: SequenceId,
    },
}
