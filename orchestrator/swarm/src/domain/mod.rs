// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Swarm Domain Layer
//!
//! Pure types for multi-session coordination. No I/O dependencies.
//!
//! | Module | Key Types |
//! |--------|-----------|
//! | [`swarm`] | `SwarmTask`, `Subtask`, `SwarmOutcome`, `SwarmTaskId` |

pub mod swarm;

pub use swarm::*;
