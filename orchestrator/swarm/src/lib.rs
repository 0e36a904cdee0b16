// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # `conductor-swarm`: Multi-Session Coordination
//!
//! Runs many sessions toward subtasks of one overarching goal and aggregates
//! their results.
//!
//! ## Crate Layout
//!
//! | Module | Layer | Contents |
//! |--------|-------|----------|
//! | [`domain`] | Domain | `SwarmTask`, `Subtask`, `SwarmOutcome` |
//! | [`application`] | Application | `SwarmCoordinator` |
//!
//! ## Key Concepts
//!
//! - **SwarmTask**: a goal split by a planner into ordered subtasks, each run
//!   by its own session.
//! - **Admission**: at most `concurrency_limit` sessions per task, and at most
//!   `max_sessions` across the coordinator.
//! - **Cascade Cancellation**: cancelling a task cancels every running child
//!   and drops the queued ones.

pub mod application;
pub mod domain;

pub use application::{CoordinatorConfig, SwarmCoordinator, SwarmError};
pub use domain::*;
