// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Conductor core
//!
//! Event-sourced agent sessions: an append-only event log per session, a
//! controller state machine that alternates between a thinker and a
//! sandboxed runtime, and the services that spawn and supervise sessions.
//!
//! # Architecture
//!
//! - `domain`: types, invariants and trait seams
//! - `application`: session lifecycle service
//! - `infrastructure`: event stores, runtime backends, event bus, thinker strategies

pub mod application;
pub mod domain;
pub mod infrastructure;

pub use domain::*;
