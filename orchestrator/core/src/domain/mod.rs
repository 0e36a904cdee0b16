// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Domain layer: session, event and failure types plus the trait seams
//! (`EventStore`, `Runtime`, `Thinker`, `Planner`) the control loop depends on.

pub mod config;
pub mod controller;
pub mod event_log;
pub mod events;
pub mod failure;
pub mod lifecycle;
pub mod path_sanitizer;
pub mod policy;
pub mod repository;
pub mod runtime;
pub mod session;
pub mod thinker;
