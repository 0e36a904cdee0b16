// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Command implementations for the conductor CLI

pub mod config;
pub mod run;
pub mod swarm;

pub use self::config::ConfigCommand;
pub use self::run::RunArgs;
pub use self::swarm::SwarmArgs;
