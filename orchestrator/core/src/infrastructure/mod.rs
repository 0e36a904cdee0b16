// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod event_bus;
pub mod event_store;
pub mod runtime;
pub mod thinker;

pub use event_bus::{DomainEvent, EventBus, EventBusObserver};
pub use event_store::{create_event_store, FileEventStore, InMemoryEventStore};
pub use runtime::ConfiguredRuntimeFactory;
pub use thinker::{LinePlanner, ScriptedThinker, StaticPlanner};
