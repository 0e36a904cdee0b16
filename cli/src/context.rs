// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Builds the services a command needs from the loaded configuration.

use anyhow::{Context, Result};
use conductor_core::application::StandardSessionService;
use conductor_core::domain::config::ConductorConfig;
use conductor_core::domain::controller::AgentController;
use conductor_core::domain::repository::EventStore;
use conductor_core::domain::thinker::{Planner, Thinker};
use conductor_core::infrastructure::{
    create_event_store, ConfiguredRuntimeFactory, EventBus, EventBusObserver, ScriptedThinker,
};
use conductor_swarm::{CoordinatorConfig, SwarmCoordinator};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Load, override and validate the configuration.
pub fn load_config(path: Option<PathBuf>) -> Result<ConductorConfig> {
    let config = ConductorConfig::load_or_default(path).context("Failed to load configuration")?;
    config.validate().context("Configuration validation failed")?;
    Ok(config)
}

pub fn load_script(path: &Path) -> Result<Arc<dyn Thinker>> {
    let thinker = ScriptedThinker::from_yaml_file(path)
        .with_context(|| format!("Failed to load decision script {}", path.display()))?;
    debug!(steps = thinker.len(), script = %path.display(), "Loaded decision script");
    Ok(Arc::new(thinker))
}

/// Shared plumbing for both single sessions and swarms.
pub struct AppContext {
    pub config: ConductorConfig,
    pub store: Arc<dyn EventStore>,
    pub runtime_factory: Arc<ConfiguredRuntimeFactory>,
    pub event_bus: EventBus,
}

impl AppContext {
    pub fn new(config: ConductorConfig) -> Result<Self> {
        let store = create_event_store(&config.spec.event_log).context("Failed to open event store")?;
        let runtime_factory = Arc::new(ConfiguredRuntimeFactory::new(config.spec.runtime.clone()));
        Ok(Self {
            config,
            store,
            runtime_factory,
            event_bus: EventBus::default(),
        })
    }

    pub fn session_service(&self, thinker: Arc<dyn Thinker>) -> StandardSessionService {
        let controller = AgentController::new(thinker, self.config.spec.controller.clone())
            .with_observer(Arc::new(EventBusObserver::new(self.event_bus.clone())));
        StandardSessionService::new(Arc::new(controller), self.runtime_factory.clone(), self.store.clone())
    }

    pub fn swarm_coordinator(&self, thinker: Arc<dyn Thinker>, planner: Arc<dyn Planner>) -> SwarmCoordinator {
        SwarmCoordinator::new(
            CoordinatorConfig::from_conductor_config(&self.config),
            planner,
            thinker,
            self.runtime_factory.clone(),
            self.store.clone(),
            self.event_bus.clone(),
        )
    }
}
