// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Shared fixtures for the integration tests: a scriptable mock runtime and
//! helpers that wire a session around it.

#![allow(dead_code)]

use async_trait::async_trait;
use conductor_core::application::SessionHandle;
use conductor_core::domain::controller::{AgentController, ControllerConfig};
use conductor_core::domain::event_log::EventLog;
use conductor_core::domain::events::{Action, ActionKind, Event, Observation, ObservationKind, SessionId};
use conductor_core::domain::policy::RetryPolicy;
use conductor_core::domain::runtime::{Runtime, RuntimeError, RuntimeKind};
use conductor_core::domain::session::{Session, SessionSnapshot};
use conductor_core::domain::thinker::Thinker;
use conductor_core::infrastructure::InMemoryEventStore;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum MockStep {
    Observe(ObservationKind),
    Fail(RuntimeError),
    /// Never completes.
    Hang,
    /// Completes after the delay with a successful command result.
    Slow(Duration),
    Panic,
}

pub struct MockRuntime {
    script: Mutex<VecDeque<MockStep>>,
    default_step: MockStep,
    executed: Mutex<Vec<Action>>,
    resets: AtomicUsize,
    disposals: AtomicUsize,
    hang_on_dispose: bool,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default_step: MockStep::Observe(command_ok("ok")),
            executed: Mutex::new(Vec::new()),
            resets: AtomicUsize::new(0),
            disposals: AtomicUsize::new(0),
            hang_on_dispose: false,
        }
    }

    pub fn then(self, step: MockStep) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn by_default(mut self, step: MockStep) -> Self {
        self.default_step = step;
        self
    }

    /// `dispose()` never completes.
    pub fn hang_on_dispose(mut self) -> Self {
        self.hang_on_dispose = true;
        self
    }

    pub fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }

    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn disposals(&self) -> usize {
        self.disposals.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Runtime for MockRuntime {
    async fn execute(&self, action: &Action) -> Result<Observation, RuntimeError> {
        self.executed.lock().unwrap().push(action.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone());

        match step {
            MockStep::Observe(kind) => Ok(Observation::new(action.action_id, kind)),
            MockStep::Fail(error) => Err(error),
            MockStep::Hang => std::future::pending().await,
            MockStep::Slow(delay) => {
                tokio::time::sleep(delay).await;
                Ok(Observation::new(action.action_id, command_ok("slow")))
            }
            MockStep::Panic => panic!("mock runtime exploded"),
        }
    }

    async fn reset(&self) -> Result<(), RuntimeError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn dispose(&self) -> Result<(), RuntimeError> {
        self.disposals.fetch_add(1, Ordering::SeqCst);
        if self.hang_on_dispose {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Custom
    }
}

pub fn command_ok(stdout: &str) -> ObservationKind {
    ObservationKind::CommandResult {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

pub fn run(command: &str) -> ActionKind {
    ActionKind::RunCommand {
        command: command.to_string(),
        cwd: None,
    }
}

pub fn finish(summary: &str) -> ActionKind {
    ActionKind::FinishTask {
        summary: summary.to_string(),
    }
}

/// Defaults with millisecond-scale backoff and grace so tests stay fast.
pub fn fast_config() -> ControllerConfig {
    let retry = RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 2.0,
    };
    ControllerConfig {
        thinker_retry: retry.clone(),
        runtime_retry: retry,
        cancel_grace: Duration::from_millis(50),
        ..ControllerConfig::default()
    }
}

pub async fn spawn_session(
    thinker: impl Thinker + 'static,
    runtime: Arc<MockRuntime>,
    config: ControllerConfig,
) -> SessionHandle {
    let store = Arc::new(InMemoryEventStore::new());
    let log = Arc::new(EventLog::open(SessionId::new(), store).await.unwrap());
    let session = Session::new("test goal", config.budget(), log, runtime);
    let controller = Arc::new(AgentController::new(Arc::new(thinker), config));
    SessionHandle::spawn(controller, session)
}

pub async fn wait_for_state(handle: &SessionHandle, matches: impl Fn(&SessionSnapshot) -> bool) {
    let mut status = handle.watch_status();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| matches(s)))
        .await
        .expect("timed out waiting for session state")
        .expect("session status channel closed");
}

pub async fn events(handle: &SessionHandle) -> Vec<Event> {
    handle
        .log()
        .snapshot(conductor_core::domain::events::SequenceId::ZERO)
        .await
        .unwrap()
}

/// Panics unless every action in `events` has exactly one observation.
pub fn assert_every_action_observed(events: &[Event]) {
    for action in events.iter().filter_map(Event::as_action) {
        let observations = events
            .iter()
            .filter_map(Event::as_observation)
            .filter(|o| o.action_id == action.action_id)
            .count();
        assert_eq!(observations, 1, "action {} has {} observations", action.action_id, observations);
    }
}
