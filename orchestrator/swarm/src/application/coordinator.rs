// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Swarm Coordinator
//!
//! Splits a goal into subtasks with a [`Planner`], runs one session per
//! subtask and aggregates their reports into a [`SwarmOutcome`].
//!
//! # Architecture
//!
//! - **Layer:** Application Layer
//! - **Purpose:** Admission, supervision and aggregation of child sessions
//!
//! Admission goes through two semaphores: one per task sized by the caller's
//! `concurrency_limit`, and one shared by every task of this coordinator sized
//! by `SwarmConfig::max_sessions`. A subtask holds both permits for the whole
//! life of its session, so runtime creation is never unbounded.
//!
//! Each coordinator owns its limiter and session registry; nothing here is
//! process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conductor_core::application::{start_session, SessionHandle, SessionStartError};
use conductor_core::domain::config::{ConductorConfig, SwarmConfig};
use conductor_core::domain::controller::{AgentController, ControllerConfig};
use conductor_core::domain::events::SessionId;
use conductor_core::domain::failure::FailureKind;
use conductor_core::domain::lifecycle::SwarmEvent;
use conductor_core::domain::repository::EventStore;
use conductor_core::domain::runtime::{RuntimeError, RuntimeFactory};
use conductor_core::domain::session::{SessionReport, SessionStatus};
use conductor_core::domain::thinker::{Planner, PlannerError, Thinker};
use conductor_core::infrastructure::{EventBus, EventBusObserver};
use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{SubtaskState, SwarmOutcome, SwarmTask, SwarmTaskId};

#[derive(Debug, Error)]
pub enum SwarmError {
    #[error("Swarm task {0} not found")]
    NotFound(SwarmTaskId),

    #[error("Swarm task {0} is still running")]
    StillRunning(SwarmTaskId),

    #[error("Concurrency limit must be at least 1")]
    InvalidConcurrency,

    #[error("Planning failed: {0}")]
    Planning(#[from] PlannerError),

    #[error("Planner returned no subtasks")]
    EmptyPlan,

    #[error("Coordinator is shutting down")]
    ShuttingDown,
}

/// Settings a coordinator needs from the process configuration.
#[derive(Debug, Clone, Default)]
pub struct CoordinatorConfig {
    pub swarm: SwarmConfig,
    pub controller: ControllerConfig,
}

impl CoordinatorConfig {
    pub fn from_conductor_config(config: &ConductorConfig) -> Self {
        Self {
            swarm: config.spec.swarm.clone(),
            controller: config.spec.controller.clone(),
        }
    }
}

struct TaskEntry {
    state: watch::Sender<SwarmTask>,
    cancel: CancellationToken,
}

impl TaskEntry {
    fn id(&self) -> SwarmTaskId {
        self.state.borrow().id
    }
}

/// Everything a running task needs, shared between the coordinator and the
/// per-task supervisors.
struct Dispatcher {
    controller: Arc<AgentController>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    store: Arc<dyn EventStore>,
    event_bus: EventBus,
    admission: Arc<Semaphore>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    cancel_grace: Duration,
}

pub struct SwarmCoordinator {
    config: SwarmConfig,
    planner: Arc<dyn Planner>,
    dispatcher: Arc<Dispatcher>,
    tasks: RwLock<HashMap<SwarmTaskId, Arc<TaskEntry>>>,
    shutting_down: AtomicBool,
}

impl SwarmCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        planner: Arc<dyn Planner>,
        thinker: Arc<dyn Thinker>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        store: Arc<dyn EventStore>,
        event_bus: EventBus,
    ) -> Self {
        let controller = AgentController::new(thinker, config.controller)
            .with_observer(Arc::new(EventBusObserver::new(event_bus.clone())));
        let dispatcher = Dispatcher {
            controller: Arc::new(controller),
            runtime_factory,
            store,
            event_bus,
            admission: Arc::new(Semaphore::new(config.swarm.max_sessions)),
            sessions: RwLock::new(HashMap::new()),
            cancel_grace: config.swarm.cancel_grace,
        };
        Self {
            config: config.swarm,
            planner,
            dispatcher: Arc::new(dispatcher),
            tasks: RwLock::new(HashMap::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Plan `goal` and start working through its subtasks, at most
    /// `concurrency_limit` at a time. Returns the task as dispatched; poll
    /// [`status`](Self::status) or [`wait`](Self::wait) for progress.
    pub async fn dispatch(&self, goal: &str, concurrency_limit: usize) -> Result<SwarmTask, SwarmError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SwarmError::ShuttingDown);
        }
        if concurrency_limit == 0 {
            return Err(SwarmError::InvalidConcurrency);
        }

        let descriptions = self.planner.plan(goal).await?;
        if descriptions.is_empty() {
            return Err(SwarmError::EmptyPlan);
        }

        let task = SwarmTask::new(goal, descriptions, concurrency_limit);
        let (state, _) = watch::channel(task.clone());
        let entry = Arc::new(TaskEntry {
            state,
            cancel: CancellationToken::new(),
        });
        self.tasks.write().insert(task.id, entry.clone());

        info!(
            swarm_task_id = %task.id,
            subtasks = task.subtasks.len(),
            concurrency_limit,
            "Dispatching swarm task"
        );
        self.dispatcher.event_bus.publish_swarm_event(SwarmEvent::TaskDispatched {
            swarm_task_id: task.id.0,
            goal: goal.to_string(),
            subtask_count: task.subtasks.len(),
            concurrency_limit,
            dispatched_at: Utc::now(),
        });

        tokio::spawn(self.dispatcher.clone().supervise(entry));
        Ok(task)
    }

    fn entry(&self, id: SwarmTaskId) -> Result<Arc<TaskEntry>, SwarmError> {
        self.tasks.read().get(&id).cloned().ok_or(SwarmError::NotFound(id))
    }

    pub fn status(&self, id: SwarmTaskId) -> Result<SwarmTask, SwarmError> {
        Ok(self.entry(id)?.state.borrow().clone())
    }

    /// Follow a task's progress as it changes.
    pub fn watch(&self, id: SwarmTaskId) -> Result<watch::Receiver<SwarmTask>, SwarmError> {
        Ok(self.entry(id)?.state.subscribe())
    }

    pub fn list(&self) -> Vec<SwarmTask> {
        self.tasks.read().values().map(|e| e.state.borrow().clone()).collect()
    }

    /// Wait until every subtask is terminal.
    pub async fn wait(&self, id: SwarmTaskId) -> Result<SwarmOutcome, SwarmError> {
        let mut state = self.watch(id)?;
        let outcome = state
            .wait_for(SwarmTask::is_complete)
            .await
            .ok()
            .and_then(|task| task.outcome().cloned());
        outcome.ok_or(SwarmError::NotFound(id))
    }

    /// Cancel a task and wait for its children to stop.
    ///
    /// Queued subtasks are cancelled without ever starting a session. Running
    /// sessions get a cancel request; any still running after the swarm
    /// `cancel_grace` are force-terminated.
    pub async fn cancel(&self, id: SwarmTaskId) -> Result<SwarmOutcome, SwarmError> {
        let entry = self.entry(id)?;
        if let Some(outcome) = entry.state.borrow().outcome() {
            return Ok(outcome.clone());
        }
        if !entry.cancel.is_cancelled() {
            info!(swarm_task_id = %id, "Cancelling swarm task");
            self.dispatcher.event_bus.publish_swarm_event(SwarmEvent::CancellationRequested {
                swarm_task_id: id.0,
                requested_at: Utc::now(),
            });
            entry.cancel.cancel();
        }
        self.wait(id).await
    }

    /// Look up a child session by id.
    pub fn session(&self, session_id: SessionId) -> Option<SessionHandle> {
        self.dispatcher.sessions.read().get(&session_id).cloned()
    }

    /// Handles for every session a task has started so far.
    pub fn sessions(&self, id: SwarmTaskId) -> Result<Vec<SessionHandle>, SwarmError> {
        let task = self.status(id)?;
        let registry = self.dispatcher.sessions.read();
        Ok(task
            .subtasks
            .iter()
            .filter_map(|s| s.assigned_session_id)
            .filter_map(|session_id| registry.get(&session_id).cloned())
            .collect())
    }

    /// Sessions currently holding a slot under the coordinator-wide ceiling.
    pub fn running_sessions(&self) -> usize {
        self.config
            .max_sessions
            .saturating_sub(self.dispatcher.admission.available_permits())
    }

    /// Drop a completed task and its sessions from the registries.
    pub fn reap(&self, id: SwarmTaskId) -> Result<SwarmTask, SwarmError> {
        let entry = self.entry(id)?;
        let task = entry.state.borrow().clone();
        if !task.is_complete() {
            return Err(SwarmError::StillRunning(id));
        }

        self.tasks.write().remove(&id);
        let mut sessions = self.dispatcher.sessions.write();
        for session_id in task.subtasks.iter().filter_map(|s| s.assigned_session_id) {
            sessions.remove(&session_id);
        }
        debug!(swarm_task_id = %id, "Reaped swarm task");
        Ok(task)
    }

    /// Refuse new work, cancel every unfinished task and reap everything.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let ids: Vec<SwarmTaskId> = self.tasks.read().keys().copied().collect();
        info!(tasks = ids.len(), "Shutting down swarm coordinator");

        for id in ids {
            if let Err(e) = self.cancel(id).await {
                warn!(swarm_task_id = %id, error = %e, "Failed to cancel swarm task during shutdown");
            }
            if let Err(e) = self.reap(id) {
                warn!(swarm_task_id = %id, error = %e, "Failed to reap swarm task during shutdown");
            }
        }
    }
}

impl Dispatcher {
    /// Admit subtasks in order, then aggregate once all of them are terminal.
    async fn supervise(self: Arc<Self>, entry: Arc<TaskEntry>) {
        let task_id = entry.id();
        let (limit, subtasks) = {
            let task = entry.state.borrow();
            let subtasks: Vec<(usize, String)> = task
                .subtasks
                .iter()
                .map(|s| (s.index, s.description.clone()))
                .collect();
            (task.concurrency_limit, subtasks)
        };
        let slots = Arc::new(Semaphore::new(limit));
        let mut children = JoinSet::new();

        for (index, description) in subtasks {
            let Some(permits) = self.admit(&slots, &entry.cancel).await else {
                break;
            };
            children.spawn(self.clone().run_subtask(entry.clone(), index, description, permits));
        }

        if entry.cancel.is_cancelled() {
            let mut cancelled = Vec::new();
            entry.state.send_modify(|task| cancelled = task.cancel_queued());
            for index in cancelled {
                debug!(swarm_task_id = %task_id, index, "Queued subtask cancelled");
                self.event_bus.publish_swarm_event(SwarmEvent::SubtaskCompleted {
                    swarm_task_id: task_id.0,
                    index,
                    session_id: None,
                    status: SessionStatus::Cancelled,
                });
            }
        }

        while let Some(joined) = children.join_next().await {
            if let Err(e) = joined {
                error!(swarm_task_id = %task_id, error = %e, "Subtask supervisor failed");
            }
        }

        let mut outcome = None;
        entry.state.send_modify(|task| {
            // A supervisor that panicked leaves its subtask non-terminal.
            for index in 0..task.subtasks.len() {
                task.mark_terminal(
                    index,
                    SubtaskState::Failed {
                        kind: FailureKind::Internal,
                        reason: "subtask supervisor ended unexpectedly".to_string(),
                    },
                );
            }
            outcome = task.aggregate();
        });

        let (total, succeeded) = {
            let task = entry.state.borrow();
            (task.subtasks.len(), task.finished_count())
        };
        let failed = total - succeeded;
        let label = if failed == 0 { "success" } else { "partial_failure" };
        metrics::counter!("conductor_swarm_tasks_completed_total", "outcome" => label).increment(1);
        self.event_bus.publish_swarm_event(SwarmEvent::TaskCompleted {
            swarm_task_id: task_id.0,
            succeeded,
            failed,
            completed_at: Utc::now(),
        });

        match outcome {
            Some(SwarmOutcome::Success) => info!(swarm_task_id = %task_id, subtasks = total, "Swarm task succeeded"),
            _ => warn!(swarm_task_id = %task_id, succeeded, failed, "Swarm task completed with failures"),
        }
    }

    /// Take a per-task slot, then a coordinator-wide one. `None` if the task
    /// is cancelled while waiting.
    async fn admit(
        &self,
        slots: &Arc<Semaphore>,
        cancel: &CancellationToken,
    ) -> Option<(OwnedSemaphorePermit, OwnedSemaphorePermit)> {
        let task_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = slots.clone().acquire_owned() => permit.ok()?,
        };
        let global_permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return None,
            permit = self.admission.clone().acquire_owned() => permit.ok()?,
        };
        Some((task_permit, global_permit))
    }

    async fn run_subtask(
        self: Arc<Self>,
        entry: Arc<TaskEntry>,
        index: usize,
        description: String,
        _permits: (OwnedSemaphorePermit, OwnedSemaphorePermit),
    ) {
        let task_id = entry.id();
        if entry.cancel.is_cancelled() {
            // Admitted but cancelled before it ran.
            self.drop_queued(&entry, index);
            return;
        }
        let started = start_session(
            self.controller.clone(),
            self.runtime_factory.as_ref(),
            self.store.clone(),
            &description,
            self.controller.config().budget(),
        )
        .await;

        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                warn!(swarm_task_id = %task_id, index, error = %e, "Failed to start subtask session");
                let state = SubtaskState::Failed {
                    kind: start_failure_kind(&e),
                    reason: e.to_string(),
                };
                entry.state.send_modify(|task| task.mark_terminal(index, state));
                self.event_bus.publish_swarm_event(SwarmEvent::SubtaskCompleted {
                    swarm_task_id: task_id.0,
                    index,
                    session_id: None,
                    status: SessionStatus::Failed,
                });
                return;
            }
        };

        let session_id = handle.id();
        let mut admitted = false;
        entry.state.send_modify(|task| admitted = task.mark_running(index, session_id));
        if !admitted {
            debug!(swarm_task_id = %task_id, index, session_id = %session_id, "Subtask cancelled while starting");
            self.stop(&handle).await;
            return;
        }
        self.sessions.write().insert(session_id, handle.clone());
        metrics::gauge!("conductor_swarm_sessions_running").increment(1.0);
        info!(swarm_task_id = %task_id, index, session_id = %session_id, "Subtask started");
        self.event_bus.publish_swarm_event(SwarmEvent::SubtaskStarted {
            swarm_task_id: task_id.0,
            index,
            session_id,
        });

        let report = tokio::select! {
            report = handle.wait() => report,
            _ = entry.cancel.cancelled() => self.stop(&handle).await,
        };

        metrics::gauge!("conductor_swarm_sessions_running").decrement(1.0);
        let state = SubtaskState::from_report(&report);
        entry.state.send_modify(|task| task.mark_terminal(index, state));
        debug!(
            swarm_task_id = %task_id,
            index,
            session_id = %session_id,
            status = %report.status,
            "Subtask ended"
        );
        self.event_bus.publish_swarm_event(SwarmEvent::SubtaskCompleted {
            swarm_task_id: task_id.0,
            index,
            session_id: Some(session_id),
            status: report.status,
        });
    }

    fn drop_queued(&self, entry: &TaskEntry, index: usize) {
        let mut cancelled = false;
        entry.state.send_modify(|task| cancelled = task.cancel_subtask(index));
        if cancelled {
            debug!(swarm_task_id = %entry.id(), index, "Queued subtask cancelled");
            self.event_bus.publish_swarm_event(SwarmEvent::SubtaskCompleted {
                swarm_task_id: entry.id().0,
                index,
                session_id: None,
                status: SessionStatus::Cancelled,
            });
        }
    }

    /// Ask a child to stop, forcing it after the grace period. Cleanup of a
    /// forced child gets one more grace period before it is left behind.
    async fn stop(&self, handle: &SessionHandle) -> SessionReport {
        if let Err(e) = handle.cancel(Some("swarm task cancelled".to_string())).await {
            debug!(session_id = %handle.id(), error = %e, "Cancel request not recorded");
        }
        if let Some(report) = handle.wait_timeout(self.cancel_grace).await {
            return report;
        }
        warn!(
            session_id = %handle.id(),
            grace = ?self.cancel_grace,
            "Session ignored cancellation, forcing termination"
        );
        handle.force_terminate();
        match handle.wait_timeout(self.cancel_grace).await {
            Some(report) => report,
            None => {
                error!(
                    session_id = %handle.id(),
                    grace = ?self.cancel_grace,
                    "Session cleanup still running after forced termination, leaving it behind"
                );
                handle.detached_report("session force-terminated; cleanup did not finish in time")
            }
        }
    }
}

fn start_failure_kind(error: &SessionStartError) -> FailureKind {
    match error {
        SessionStartError::Runtime(RuntimeError::Transient(_)) => FailureKind::TransientInfra,
        SessionStartError::Runtime(RuntimeError::ActionRejected(_)) => FailureKind::ActionRejected,
        SessionStartError::Runtime(RuntimeError::ExecutionTimeout(_)) => FailureKind::ExecutionTimeout,
        SessionStartError::Runtime(RuntimeError::EnvironmentUnavailable(_)) => FailureKind::EnvironmentUnavailable,
        SessionStartError::Log(_) => FailureKind::Internal,
    }
}
