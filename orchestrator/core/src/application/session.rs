// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Session Application Service
//
// Runs each session's control loop on its own tokio task and hands out a
// cloneable SessionHandle for observing and steering it. The loop runs
// inside an inner task supervised by an outer one; whatever way the inner
// task ends (normal return, panic, forced abort) the outer task disposes the
// runtime, closes the log and publishes the final report. An action the
// inner task left unanswered gets an `Abandoned` observation first.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::domain::controller::{AgentController, ControllerState};
use crate::domain::event_log::{EventLog, EventLogError, EventSubscription};
use crate::domain::events::{
    ActionId, ControlSignal, Event, EventPayload, EventSource, Observation, ObservationErrorKind, ObservationKind,
    SequenceId, SessionId,
};
use crate::domain::failure::{FailureKind, SessionFailure};
use crate::domain::repository::EventStore;
use crate::domain::runtime::{Runtime, RuntimeError, RuntimeFactory};
use crate::domain::session::{Budget, Session, SessionReport, SessionSnapshot, SessionStatus};

#[derive(Debug, Error)]
pub enum SessionHandleError {
    #[error("Session {0} is not waiting for user input")]
    NoPendingQuestion(SessionId),

    #[error("Session {0} has already ended")]
    Ended(SessionId),

    #[error(transparent)]
    Log(#[from] EventLogError),
}

#[derive(Debug, Error)]
pub enum SessionStartError {
    #[error("Failed to open event log: {0}")]
    Log(#[from] EventLogError),

    #[error("Failed to create runtime: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Cloneable handle to a running (or finished) session.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: SessionId,
    goal: Arc<str>,
    log: Arc<EventLog>,
    snapshot: watch::Receiver<SessionSnapshot>,
    report: watch::Receiver<Option<SessionReport>>,
    cancel: CancellationToken,
    abort: AbortHandle,
    /// Question most recently answered through [`respond`](Self::respond).
    answered: Arc<Mutex<Option<ActionId>>>,
}

impl SessionHandle {
    /// Start driving `session` with `controller` on the current tokio runtime.
    pub fn spawn(controller: Arc<AgentController>, session: Session) -> Self {
        let session_id = session.id;
        let goal: Arc<str> = Arc::from(session.goal.as_str());
        let log = session.log().clone();
        let runtime = session.runtime().clone();

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::created());
        let snapshot_tx = Arc::new(snapshot_tx);
        let (report_tx, report_rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let started = Instant::now();

        let inner = tokio::spawn({
            let controller = controller.clone();
            let cancel = cancel.clone();
            let snapshot_tx = snapshot_tx.clone();
            async move {
                let mut session = session;
                controller.run(&mut session, &cancel, &snapshot_tx).await
            }
        });
        let abort = inner.abort_handle();

        tokio::spawn({
            let goal = goal.clone();
            let log = log.clone();
            async move {
                let report = match inner.await {
                    Ok(report) => report,
                    Err(e) => {
                        let (status, kind, reason) = if e.is_cancelled() {
                            (
                                SessionStatus::Cancelled,
                                FailureKind::Cancelled,
                                "session was force-terminated".to_string(),
                            )
                        } else {
                            (
                                SessionStatus::Failed,
                                FailureKind::Internal,
                                format!("controller task panicked: {}", e),
                            )
                        };
                        observe_dangling_action(session_id, &log).await;
                        let recent = log
                            .tail(controller.config().failure_context_events)
                            .await
                            .unwrap_or_default();
                        let report = SessionReport {
                            session_id,
                            goal: goal.to_string(),
                            status,
                            step_count: snapshot_tx.borrow().step_count,
                            elapsed: started.elapsed(),
                            failure: Some(SessionFailure::new(kind, reason).with_context(recent)),
                        };
                        warn!(session_id = %session_id, status = %status, kind = %kind, "Session ended abnormally");
                        metrics::counter!("conductor_sessions_terminal_total", "status" => status.as_str())
                            .increment(1);
                        controller.observer().on_session_ended(&report).await;
                        report
                    }
                };

                release(session_id, runtime.as_ref(), &log, controller.config().dispose_timeout).await;
                controller.thinker().end_session(session_id);
                snapshot_tx.send_modify(|snapshot| {
                    snapshot.status = report.status;
                    snapshot.state = terminal_state(report.status);
                    snapshot.step_count = report.step_count;
                    snapshot.pending_question = None;
                });
                report_tx.send_replace(Some(report));
            }
        });

        Self {
            session_id,
            goal,
            log,
            snapshot: snapshot_rx,
            report: report_rx,
            cancel,
            abort,
            answered: Arc::new(Mutex::new(None)),
        }
    }

    pub fn id(&self) -> SessionId {
        self.session_id
    }

    pub fn goal(&self) -> &str {
        &self.goal
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that sees every published snapshot from now on.
    pub fn watch_status(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Live subscription to the session's event log from its first event.
    pub fn subscribe(&self) -> EventSubscription {
        self.log.subscribe()
    }

    /// Request cancellation. The request is recorded in the log before the
    /// loop is signalled. Returns `false` when the session has already ended
    /// or was already cancelled.
    pub async fn cancel(&self, reason: Option<String>) -> Result<bool, SessionHandleError> {
        if self.cancel.is_cancelled() || self.report.borrow().is_some() {
            return Ok(false);
        }
        match self
            .log
            .append(EventSource::User, EventPayload::Control(ControlSignal::Cancel { reason }))
            .await
        {
            Ok(_) => {}
            Err(EventLogError::Closed { .. }) => return Ok(false),
            Err(e) => return Err(e.into()),
        }
        info!(session_id = %self.session_id, "Cancellation requested");
        self.cancel.cancel();
        Ok(true)
    }

    /// Answer the question of a pending `AskUser` action. Each question
    /// accepts exactly one answer; later callers get `NoPendingQuestion`.
    pub async fn respond(&self, text: impl Into<String>) -> Result<(), SessionHandleError> {
        let pending = self
            .snapshot
            .borrow()
            .pending_question
            .clone()
            .ok_or(SessionHandleError::NoPendingQuestion(self.session_id))?;
        {
            let mut answered = self.answered.lock();
            if *answered == Some(pending.action_id) {
                return Err(SessionHandleError::NoPendingQuestion(self.session_id));
            }
            *answered = Some(pending.action_id);
        }

        let observation = Observation::new(pending.action_id, ObservationKind::UserResponse { text: text.into() });
        let result = self
            .log
            .append(EventSource::User, EventPayload::Observation(observation))
            .await;
        if result.is_err() {
            let mut answered = self.answered.lock();
            if *answered == Some(pending.action_id) {
                *answered = None;
            }
        }
        match result {
            Ok(_) => Ok(()),
            Err(EventLogError::Closed { .. }) => Err(SessionHandleError::Ended(self.session_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Stop the loop without waiting for a safe point. Cleanup still runs and
    /// the session ends `Cancelled`.
    pub fn force_terminate(&self) {
        warn!(session_id = %self.session_id, "Force-terminating session");
        self.cancel.cancel();
        self.abort.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.report.borrow().is_some()
    }

    /// Final report, if the session has ended and been cleaned up.
    pub fn report(&self) -> Option<SessionReport> {
        self.report.borrow().clone()
    }

    /// Wait until the session has ended and its runtime and log are released.
    pub async fn wait(&self) -> SessionReport {
        let mut receiver = self.report.clone();
        let report = match receiver.wait_for(Option::is_some).await {
            Ok(done) => done.clone(),
            Err(_) => None,
        };
        report.unwrap_or_else(|| self.lost_report())
    }

    /// Like [`wait`](Self::wait), but gives up after `limit`.
    pub async fn wait_timeout(&self, limit: Duration) -> Option<SessionReport> {
        tokio::time::timeout(limit, self.wait()).await.ok()
    }

    /// Report for a session whose cleanup is no longer being waited on. The
    /// supervising task keeps running and publishes the real report later.
    pub fn detached_report(&self, reason: impl Into<String>) -> SessionReport {
        self.synthetic_report(SessionStatus::Cancelled, SessionFailure::new(FailureKind::Cancelled, reason))
    }

    /// The supervising task vanished without publishing, which only happens
    /// when the tokio runtime itself shuts down.
    fn lost_report(&self) -> SessionReport {
        self.synthetic_report(
            SessionStatus::Failed,
            SessionFailure::new(FailureKind::Internal, "session task ended without reporting"),
        )
    }

    fn synthetic_report(&self, status: SessionStatus, failure: SessionFailure) -> SessionReport {
        SessionReport {
            session_id: self.session_id,
            goal: self.goal.to_string(),
            status,
            step_count: self.snapshot.borrow().step_count,
            elapsed: Duration::ZERO,
            failure: Some(failure),
        }
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("status", &self.status())
            .finish()
    }
}

async fn release(session_id: SessionId, runtime: &dyn Runtime, log: &EventLog, dispose_timeout: Duration) {
    match tokio::time::timeout(dispose_timeout, runtime.dispose()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(session_id = %session_id, error = %e, "Failed to dispose runtime"),
        Err(_) => warn!(
            session_id = %session_id,
            timeout = ?dispose_timeout,
            "Runtime dispose did not complete in time, abandoning it"
        ),
    }
    log.close().await;
}

/// Close out the in-flight action of a loop that was aborted or panicked, so
/// every action in the log keeps exactly one observation.
async fn observe_dangling_action(session_id: SessionId, log: &EventLog) {
    let events = match log.snapshot(SequenceId::ZERO).await {
        Ok(events) => events,
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "Could not read log to close out the last action");
            return;
        }
    };
    let Some(action_id) = unobserved_action(&events) else {
        return;
    };
    let observation = Observation::error(
        action_id,
        ObservationErrorKind::Abandoned,
        "action abandoned: session loop stopped before it resolved",
    );
    match log
        .append(EventSource::System, EventPayload::Observation(observation))
        .await
    {
        Ok(_) => info!(session_id = %session_id, action_id = %action_id, "Recorded abandoned action"),
        Err(e) => warn!(session_id = %session_id, error = %e, "Failed to record abandoned action"),
    }
}

/// The most recent action, if nothing after it observes it. Actions are
/// dispatched one at a time, so only the last one can be open.
fn unobserved_action(events: &[Event]) -> Option<ActionId> {
    let position = events.iter().rposition(|e| e.as_action().is_some())?;
    let action_id = events[position].as_action()?.action_id;
    let observed = events[position + 1..]
        .iter()
        .filter_map(Event::as_observation)
        .any(|o| o.action_id == action_id);
    (!observed).then_some(action_id)
}

fn terminal_state(status: SessionStatus) -> ControllerState {
    match status {
        SessionStatus::Finished => ControllerState::Finished,
        SessionStatus::Cancelled => ControllerState::Cancelled,
        _ => ControllerState::Failed,
    }
}

#[async_trait]
pub trait SessionService: Send + Sync {
    async fn start_session(&self, goal: &str) -> Result<SessionHandle>;
    fn get_session(&self, id: SessionId) -> Option<SessionHandle>;
    fn list_sessions(&self) -> Vec<SessionHandle>;
    async fn cancel_session(&self, id: SessionId, reason: Option<String>) -> Result<bool>;
}

/// Creates sessions from a runtime factory and event store, and keeps a
/// registry of the handles it has issued.
pub struct StandardSessionService {
    controller: Arc<AgentController>,
    runtime_factory: Arc<dyn RuntimeFactory>,
    store: Arc<dyn EventStore>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

impl StandardSessionService {
    pub fn new(
        controller: Arc<AgentController>,
        runtime_factory: Arc<dyn RuntimeFactory>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            controller,
            runtime_factory,
            store,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Open the log, create the runtime and spawn the loop, with an explicit
    /// budget.
    pub async fn start_with_budget(&self, goal: &str, budget: Budget) -> Result<SessionHandle, SessionStartError> {
        let handle = start_session(
            self.controller.clone(),
            self.runtime_factory.as_ref(),
            self.store.clone(),
            goal,
            budget,
        )
        .await?;
        self.sessions.write().insert(handle.id(), handle.clone());
        Ok(handle)
    }

    /// Forget finished sessions. Returns how many were dropped.
    pub fn reap_finished(&self) -> usize {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|_, handle| !handle.is_finished());
        before - sessions.len()
    }
}

/// Open a fresh log, create the runtime, and spawn the session loop.
pub async fn start_session(
    controller: Arc<AgentController>,
    runtime_factory: &dyn RuntimeFactory,
    store: Arc<dyn EventStore>,
    goal: &str,
    budget: Budget,
) -> Result<SessionHandle, SessionStartError> {
    let session_id = SessionId::new();
    let log = Arc::new(EventLog::open(session_id, store).await?);
    let runtime: Arc<dyn Runtime> = match runtime_factory.create(session_id).await {
        Ok(runtime) => Arc::from(runtime),
        Err(e) => {
            log.close().await;
            return Err(e.into());
        }
    };
    info!(session_id = %session_id, runtime = %runtime.kind(), "Starting session");
    let session = Session::new(goal, budget, log, runtime);
    Ok(SessionHandle::spawn(controller, session))
}

#[async_trait]
impl SessionService for StandardSessionService {
    async fn start_session(&self, goal: &str) -> Result<SessionHandle> {
        let budget = self.controller.config().budget();
        Ok(self.start_with_budget(goal, budget).await?)
    }

    fn get_session(&self, id: SessionId) -> Option<SessionHandle> {
        self.sessions.read().get(&id).cloned()
    }

    fn list_sessions(&self) -> Vec<SessionHandle> {
        self.sessions.read().values().cloned().collect()
    }

    async fn cancel_session(&self, id: SessionId, reason: Option<String>) -> Result<bool> {
        let handle = self
            .get_session(id)
            .ok_or_else(|| anyhow::anyhow!("Session {} not found", id))?;
        Ok(handle.cancel(reason).await?)
    }
}
