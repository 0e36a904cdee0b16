// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Agent Controller
//!
//! The per-session control loop: read the event log, ask the thinker for the
//! next action, execute it on the session's runtime, append the observation,
//! repeat.
//!
//! ```text
//! Idle ─► Thinking ─► Acting ─► Observing ─┬─► Thinking
//!            │                             ├─► AwaitingUser ─► Thinking
//!            │                             ├─► Finished
//!            └──────────► Finished | Failed ┘
//! Cancelled is reachable from every non-terminal state.
//! ```
//!
//! ## Loop decision table
//! | Outcome | Event appended | Next state |
//! |---------|----------------|------------|
//! | thinker returns a valid action | `Action` | Acting |
//! | thinker output malformed / invalid | `Error` (action_rejected) | Thinking |
//! | thinker unavailable or times out | `Error` (transient_infra) | Thinking after backoff, Failed when retries run out |
//! | runtime rejects the action | `Observation::Error(rejected)` | Thinking, Failed (`LoopDetected`) past the threshold |
//! | runtime times out | `Observation::Error(timeout)` | Thinking, after `reset()` if configured |
//! | environment lost | `Observation::Error(unavailable)` | Thinking after `reset()` while reconnects remain, else Failed |
//! | `FinishTask` | `Observation::Acknowledged` | Finished |
//! | `AskUser` | user's `Observation::UserResponse` | AwaitingUser, then Thinking |
//! | step or wall-clock budget spent | | Failed (`BudgetExhausted`) |
//!
//! Every dispatched action receives exactly one observation, including when
//! the session is cancelled mid-action (`Abandoned` after the grace period).

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{error::Elapsed, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::domain::event_log::EventLogError;
use crate::domain::events::{
    Action, ActionKind, ControlSignal, ErrorRecord, Event, EventPayload, EventSource, Observation,
    ObservationErrorKind, ObservationKind, SequenceId, SessionId,
};
use crate::domain::failure::{FailureKind, SessionFailure};
use crate::domain::policy::RetryPolicy;
use crate::domain::runtime::{Runtime, RuntimeError};
use crate::domain::session::{Budget, PendingQuestion, Session, SessionReport, SessionSnapshot, SessionStatus};
use crate::domain::thinker::{
    Decision, HistoryWindow, TerminationOutcome, TerminationSignal, Thinker, ThinkerError, ThinkingContext,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Idle,
    Thinking,
    Acting,
    Observing,
    AwaitingUser,
    Finished,
    Failed,
    Cancelled,
}

impl ControllerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ControllerState::Finished | ControllerState::Failed | ControllerState::Cancelled
        )
    }

    pub fn session_status(&self) -> SessionStatus {
        match self {
            ControllerState::Idle => SessionStatus::Created,
            ControllerState::Thinking | ControllerState::Acting | ControllerState::Observing => {
                SessionStatus::Running
            }
            ControllerState::AwaitingUser => SessionStatus::AwaitingInput,
            ControllerState::Finished => SessionStatus::Finished,
            ControllerState::Failed => SessionStatus::Failed,
            ControllerState::Cancelled => SessionStatus::Cancelled,
        }
    }

    pub fn can_transition_to(&self, to: ControllerState) -> bool {
        use ControllerState::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (_, Cancelled | Failed) => true,
            (Idle, Thinking) => true,
            (Thinking, Acting | Finished) => true,
            (Acting, Observing) => true,
            (Observing, Thinking | AwaitingUser | Finished) => true,
            (AwaitingUser, Thinking) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default = "default_max_wall_time", with = "humantime_serde")]
    pub max_wall_time: Duration,

    /// Upper bound on a single `decide` call.
    #[serde(default = "default_thinker_timeout", with = "humantime_serde")]
    pub thinker_timeout: Duration,

    /// Upper bound on a single `execute` call, enforced on top of whatever
    /// timeout the runtime applies itself.
    #[serde(default = "default_action_timeout", with = "humantime_serde")]
    pub action_timeout: Duration,

    /// How long an in-flight action may keep running after cancellation.
    #[serde(default = "default_cancel_grace", with = "humantime_serde")]
    pub cancel_grace: Duration,

    /// Upper bound on `dispose()` once the loop has ended.
    #[serde(default = "default_dispose_timeout", with = "humantime_serde")]
    pub dispose_timeout: Duration,

    /// Identical rejected actions tolerated in a row; one more fails the
    /// session. `0` disables loop detection.
    #[serde(default = "default_loop_threshold")]
    pub loop_threshold: u32,

    #[serde(default)]
    pub thinker_retry: RetryPolicy,

    #[serde(default)]
    pub runtime_retry: RetryPolicy,

    /// `reset()` attempts allowed after the environment is lost.
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(default)]
    pub reset_on_timeout: bool,

    #[serde(default)]
    pub history_window: HistoryWindow,

    /// Events attached to a terminal failure for context.
    #[serde(default = "default_failure_context_events")]
    pub failure_context_events: usize,
}

fn default_max_steps() -> u32 {
    Budget::default().max_steps
}

fn default_max_wall_time() -> Duration {
    Budget::default().max_wall_time
}

fn default_thinker_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_action_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_cancel_grace() -> Duration {
    Duration::from_secs(5)
}

fn default_dispose_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_loop_threshold() -> u32 {
    3
}

fn default_reconnect_attempts() -> u32 {
    1
}

fn default_failure_context_events() -> usize {
    10
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_wall_time: default_max_wall_time(),
            thinker_timeout: default_thinker_timeout(),
            action_timeout: default_action_timeout(),
            cancel_grace: default_cancel_grace(),
            dispose_timeout: default_dispose_timeout(),
            loop_threshold: default_loop_threshold(),
            thinker_retry: RetryPolicy::default(),
            runtime_retry: RetryPolicy::default(),
            reconnect_attempts: default_reconnect_attempts(),
            reset_on_timeout: false,
            history_window: HistoryWindow::default(),
            failure_context_events: default_failure_context_events(),
        }
    }
}

impl ControllerConfig {
    pub fn budget(&self) -> Budget {
        Budget {
            max_steps: self.max_steps,
            max_wall_time: self.max_wall_time,
        }
    }
}

#[async_trait]
pub trait ControllerObserver: Send + Sync {
    async fn on_transition(&self, session_id: SessionId, from: ControllerState, to: ControllerState);

    async fn on_action_dispatched(&self, _session_id: SessionId, _action: &Action) {}

    async fn on_observation(&self, _session_id: SessionId, _observation: &Observation) {}

    async fn on_session_ended(&self, report: &SessionReport);
}

pub struct NoopObserver;

#[async_trait]
impl ControllerObserver for NoopObserver {
    async fn on_transition(&self, _session_id: SessionId, _from: ControllerState, _to: ControllerState) {}

    async fn on_session_ended(&self, _report: &SessionReport) {}
}

pub struct AgentController {
    thinker: Arc<dyn Thinker>,
    config: ControllerConfig,
    observer: Arc<dyn ControllerObserver>,
}

impl AgentController {
    pub fn new(thinker: Arc<dyn Thinker>, config: ControllerConfig) -> Self {
        Self {
            thinker,
            config,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ControllerObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn observer(&self) -> &Arc<dyn ControllerObserver> {
        &self.observer
    }

    pub fn thinker(&self) -> &Arc<dyn Thinker> {
        &self.thinker
    }

    /// Drive `session` to a terminal state.
    ///
    /// Never returns an error: every way the loop can end is reported in the
    /// [`SessionReport`]. Disposing the runtime and closing the log are left
    /// to the caller so they also happen when this future is dropped.
    pub async fn run(
        &self,
        session: &mut Session,
        cancel: &CancellationToken,
        snapshot: &watch::Sender<SessionSnapshot>,
    ) -> SessionReport {
        let mut run = Run {
            controller: self,
            deadline: Instant::now() + session.budget.max_wall_time,
            started: Instant::now(),
            session,
            cancel,
            snapshot,
            state: ControllerState::Idle,
            loop_guard: LoopGuard::new(self.config.loop_threshold),
            reconnects_left: self.config.reconnect_attempts,
            pending_question: None,
        };
        let ending = run.drive().await;
        run.finish(ending).await
    }
}

/// Err ends the session with the carried outcome.
type Flow = Result<(), Ending>;

#[derive(Debug)]
struct Ending {
    state: ControllerState,
    failure: Option<SessionFailure>,
}

impl Ending {
    fn finished() -> Self {
        Self {
            state: ControllerState::Finished,
            failure: None,
        }
    }

    fn failed(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            state: ControllerState::Failed,
            failure: Some(SessionFailure::new(kind, reason)),
        }
    }

    fn cancelled() -> Self {
        Self {
            state: ControllerState::Cancelled,
            failure: None,
        }
    }
}

enum Thought {
    Act(ActionKind),
    Retry,
    Terminate(TerminationSignal),
}

enum Guarded<T> {
    Done(T),
    Cancelled,
    Deadline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum RejectionKey {
    Action(ActionKind),
    Malformed(String),
}

/// Counts consecutive identical rejections.
struct LoopGuard {
    threshold: u32,
    last: Option<RejectionKey>,
    repeats: u32,
}

impl LoopGuard {
    fn new(threshold: u32) -> Self {
        Self {
            threshold,
            last: None,
            repeats: 0,
        }
    }

    /// Returns `true` once the same rejection has been seen more than
    /// `threshold` times in a row.
    fn record(&mut self, key: RejectionKey) -> bool {
        if self.last.as_ref() == Some(&key) {
            self.repeats += 1;
        } else {
            self.last = Some(key);
            self.repeats = 1;
        }
        self.threshold > 0 && self.repeats > self.threshold
    }

    fn reset(&mut self) {
        self.last = None;
        self.repeats = 0;
    }
}

struct Run<'a> {
    controller: &'a AgentController,
    session: &'a mut Session,
    cancel: &'a CancellationToken,
    snapshot: &'a watch::Sender<SessionSnapshot>,
    state: ControllerState,
    deadline: Instant,
    started: Instant,
    loop_guard: LoopGuard,
    reconnects_left: u32,
    pending_question: Option<PendingQuestion>,
}

impl<'a> Run<'a> {
    async fn drive(&mut self) -> Ending {
        if let Err(e) = self.session.transition(SessionStatus::Running) {
            return Ending::failed(FailureKind::Internal, e.to_string());
        }
        info!(
            session_id = %self.session.id,
            goal = %self.session.goal,
            max_steps = self.session.budget.max_steps,
            "Session started"
        );
        self.enter(ControllerState::Thinking).await;

        loop {
            // Safe point: nothing is in flight.
            if self.cancel.is_cancelled() {
                return Ending::cancelled();
            }

            let kind = match self.think().await {
                Ok(Thought::Act(kind)) => kind,
                Ok(Thought::Retry) => continue,
                Ok(Thought::Terminate(signal)) => {
                    return match signal.outcome {
                        TerminationOutcome::Success => Ending::finished(),
                        TerminationOutcome::GiveUp => Ending::failed(FailureKind::ThinkerTerminated, signal.reason),
                    };
                }
                Err(ending) => return ending,
            };

            if self.cancel.is_cancelled() {
                return Ending::cancelled();
            }
            if let Err(ending) = self.act(kind).await {
                return ending;
            }

            if self.session.steps_exhausted() {
                return Ending::failed(
                    FailureKind::BudgetExhausted,
                    format!("step budget of {} actions exhausted", self.session.budget.max_steps),
                );
            }
            if Instant::now() >= self.deadline {
                return self.wall_clock_exhausted();
            }
            self.enter(ControllerState::Thinking).await;
        }
    }

    async fn think(&mut self) -> Result<Thought, Ending> {
        let controller = self.controller;
        let config = &controller.config;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let history = self.history().await?;
            let context = ThinkingContext {
                session_id: self.session.id,
                goal: &self.session.goal,
                history: config.history_window.apply(&history),
                attempt,
            };
            let call = tokio::time::timeout(config.thinker_timeout, controller.thinker.decide(context));

            let reason = match self.guard(call).await {
                Guarded::Cancelled => return Err(Ending::cancelled()),
                Guarded::Deadline => return Err(self.wall_clock_exhausted()),
                Guarded::Done(Ok(Ok(Decision::Act { action }))) => {
                    return match action.validate() {
                        Ok(()) => Ok(Thought::Act(action)),
                        Err(reason) => self.reject(Some(action), reason).await.map(|_| Thought::Retry),
                    };
                }
                Guarded::Done(Ok(Ok(Decision::Terminate { signal }))) => return Ok(Thought::Terminate(signal)),
                Guarded::Done(Ok(Err(ThinkerError::Malformed(reason)))) => {
                    return self.reject(None, reason).await.map(|_| Thought::Retry);
                }
                Guarded::Done(Ok(Err(ThinkerError::Unavailable(reason)))) => reason,
                Guarded::Done(Err(_)) => format!("thinker did not respond within {:?}", config.thinker_timeout),
            };

            warn!(
                session_id = %self.session.id,
                attempt,
                max_attempts = config.thinker_retry.max_attempts,
                error = %reason,
                "Thinker call failed"
            );
            self.record_error(FailureKind::TransientInfra, reason.clone(), None).await?;

            if !config.thinker_retry.should_retry(attempt) {
                return Err(Ending::failed(
                    FailureKind::TransientInfra,
                    format!("thinker unavailable after {} attempts: {}", attempt, reason),
                ));
            }
            match self.guard(tokio::time::sleep(config.thinker_retry.backoff_after(attempt))).await {
                Guarded::Done(()) => {}
                Guarded::Cancelled => return Err(Ending::cancelled()),
                Guarded::Deadline => return Err(self.wall_clock_exhausted()),
            }
        }
    }

    async fn history(&self) -> Result<Vec<Event>, Ending> {
        let log = self.session.log();
        let result = match self.controller.config.history_window.max_events {
            Some(max) => log.tail(max).await,
            None => log.snapshot(SequenceId::ZERO).await,
        };
        result.map_err(log_failure)
    }

    async fn reject(&mut self, action: Option<ActionKind>, reason: String) -> Flow {
        warn!(session_id = %self.session.id, reason = %reason, "Thinker produced an unusable action");
        self.record_error(FailureKind::ActionRejected, reason.clone(), action.clone())
            .await?;
        let key = match action {
            Some(kind) => RejectionKey::Action(kind),
            None => RejectionKey::Malformed(reason),
        };
        if self.loop_guard.record(key) {
            return Err(self.loop_detected());
        }
        Ok(())
    }

    async fn act(&mut self, kind: ActionKind) -> Flow {
        let action = Action::new(kind);
        self.append(EventSource::Agent, EventPayload::Action(action.clone())).await?;
        self.enter(ControllerState::Acting).await;
        self.session
            .record_step()
            .map_err(|e| Ending::failed(FailureKind::Internal, e.to_string()))?;
        self.publish();

        metrics::counter!("conductor_actions_dispatched_total", "action" => action.kind.name()).increment(1);
        debug!(
            session_id = %self.session.id,
            action_id = %action.action_id,
            action = action.kind.name(),
            step = self.session.step_count(),
            "Dispatching action"
        );
        self.controller
            .observer
            .on_action_dispatched(self.session.id, &action)
            .await;

        match &action.kind {
            ActionKind::FinishTask { summary } => {
                let observation = Observation::new(
                    action.action_id,
                    ObservationKind::Acknowledged {
                        summary: summary.clone(),
                    },
                );
                self.observe(EventSource::System, observation).await?;
                Err(Ending::finished())
            }
            ActionKind::AskUser { question } => self.ask_user(&action, question.clone()).await,
            _ => self.dispatch(&action).await,
        }
    }

    async fn dispatch(&mut self, action: &Action) -> Flow {
        let controller = self.controller;
        let config = &controller.config;
        let runtime = self.session.runtime().clone();
        let started = Instant::now();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let execution = tokio::time::timeout(config.action_timeout, runtime.execute(action));
            tokio::pin!(execution);

            let result = match self.guard(&mut execution).await {
                Guarded::Done(result) => result,
                Guarded::Cancelled => return self.abandon(action, execution.as_mut()).await,
                Guarded::Deadline => {
                    let observation = Observation::error(
                        action.action_id,
                        ObservationErrorKind::Timeout,
                        "session wall-clock budget exhausted while the action was running",
                    );
                    self.observe(EventSource::System, observation).await?;
                    return Err(self.wall_clock_exhausted());
                }
            };
            metrics::histogram!("conductor_action_duration_seconds", "action" => action.kind.name())
                .record(started.elapsed().as_secs_f64());

            let error = match result {
                Ok(Ok(observation)) => {
                    let timed_out = matches!(
                        observation.kind,
                        ObservationKind::Error {
                            error: ObservationErrorKind::Timeout,
                            ..
                        }
                    );
                    self.loop_guard.reset();
                    self.observe(EventSource::Runtime, observation).await?;
                    return if timed_out {
                        self.after_timeout(runtime.as_ref()).await
                    } else {
                        Ok(())
                    };
                }
                Ok(Err(error)) => error,
                Err(_) => RuntimeError::ExecutionTimeout(format!(
                    "no response within {:?}",
                    config.action_timeout
                )),
            };

            match error {
                RuntimeError::ActionRejected(reason) => {
                    let observation = Observation::error(action.action_id, ObservationErrorKind::Rejected, reason);
                    self.observe(EventSource::Runtime, observation).await?;
                    if self.loop_guard.record(RejectionKey::Action(action.kind.clone())) {
                        return Err(self.loop_detected());
                    }
                    return Ok(());
                }
                RuntimeError::ExecutionTimeout(reason) => {
                    warn!(session_id = %self.session.id, action_id = %action.action_id, reason = %reason, "Action timed out");
                    self.loop_guard.reset();
                    let observation = Observation::error(action.action_id, ObservationErrorKind::Timeout, reason);
                    self.observe(EventSource::Runtime, observation).await?;
                    return self.after_timeout(runtime.as_ref()).await;
                }
                RuntimeError::EnvironmentUnavailable(reason) => {
                    self.loop_guard.reset();
                    let observation =
                        Observation::error(action.action_id, ObservationErrorKind::Unavailable, reason.clone());
                    self.observe(EventSource::Runtime, observation).await?;
                    return self.reconnect(runtime.as_ref(), reason).await;
                }
                RuntimeError::Transient(reason) => {
                    warn!(
                        session_id = %self.session.id,
                        action_id = %action.action_id,
                        attempt,
                        max_attempts = config.runtime_retry.max_attempts,
                        error = %reason,
                        "Runtime temporarily unreachable"
                    );
                    if !config.runtime_retry.should_retry(attempt) {
                        let reason = format!("runtime unreachable after {} attempts: {}", attempt, reason);
                        let observation =
                            Observation::error(action.action_id, ObservationErrorKind::Failed, reason.clone());
                        self.observe(EventSource::System, observation).await?;
                        return Err(Ending::failed(FailureKind::TransientInfra, reason));
                    }
                    let backoff = config.runtime_retry.backoff_after(attempt);
                    match self.guard(tokio::time::sleep(backoff)).await {
                        Guarded::Done(()) => {}
                        Guarded::Cancelled => {
                            let observation = Observation::error(
                                action.action_id,
                                ObservationErrorKind::Abandoned,
                                "session cancelled while retrying the action",
                            );
                            self.observe(EventSource::System, observation).await?;
                            return Err(Ending::cancelled());
                        }
                        Guarded::Deadline => {
                            let observation = Observation::error(
                                action.action_id,
                                ObservationErrorKind::Timeout,
                                "session wall-clock budget exhausted while retrying the action",
                            );
                            self.observe(EventSource::System, observation).await?;
                            return Err(self.wall_clock_exhausted());
                        }
                    }
                }
            }
        }
    }

    /// Cancellation arrived mid-action: give the action `cancel_grace` to
    /// resolve, otherwise record it as abandoned.
    async fn abandon<F>(&mut self, action: &Action, execution: Pin<&mut F>) -> Flow
    where
        F: Future<Output = Result<Result<Observation, RuntimeError>, Elapsed>>,
    {
        let grace = self.controller.config.cancel_grace;
        info!(
            session_id = %self.session.id,
            action_id = %action.action_id,
            grace = ?grace,
            "Cancellation requested while an action is in flight"
        );
        let observation = match tokio::time::timeout(grace, execution).await {
            Ok(Ok(Ok(observation))) => observation,
            Ok(Ok(Err(error))) => error_observation(action, &error),
            Ok(Err(_)) => Observation::error(
                action.action_id,
                ObservationErrorKind::Timeout,
                "action timed out during cancellation",
            ),
            Err(_) => Observation::error(
                action.action_id,
                ObservationErrorKind::Abandoned,
                format!("action abandoned after {:?} cancellation grace period", grace),
            ),
        };
        self.observe(EventSource::System, observation).await?;
        Err(Ending::cancelled())
    }

    async fn after_timeout(&mut self, runtime: &dyn Runtime) -> Flow {
        if !self.controller.config.reset_on_timeout {
            return Ok(());
        }
        info!(session_id = %self.session.id, "Resetting runtime after timeout");
        runtime.reset().await.map_err(|e| {
            Ending::failed(
                FailureKind::EnvironmentUnavailable,
                format!("runtime reset after timeout failed: {}", e),
            )
        })
    }

    async fn reconnect(&mut self, runtime: &dyn Runtime, reason: String) -> Flow {
        if self.reconnects_left == 0 {
            return Err(Ending::failed(FailureKind::EnvironmentUnavailable, reason));
        }
        self.reconnects_left -= 1;
        warn!(
            session_id = %self.session.id,
            reconnects_left = self.reconnects_left,
            reason = %reason,
            "Execution environment lost, resetting runtime"
        );
        runtime.reset().await.map_err(|e| {
            Ending::failed(
                FailureKind::EnvironmentUnavailable,
                format!("{}; reset failed: {}", reason, e),
            )
        })
    }

    async fn ask_user(&mut self, action: &Action, question: String) -> Flow {
        self.enter(ControllerState::Observing).await;

        // Subscribe before publishing the question so a fast reply is not missed.
        let log = self.session.log().clone();
        let mut replies = log.subscribe_from(SequenceId(log.len()));
        self.pending_question = Some(PendingQuestion {
            action_id: action.action_id,
            question,
        });
        self.enter(ControllerState::AwaitingUser).await;
        info!(session_id = %self.session.id, action_id = %action.action_id, "Waiting for user input");

        let reply = loop {
            match self.guard(replies.next()).await {
                Guarded::Done(Some(Ok(event))) => {
                    if let Some(observation) = event.as_observation() {
                        if observation.action_id == action.action_id {
                            break observation.clone();
                        }
                    }
                }
                Guarded::Done(Some(Err(e))) => return Err(log_failure(e)),
                Guarded::Done(None) => {
                    return Err(Ending::failed(
                        FailureKind::ClosedLog,
                        "event log closed while awaiting user input",
                    ));
                }
                Guarded::Cancelled => {
                    self.pending_question = None;
                    let observation = Observation::error(
                        action.action_id,
                        ObservationErrorKind::Abandoned,
                        "question withdrawn: session cancelled",
                    );
                    self.append(EventSource::System, EventPayload::Observation(observation)).await?;
                    return Err(Ending::cancelled());
                }
                Guarded::Deadline => {
                    self.pending_question = None;
                    let observation = Observation::error(
                        action.action_id,
                        ObservationErrorKind::Timeout,
                        "no user response before the wall-clock budget ran out",
                    );
                    self.append(EventSource::System, EventPayload::Observation(observation)).await?;
                    return Err(self.wall_clock_exhausted());
                }
            }
        };

        self.pending_question = None;
        self.loop_guard.reset();
        self.publish();
        self.controller.observer.on_observation(self.session.id, &reply).await;
        Ok(())
    }

    /// Append an observation and move to `Observing`.
    async fn observe(&mut self, source: EventSource, observation: Observation) -> Flow {
        self.append(source, EventPayload::Observation(observation.clone())).await?;
        self.enter(ControllerState::Observing).await;
        self.controller
            .observer
            .on_observation(self.session.id, &observation)
            .await;
        Ok(())
    }

    async fn record_error(&mut self, kind: FailureKind, message: String, action: Option<ActionKind>) -> Flow {
        let record = ErrorRecord { kind, message, action };
        self.append(EventSource::System, EventPayload::Error(record)).await
    }

    async fn append(&self, source: EventSource, payload: EventPayload) -> Flow {
        self.session
            .log()
            .append(source, payload)
            .await
            .map(|_| ())
            .map_err(log_failure)
    }

    /// Race `future` against cancellation and the session deadline.
    async fn guard<F: Future>(&self, future: F) -> Guarded<F::Output> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Guarded::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => Guarded::Deadline,
            output = future => Guarded::Done(output),
        }
    }

    async fn enter(&mut self, to: ControllerState) {
        let from = self.state;
        if from == to {
            return;
        }
        if !from.can_transition_to(to) {
            warn!(session_id = %self.session.id, from = ?from, to = ?to, "Unexpected controller transition");
        }
        self.state = to;

        let status = to.session_status();
        if let Err(e) = self.session.transition(status) {
            warn!(session_id = %self.session.id, error = %e, "Session status out of step with controller");
        }
        self.publish();
        debug!(session_id = %self.session.id, from = ?from, to = ?to, "Controller transition");
        self.controller
            .observer
            .on_transition(self.session.id, from, to)
            .await;
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            status: self.session.status(),
            state: self.state,
            step_count: self.session.step_count(),
            pending_question: self.pending_question.clone(),
        });
    }

    fn wall_clock_exhausted(&self) -> Ending {
        Ending::failed(
            FailureKind::BudgetExhausted,
            format!(
                "wall-clock budget of {:?} exhausted",
                self.session.budget.max_wall_time
            ),
        )
    }

    fn loop_detected(&self) -> Ending {
        Ending::failed(
            FailureKind::LoopDetected,
            format!(
                "the same action was rejected more than {} times in a row",
                self.controller.config.loop_threshold
            ),
        )
    }

    async fn finish(mut self, ending: Ending) -> SessionReport {
        let Ending { state, failure } = ending;
        let recent = if state == ControllerState::Finished {
            Vec::new()
        } else {
            self.session
                .log()
                .tail(self.controller.config.failure_context_events)
                .await
                .unwrap_or_default()
        };
        let failure = match (state, failure) {
            (_, Some(failure)) => Some(failure.with_context(recent)),
            (ControllerState::Cancelled, None) => {
                let reason = cancel_reason(&recent).unwrap_or_else(|| "cancelled".to_string());
                Some(SessionFailure::new(FailureKind::Cancelled, reason).with_context(recent))
            }
            _ => None,
        };

        self.pending_question = None;
        self.enter(state).await;

        let report = SessionReport {
            session_id: self.session.id,
            goal: self.session.goal.clone(),
            status: self.session.status(),
            step_count: self.session.step_count(),
            elapsed: self.started.elapsed(),
            failure,
        };

        metrics::counter!("conductor_sessions_terminal_total", "status" => report.status.as_str()).increment(1);
        match &report.failure {
            None => info!(
                session_id = %report.session_id,
                steps = report.step_count,
                elapsed = ?report.elapsed,
                "Session finished"
            ),
            Some(failure) => warn!(
                session_id = %report.session_id,
                status = %report.status,
                kind = %failure.kind,
                reason = %failure.reason,
                steps = report.step_count,
                "Session ended without finishing"
            ),
        }
        self.controller.observer.on_session_ended(&report).await;
        report
    }
}

fn log_failure(error: EventLogError) -> Ending {
    match error {
        EventLogError::Closed { session_id } => Ending::failed(
            FailureKind::ClosedLog,
            format!("event log for session {} was closed under the controller", session_id),
        ),
        EventLogError::Store(e) => Ending::failed(FailureKind::Internal, format!("event store failure: {}", e)),
    }
}

fn error_observation(action: &Action, error: &RuntimeError) -> Observation {
    let (kind, message) = match error {
        RuntimeError::ActionRejected(m) => (ObservationErrorKind::Rejected, m),
        RuntimeError::ExecutionTimeout(m) => (ObservationErrorKind::Timeout, m),
        RuntimeError::EnvironmentUnavailable(m) => (ObservationErrorKind::Unavailable, m),
        RuntimeError::Transient(m) => (ObservationErrorKind::Failed, m),
    };
    Observation::error(action.action_id, kind, message.clone())
}

fn cancel_reason(events: &[Event]) -> Option<String> {
    events.iter().rev().find_map(|event| match &event.payload {
        EventPayload::Control(ControlSignal::Cancel { reason }) => {
            Some(reason.clone().unwrap_or_else(|| "cancelled".to_string()))
        }
        _ => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_machine_edges() {
        use ControllerState::*;
        assert!(Idle.can_transition_to(Thinking));
        assert!(Thinking.can_transition_to(Acting));
        assert!(Acting.can_transition_to(Observing));
        assert!(Observing.can_transition_to(AwaitingUser));
        assert!(AwaitingUser.can_transition_to(Thinking));
        assert!(Observing.can_transition_to(Finished));

        assert!(!Acting.can_transition_to(Thinking));
        assert!(!AwaitingUser.can_transition_to(Finished));
        for state in [Idle, Thinking, Acting, Observing, AwaitingUser] {
            assert!(state.can_transition_to(Cancelled), "{:?} must be cancellable", state);
        }
        for state in [Finished, Failed, Cancelled] {
            assert!(!state.can_transition_to(Thinking));
            assert!(!state.can_transition_to(Cancelled));
        }
    }

    #[test]
    fn test_loop_guard_trips_after_threshold() {
        let mut guard = LoopGuard::new(3);
        let key = || {
            RejectionKey::Action(ActionKind::RunCommand {
                command: "rm -rf /".to_string(),
                cwd: None,
            })
        };
        assert!(!guard.record(key()));
        assert!(!guard.record(key()));
        assert!(!guard.record(key()));
        assert!(guard.record(key()));

        guard.reset();
        assert!(!guard.record(key()));
        assert!(!guard.record(RejectionKey::Malformed("x".to_string())));
        assert!(!guard.record(key()));
    }

    #[test]
    fn test_loop_guard_disabled() {
        let mut guard = LoopGuard::new(0);
        for _ in 0..10 {
            assert!(!guard.record(RejectionKey::Malformed("x".to_string())));
        }
    }

    #[test]
    fn test_config_yaml_defaults() {
        let config: ControllerConfig =
            serde_yaml::from_str("max_steps: 7\ncancel_grace: 250ms\nloop_threshold: 2\n").unwrap();
        assert_eq!(config.max_steps, 7);
        assert_eq!(config.cancel_grace, Duration::from_millis(250));
        assert_eq!(config.loop_threshold, 2);
        assert_eq!(config.thinker_timeout, Duration::from_secs(60));
        assert_eq!(config.budget().max_steps, 7);
    }
}
