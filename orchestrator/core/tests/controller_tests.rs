// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Integration tests for the agent control loop, driven end to end through
//! `SessionHandle` with a scripted thinker and a mock runtime.

mod common;

use async_trait::async_trait;
use common::*;
use conductor_core::application::{SessionHandle, SessionHandleError};
use conductor_core::domain::controller::{AgentController, ControllerState};
use conductor_core::domain::event_log::EventLog;
use conductor_core::domain::events::{
    ActionKind, ControlSignal, EventKind, EventPayload, EventSource, ObservationErrorKind, ObservationKind,
    SequenceId, SessionId,
};
use conductor_core::domain::failure::FailureKind;
use conductor_core::domain::lifecycle::SessionLifecycleEvent;
use conductor_core::domain::policy::RetryPolicy;
use conductor_core::domain::runtime::RuntimeError;
use conductor_core::domain::session::{Session, SessionStatus};
use conductor_core::domain::thinker::{Decision, Thinker, ThinkerError, ThinkingContext};
use conductor_core::infrastructure::event_bus::{DomainEvent, EventBus, EventBusObserver};
use conductor_core::infrastructure::{InMemoryEventStore, ScriptedThinker};
use std::sync::Arc;
use std::time::Duration;

/// Thinker that never answers.
struct SilentThinker;

#[async_trait]
impl Thinker for SilentThinker {
    async fn decide(&self, _context: ThinkingContext<'_>) -> Result<Decision, ThinkerError> {
        std::future::pending().await
    }
}

fn failure_kind(report: &conductor_core::domain::session::SessionReport) -> FailureKind {
    report.failure.as_ref().expect("report should carry a failure").kind
}

#[tokio::test]
async fn test_finish_task_in_one_cycle() {
    let runtime = Arc::new(MockRuntime::new());
    let thinker = ScriptedThinker::new(vec![Decision::act(finish("nothing to do"))]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert!(report.is_success());
    assert!(report.failure.is_none());
    assert_eq!(report.step_count, 1);

    let events = events(&handle).await;
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, EventKind::Action);
    assert_eq!(events[0].source, EventSource::Agent);
    assert_eq!(
        events[1].as_observation().unwrap().kind,
        ObservationKind::Acknowledged {
            summary: "nothing to do".to_string()
        }
    );
    assert!(runtime.executed().is_empty(), "finish_task never reaches the runtime");
    assert_eq!(runtime.disposals(), 1);
    assert!(handle.log().is_closed());
    assert_eq!(handle.snapshot().state, ControllerState::Finished);
}

#[tokio::test]
async fn test_terminate_signal_without_actions() {
    let runtime = Arc::new(MockRuntime::new());
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::finish("already done")]),
        runtime.clone(),
        fast_config(),
    )
    .await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(report.step_count, 0);
    assert!(events(&handle).await.is_empty());

    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::give_up("cannot be done")]),
        Arc::new(MockRuntime::new()),
        fast_config(),
    )
    .await;
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(failure_kind(&report), FailureKind::ThinkerTerminated);
    assert_eq!(report.failure.unwrap().reason, "cannot be done");
}

#[tokio::test]
async fn test_three_actions_produce_six_ordered_events() {
    let runtime = Arc::new(MockRuntime::new().then(MockStep::Observe(command_ok("src\n"))).then(
        MockStep::Observe(ObservationKind::FileContent {
            path: "README.md".to_string(),
            content: "# hello".to_string(),
        }),
    ));
    let thinker = ScriptedThinker::new(vec![
        Decision::act(run("ls")),
        Decision::act(ActionKind::ReadFile {
            path: "README.md".to_string(),
            start_line: None,
            end_line: None,
        }),
        Decision::act(finish("read the readme")),
    ]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(report.step_count, 3);

    let events = events(&handle).await;
    assert_eq!(events.len(), 6);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_id, SequenceId(i as u64));
        assert_eq!(event.session_id, handle.id());
        let expected = if i % 2 == 0 { EventKind::Action } else { EventKind::Observation };
        assert_eq!(event.kind, expected, "event {}", i);
    }
    for pair in events.chunks(2) {
        let action = pair[0].as_action().unwrap();
        let observation = pair[1].as_observation().unwrap();
        assert_eq!(observation.action_id, action.action_id);
    }
    assert_eq!(runtime.executed().len(), 2);
}

#[tokio::test]
async fn test_repeated_rejection_is_detected_as_loop() {
    let runtime = Arc::new(
        MockRuntime::new().by_default(MockStep::Fail(RuntimeError::ActionRejected("denied".to_string()))),
    );
    let thinker = ScriptedThinker::new(vec![]).when_exhausted(Decision::act(run("rm -rf /")));
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(failure_kind(&report), FailureKind::LoopDetected);
    // threshold 3: the fourth identical rejection ends the session
    assert_eq!(runtime.executed().len(), 4);
    assert_eq!(report.step_count, 4);

    let events = events(&handle).await;
    assert_eq!(events.len(), 8);
    let rejected = events
        .iter()
        .filter_map(|e| e.as_observation())
        .filter(|o| {
            matches!(
                o.kind,
                ObservationKind::Error {
                    error: ObservationErrorKind::Rejected,
                    ..
                }
            )
        })
        .count();
    assert_eq!(rejected, 4);
    assert!(!report.failure.unwrap().recent_events.is_empty());
}

#[tokio::test]
async fn test_malformed_thinker_output_is_recorded_and_looped() {
    let thinker = ScriptedThinker::with_outcomes(vec![
        Err(ThinkerError::Malformed("not json".to_string())),
        Ok(Decision::act(finish("recovered"))),
    ]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);

    let events = events(&handle).await;
    match &events[0].payload {
        EventPayload::Error(record) => {
            assert_eq!(record.kind, FailureKind::ActionRejected);
            assert!(record.message.contains("not json"));
        }
        other => panic!("expected an error record, got {:?}", other),
    }

    let thinker = ScriptedThinker::with_outcomes(vec![Err(ThinkerError::Malformed("not json".to_string())); 4]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;
    let report = handle.wait().await;
    assert_eq!(failure_kind(&report), FailureKind::LoopDetected);
    assert_eq!(report.step_count, 0);
    assert_eq!(common::events(&handle).await.len(), 4);
}

#[tokio::test]
async fn test_invalid_action_is_rejected_before_dispatch() {
    let runtime = Arc::new(MockRuntime::new());
    let thinker = ScriptedThinker::new(vec![Decision::act(run("   ")), Decision::act(finish("ok"))]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert!(runtime.executed().is_empty());

    let events = events(&handle).await;
    match &events[0].payload {
        EventPayload::Error(record) => {
            assert_eq!(record.kind, FailureKind::ActionRejected);
            assert_eq!(record.action, Some(run("   ")));
        }
        other => panic!("expected an error record, got {:?}", other),
    }
}

#[tokio::test]
async fn test_thinker_unavailable_is_retried() {
    let thinker = ScriptedThinker::with_outcomes(vec![
        Err(ThinkerError::Unavailable("503".to_string())),
        Err(ThinkerError::Unavailable("503".to_string())),
        Ok(Decision::finish("third time lucky")),
    ]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    let events = events(&handle).await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| matches!(
        &e.payload,
        EventPayload::Error(record) if record.kind == FailureKind::TransientInfra
    )));
}

#[tokio::test]
async fn test_thinker_retries_exhausted() {
    let thinker = ScriptedThinker::with_outcomes(vec![Err(ThinkerError::Unavailable("down".to_string())); 5]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(failure_kind(&report), FailureKind::TransientInfra);
    assert_eq!(events(&handle).await.len(), 3);
}

#[tokio::test]
async fn test_thinker_timeout_counts_as_unavailable() {
    let mut config = fast_config();
    config.thinker_timeout = Duration::from_millis(20);
    config.thinker_retry = RetryPolicy::none();
    let handle = spawn_session(SilentThinker, Arc::new(MockRuntime::new()), config).await;

    let report = handle.wait().await;
    assert_eq!(failure_kind(&report), FailureKind::TransientInfra);
    assert!(report.failure.unwrap().reason.contains("did not respond"));
}

#[tokio::test]
async fn test_step_budget_exhausted() {
    let mut config = fast_config();
    config.max_steps = 2;
    let runtime = Arc::new(MockRuntime::new());
    let thinker = ScriptedThinker::new(vec![]).when_exhausted(Decision::act(run("cargo build")));
    let handle = spawn_session(thinker, runtime.clone(), config).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(failure_kind(&report), FailureKind::BudgetExhausted);
    assert_eq!(report.step_count, 2);
    assert_eq!(runtime.executed().len(), 2);
    assert_eq!(events(&handle).await.len(), 4);
}

#[tokio::test]
async fn test_wall_clock_budget_ends_hanging_action() {
    let mut config = fast_config();
    config.max_wall_time = Duration::from_millis(100);
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Hang));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("sleep infinity"))]),
        runtime,
        config,
    )
    .await;

    let report = handle.wait().await;
    assert_eq!(failure_kind(&report), FailureKind::BudgetExhausted);
    let events = events(&handle).await;
    assert_eq!(events.len(), 2);
    assert!(matches!(
        events[1].as_observation().unwrap().kind,
        ObservationKind::Error {
            error: ObservationErrorKind::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_action_timeout_resets_runtime_when_configured() {
    let mut config = fast_config();
    config.action_timeout = Duration::from_millis(30);
    config.reset_on_timeout = true;
    let runtime = Arc::new(MockRuntime::new().then(MockStep::Hang));
    let thinker = ScriptedThinker::new(vec![Decision::act(run("yes")), Decision::act(finish("moved on"))]);
    let handle = spawn_session(thinker, runtime.clone(), config).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(runtime.resets(), 1);
    let events = events(&handle).await;
    assert!(matches!(
        events[1].as_observation().unwrap().kind,
        ObservationKind::Error {
            error: ObservationErrorKind::Timeout,
            ..
        }
    ));
}

#[tokio::test]
async fn test_transient_runtime_failure_is_retried() {
    let runtime = Arc::new(
        MockRuntime::new()
            .then(MockStep::Fail(RuntimeError::Transient("connection reset".to_string())))
            .then(MockStep::Fail(RuntimeError::Transient("connection reset".to_string()))),
    );
    let thinker = ScriptedThinker::new(vec![Decision::act(run("make")), Decision::act(finish("built"))]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(runtime.executed().len(), 3);
    let events = events(&handle).await;
    // Retries are invisible in the log: one action, one observation.
    assert_eq!(events.len(), 4);
    assert_eq!(events[1].as_observation().unwrap().kind, command_ok("ok"));

    let runtime = Arc::new(
        MockRuntime::new().by_default(MockStep::Fail(RuntimeError::Transient("down".to_string()))),
    );
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("make"))]),
        runtime.clone(),
        fast_config(),
    )
    .await;
    let report = handle.wait().await;
    assert_eq!(failure_kind(&report), FailureKind::TransientInfra);
    assert_eq!(runtime.executed().len(), 3);
}

#[tokio::test]
async fn test_lost_environment_is_reset_then_fails() {
    let runtime = Arc::new(MockRuntime::new().then(MockStep::Fail(RuntimeError::EnvironmentUnavailable(
        "container exited".to_string(),
    ))));
    let thinker = ScriptedThinker::new(vec![
        Decision::act(run("make")),
        Decision::act(run("make")),
        Decision::act(finish("done")),
    ]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(runtime.resets(), 1);

    let mut config = fast_config();
    config.reconnect_attempts = 0;
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Fail(
        RuntimeError::EnvironmentUnavailable("container exited".to_string()),
    )));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("make"))]),
        runtime.clone(),
        config,
    )
    .await;
    let report = handle.wait().await;
    assert_eq!(failure_kind(&report), FailureKind::EnvironmentUnavailable);
    assert_eq!(runtime.resets(), 0);
}

#[tokio::test]
async fn test_cancel_while_acting_abandons_action() {
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Hang));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("sleep 600"))]),
        runtime.clone(),
        fast_config(),
    )
    .await;

    wait_for_state(&handle, |s| s.state == ControllerState::Acting).await;
    assert!(handle.cancel(Some("user stop".to_string())).await.unwrap());
    assert!(!handle.cancel(None).await.unwrap());

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Cancelled);
    let failure = report.failure.unwrap();
    assert_eq!(failure.kind, FailureKind::Cancelled);
    assert_eq!(failure.reason, "user stop");

    let events = events(&handle).await;
    assert_eq!(events.len(), 3);
    let action = events[0].as_action().unwrap();
    assert!(events[1].is_cancel_signal());
    assert_eq!(events[1].source, EventSource::User);
    let observation = events[2].as_observation().unwrap();
    assert_eq!(observation.action_id, action.action_id);
    assert!(matches!(
        observation.kind,
        ObservationKind::Error {
            error: ObservationErrorKind::Abandoned,
            ..
        }
    ));
    assert_eq!(runtime.disposals(), 1);
    assert!(!handle.cancel(None).await.unwrap());
}

#[tokio::test]
async fn test_cancel_grace_lets_action_finish() {
    let mut config = fast_config();
    config.cancel_grace = Duration::from_secs(5);
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Slow(Duration::from_millis(100))));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("sleep 0.1"))]),
        runtime,
        config,
    )
    .await;

    wait_for_state(&handle, |s| s.state == ControllerState::Acting).await;
    handle.cancel(None).await.unwrap();
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Cancelled);

    let events = events(&handle).await;
    assert_eq!(events.last().unwrap().as_observation().unwrap().kind, command_ok("slow"));
}

#[tokio::test]
async fn test_cancel_while_thinking() {
    let handle = spawn_session(SilentThinker, Arc::new(MockRuntime::new()), fast_config()).await;
    wait_for_state(&handle, |s| s.state == ControllerState::Thinking).await;

    handle.cancel(None).await.unwrap();
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(report.step_count, 0);

    let events = events(&handle).await;
    assert_eq!(events.len(), 1);
    assert_eq!(
        events[0].payload,
        EventPayload::Control(ControlSignal::Cancel { reason: None })
    );
}

#[tokio::test]
async fn test_ask_user_waits_for_response() {
    let runtime = Arc::new(MockRuntime::new());
    let thinker = ScriptedThinker::new(vec![
        Decision::act(ActionKind::AskUser {
            question: "Which colour?".to_string(),
        }),
        Decision::act(finish("painted it")),
    ]);
    let handle = spawn_session(thinker, runtime.clone(), fast_config()).await;

    wait_for_state(&handle, |s| s.pending_question.is_some()).await;
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.status, SessionStatus::AwaitingInput);
    assert_eq!(snapshot.state, ControllerState::AwaitingUser);
    assert_eq!(snapshot.pending_question.unwrap().question, "Which colour?");

    handle.respond("blue").await.unwrap();
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);

    let events = events(&handle).await;
    assert_eq!(events.len(), 4);
    assert_eq!(events[1].source, EventSource::User);
    assert_eq!(
        events[1].as_observation().unwrap().kind,
        ObservationKind::UserResponse {
            text: "blue".to_string()
        }
    );
    assert_eq!(
        events[1].as_observation().unwrap().action_id,
        events[0].as_action().unwrap().action_id
    );
    assert!(runtime.executed().is_empty());
    assert!(matches!(
        handle.respond("late").await,
        Err(SessionHandleError::NoPendingQuestion(_))
    ));
}

#[tokio::test]
async fn test_concurrent_responses_answer_once() {
    let thinker = ScriptedThinker::new(vec![
        Decision::act(ActionKind::AskUser {
            question: "Which colour?".to_string(),
        }),
        Decision::act(finish("painted it")),
    ]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;
    wait_for_state(&handle, |s| s.pending_question.is_some()).await;

    let (first, second) = tokio::join!(handle.respond("red"), handle.respond("green"));
    assert!(first.is_ok() != second.is_ok(), "exactly one answer is accepted");
    let rejected = if first.is_err() { first } else { second };
    assert!(matches!(rejected, Err(SessionHandleError::NoPendingQuestion(_))));

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    let events = events(&handle).await;
    assert_eq!(events.len(), 4);
    assert_every_action_observed(&events);
}

#[tokio::test]
async fn test_force_terminate_still_cleans_up() {
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Hang));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("sleep 600"))]),
        runtime.clone(),
        fast_config(),
    )
    .await;
    wait_for_state(&handle, |s| s.state == ControllerState::Acting).await;

    handle.force_terminate();
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(failure_kind(&report), FailureKind::Cancelled);
    assert_eq!(report.step_count, 1);
    assert_eq!(runtime.disposals(), 1);
    assert!(handle.log().is_closed());
    assert_eq!(handle.status(), SessionStatus::Cancelled);

    let events = events(&handle).await;
    assert_eq!(events.len(), 2);
    assert_every_action_observed(&events);
    assert!(matches!(
        events[1].as_observation().unwrap().kind,
        ObservationKind::Error {
            error: ObservationErrorKind::Abandoned,
            ..
        }
    ));
}

#[tokio::test]
async fn test_force_terminate_while_awaiting_user() {
    let thinker = ScriptedThinker::new(vec![Decision::act(ActionKind::AskUser {
        question: "anyone there?".to_string(),
    })]);
    let handle = spawn_session(thinker, Arc::new(MockRuntime::new()), fast_config()).await;
    wait_for_state(&handle, |s| s.pending_question.is_some()).await;

    handle.force_terminate();
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_every_action_observed(&events(&handle).await);
}

#[tokio::test]
async fn test_hung_dispose_does_not_block_wait() {
    let mut config = fast_config();
    config.dispose_timeout = Duration::from_millis(50);
    let runtime = Arc::new(MockRuntime::new().by_default(MockStep::Hang).hang_on_dispose());
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("sleep 600"))]),
        runtime.clone(),
        config,
    )
    .await;
    wait_for_state(&handle, |s| s.state == ControllerState::Acting).await;

    handle.force_terminate();
    let report = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("wait must not hang on dispose");
    assert_eq!(report.status, SessionStatus::Cancelled);
    assert_eq!(runtime.disposals(), 1);
    assert!(handle.log().is_closed());
}

#[tokio::test]
async fn test_panicking_runtime_fails_session() {
    let runtime = Arc::new(MockRuntime::new().then(MockStep::Panic));
    let handle = spawn_session(
        ScriptedThinker::new(vec![Decision::act(run("boom"))]),
        runtime.clone(),
        fast_config(),
    )
    .await;

    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Failed);
    assert_eq!(failure_kind(&report), FailureKind::Internal);
    assert_eq!(runtime.disposals(), 1);
    assert!(handle.log().is_closed());

    let events = events(&handle).await;
    assert_eq!(events.len(), 2);
    assert_every_action_observed(&events);
}

#[tokio::test]
async fn test_subscribers_see_gapless_history() {
    let runtime = Arc::new(MockRuntime::new());
    let mut steps: Vec<Decision> = (0..20).map(|i| Decision::act(run(&format!("echo {}", i)))).collect();
    steps.push(Decision::act(finish("done")));
    let handle = spawn_session(ScriptedThinker::new(steps), runtime, fast_config()).await;

    let fast = tokio::spawn({
        let mut subscription = handle.subscribe();
        async move {
            let mut seen = Vec::new();
            while let Some(event) = subscription.next().await {
                seen.push(event.unwrap().sequence_id.value());
            }
            seen
        }
    });
    let slow = tokio::spawn({
        let mut subscription = handle.subscribe();
        async move {
            let mut seen = Vec::new();
            while let Some(event) = subscription.next().await {
                tokio::time::sleep(Duration::from_millis(1)).await;
                seen.push(event.unwrap().sequence_id.value());
            }
            seen
        }
    });

    handle.wait().await;
    let expected: Vec<u64> = (0..42).collect();
    assert_eq!(fast.await.unwrap(), expected);
    assert_eq!(slow.await.unwrap(), expected);
}

#[tokio::test]
async fn test_lifecycle_events_published_on_bus() {
    let bus = EventBus::new(256);
    let mut receiver = bus.subscribe();

    let store = Arc::new(InMemoryEventStore::new());
    let log = Arc::new(EventLog::open(SessionId::new(), store).await.unwrap());
    let config = fast_config();
    let session = Session::new("goal", config.budget(), log, Arc::new(MockRuntime::new()));
    let controller = Arc::new(
        AgentController::new(
            Arc::new(ScriptedThinker::new(vec![Decision::act(finish("done"))])),
            config,
        )
        .with_observer(Arc::new(EventBusObserver::new(bus.clone()))),
    );
    let handle = SessionHandle::spawn(controller, session);
    handle.wait().await;

    let mut transitions = Vec::new();
    let mut ended = None;
    while let Ok(event) = receiver.try_recv() {
        match event {
            DomainEvent::Session(SessionLifecycleEvent::StateChanged { to, .. }) => transitions.push(to),
            DomainEvent::Session(SessionLifecycleEvent::SessionEnded { status, .. }) => ended = Some(status),
            _ => {}
        }
    }
    assert_eq!(
        transitions,
        vec![
            ControllerState::Thinking,
            ControllerState::Acting,
            ControllerState::Observing,
            ControllerState::Finished,
        ]
    );
    assert_eq!(ended, Some(SessionStatus::Finished));
}

#[tokio::test]
async fn test_thinker_state_released_when_session_ends() {
    let thinker = Arc::new(ScriptedThinker::new(vec![Decision::act(run("ls")), Decision::act(finish("done"))]));
    let store = Arc::new(InMemoryEventStore::new());
    let log = Arc::new(EventLog::open(SessionId::new(), store).await.unwrap());
    let config = fast_config();
    let session = Session::new("goal", config.budget(), log, Arc::new(MockRuntime::new()));
    let controller = Arc::new(AgentController::new(thinker.clone(), config));

    let handle = SessionHandle::spawn(controller, session);
    let report = handle.wait().await;
    assert_eq!(report.status, SessionStatus::Finished);
    assert_eq!(thinker.tracked_sessions(), 0);
}
