// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus Implementation - Pub/Sub for lifecycle notifications
//
// In-memory fan-out over tokio broadcast channels, used by the CLI for live
// progress and by anything else that wants to watch sessions without owning
// them. Slow receivers lag and drop; a session's EventLog stays the only
// authoritative record.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::domain::controller::{ControllerObserver, ControllerState};
use crate::domain::events::{Action, SessionId};
use crate::domain::lifecycle::{SessionLifecycleEvent, SwarmEvent};
use crate::domain::session::SessionReport;

/// Unified event type for the event bus
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Session(SessionLifecycleEvent),
    Swarm(SwarmEvent),
}

/// Event bus for publishing and subscribing to lifecycle events
#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl EventBus {
    /// Capacity bounds how many events are buffered per receiver before the
    /// oldest are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(1000)
    }

    pub fn publish_session_event(&self, event: SessionLifecycleEvent) {
        self.publish(DomainEvent::Session(event));
    }

    pub fn publish_swarm_event(&self, event: SwarmEvent) {
        self.publish(DomainEvent::Swarm(event));
    }

    fn publish(&self, event: DomainEvent) {
        // send() only fails when nobody is listening
        if self.sender.send(event).is_err() {
            debug!("No subscribers listening to event");
        }
    }

    pub fn subscribe(&self) -> EventReceiver {
        EventReceiver {
            receiver: self.sender.subscribe(),
        }
    }

    /// Receiver that only yields events about one session.
    pub fn subscribe_session(&self, session_id: SessionId) -> SessionEventReceiver {
        SessionEventReceiver {
            receiver: self.sender.subscribe(),
            session_id,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_default_capacity()
    }
}

fn map_recv_error(e: broadcast::error::RecvError) -> EventBusError {
    match e {
        broadcast::error::RecvError::Closed => EventBusError::Closed,
        broadcast::error::RecvError::Lagged(n) => {
            warn!("Event receiver lagged by {} events", n);
            EventBusError::Lagged(n)
        }
    }
}

pub struct EventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
}

impl EventReceiver {
    pub async fn recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.recv().await.map_err(map_recv_error)
    }

    pub fn try_recv(&mut self) -> Result<DomainEvent, EventBusError> {
        self.receiver.try_recv().map_err(|e| match e {
            broadcast::error::TryRecvError::Empty => EventBusError::Empty,
            broadcast::error::TryRecvError::Closed => EventBusError::Closed,
            broadcast::error::TryRecvError::Lagged(n) => {
                warn!("Event receiver lagged by {} events", n);
                EventBusError::Lagged(n)
            }
        })
    }
}

pub struct SessionEventReceiver {
    receiver: broadcast::Receiver<DomainEvent>,
    session_id: SessionId,
}

impl SessionEventReceiver {
    pub async fn recv(&mut self) -> Result<SessionLifecycleEvent, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(map_recv_error)?;
            if let DomainEvent::Session(session_event) = event {
                if session_event.session_id() == self.session_id {
                    return Ok(session_event);
                }
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

/// Forwards controller callbacks onto the bus.
pub struct EventBusObserver {
    bus: EventBus,
}

impl EventBusObserver {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl ControllerObserver for EventBusObserver {
    async fn on_transition(&self, session_id: SessionId, from: ControllerState, to: ControllerState) {
        self.bus.publish_session_event(SessionLifecycleEvent::StateChanged {
            session_id,
            from,
            to,
            changed_at: Utc::now(),
        });
    }

    async fn on_action_dispatched(&self, session_id: SessionId, action: &Action) {
        self.bus.publish_session_event(SessionLifecycleEvent::ActionDispatched {
            session_id,
            action_id: action.action_id,
            action: action.kind.name().to_string(),
            dispatched_at: Utc::now(),
        });
    }

    async fn on_session_ended(&self, report: &SessionReport) {
        self.bus.publish_session_event(SessionLifecycleEvent::SessionEnded {
            session_id: report.session_id,
            status: report.status,
            step_count: report.step_count,
            failure_kind: report.failure.as_ref().map(|f| f.kind),
            reason: report.failure.as_ref().map(|f| f.reason.clone()),
            ended_at: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::ActionKind;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_event_bus_publish_subscribe() {
        let event_bus = EventBus::new(10);
        let mut receiver = event_bus.subscribe();

        let swarm_task_id = Uuid::new_v4();
        event_bus.publish_swarm_event(SwarmEvent::CancellationRequested {
            swarm_task_id,
            requested_at: Utc::now(),
        });

        match receiver.recv().await.unwrap() {
            DomainEvent::Swarm(event) => assert_eq!(event.swarm_task_id(), swarm_task_id),
            other => panic!("Wrong event type received: {:?}", other),
        }
        assert!(matches!(receiver.try_recv(), Err(EventBusError::Empty)));
    }

    #[tokio::test]
    async fn test_session_event_filtering() {
        let event_bus = EventBus::new(10);
        let session_id = SessionId::new();
        let observer = EventBusObserver::new(event_bus.clone());
        let mut receiver = event_bus.subscribe_session(session_id);

        observer
            .on_transition(SessionId::new(), ControllerState::Idle, ControllerState::Thinking)
            .await;
        let dispatched = Action::new(ActionKind::FinishTask {
            summary: String::new(),
        });
        observer.on_action_dispatched(session_id, &dispatched).await;

        match receiver.recv().await.unwrap() {
            SessionLifecycleEvent::ActionDispatched {
                session_id: id,
                action_id,
                action,
                ..
            } => {
                assert_eq!(id, session_id);
                assert_eq!(action, "finish_task");
                assert_eq!(action_id, dispatched.action_id);
            }
            other => panic!("Wrong event type received: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_lagged_receiver_reports_drop() {
        let event_bus = EventBus::new(2);
        let mut receiver = event_bus.subscribe();
        for _ in 0..5 {
            event_bus.publish_swarm_event(SwarmEvent::CancellationRequested {
                swarm_task_id: Uuid::new_v4(),
                requested_at: Utc::now(),
            });
        }
        assert!(matches!(receiver.recv().await, Err(EventBusError::Lagged(3))));
        assert!(receiver.recv().await.is_ok());
        assert_eq!(event_bus.subscriber_count(), 1);
    }
}
