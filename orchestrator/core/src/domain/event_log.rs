// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Session Event Log
//!
//! Append-only, ordered record of everything that happens in one session.
//!
//! - All writes go through a single append point (`writer` mutex), so
//!   sequence-id assignment is atomic under concurrent callers.
//! - Readers never share a cursor: [`EventCursor`] is a finite replay of the
//!   log as of the moment it was opened, [`EventSubscription`] follows the log
//!   live. Both page through the backing [`EventStore`], so a slow subscriber
//!   can never lose events the way a bounded broadcast channel would.
//! - A `watch` watermark carries the next sequence id and the closed flag;
//!   subscribers park on it instead of polling.

use futures::Stream;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tracing::debug;

use crate::domain::events::{Event, EventPayload, EventSource, SequenceId, SessionId};
use crate::domain::repository::{EventStore, StoreError};

const DEFAULT_PAGE_SIZE: usize = 256;

#[derive(Debug, Error)]
pub enum EventLogError {
    #[error("Event log for session {session_id} is closed")]
    Closed { session_id: SessionId },

    #[error("Event store failure: {0}")]
    Store(#[from] StoreError),
}

/// Published after every append and on close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watermark {
    /// Sequence id the next append will receive.
    pub next: SequenceId,
    pub closed: bool,
}

struct WriterState {
    next: SequenceId,
    closed: bool,
}

pub struct EventLog {
    session_id: SessionId,
    store: Arc<dyn EventStore>,
    writer: Mutex<WriterState>,
    watermark: watch::Sender<Watermark>,
}

impl EventLog {
    /// Open the log for `session_id`, continuing after whatever the store
    /// already holds for it.
    pub async fn open(session_id: SessionId, store: Arc<dyn EventStore>) -> Result<Self, EventLogError> {
        let next = store
            .last_sequence(session_id)
            .await?
            .map(SequenceId::next)
            .unwrap_or(SequenceId::ZERO);

        if next > SequenceId::ZERO {
            debug!(session_id = %session_id, next_sequence = %next, "Resuming existing event log");
        }

        let (watermark, _) = watch::channel(Watermark { next, closed: false });
        Ok(Self {
            session_id,
            store,
            writer: Mutex::new(WriterState { next, closed: false }),
            watermark,
        })
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Append a payload and return the sequence id it was assigned.
    ///
    /// The event is durable and visible to readers before this returns.
    pub async fn append(&self, source: EventSource, payload: EventPayload) -> Result<SequenceId, EventLogError> {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return Err(EventLogError::Closed {
                session_id: self.session_id,
            });
        }

        let event = Event::new(self.session_id, writer.next, source, payload);
        self.store.append(&event).await?;

        let sequence_id = writer.next;
        writer.next = sequence_id.next();
        self.watermark.send_replace(Watermark {
            next: writer.next,
            closed: false,
        });

        metrics::counter!("conductor_events_appended_total", "kind" => kind_label(&event)).increment(1);
        debug!(
            session_id = %self.session_id,
            sequence_id = %sequence_id,
            kind = ?event.kind,
            "Appended event"
        );
        Ok(sequence_id)
    }

    /// Finite, lazy replay of every event with `sequence_id >= from` that
    /// existed when the cursor was opened.
    pub fn read(&self, from: SequenceId) -> EventCursor {
        EventCursor {
            store: self.store.clone(),
            session_id: self.session_id,
            start: from,
            next: from,
            end: self.watermark.borrow().next,
            page_size: DEFAULT_PAGE_SIZE,
            buffer: VecDeque::new(),
        }
    }

    /// Collect [`EventLog::read`] into a vector.
    pub async fn snapshot(&self, from: SequenceId) -> Result<Vec<Event>, EventLogError> {
        self.read(from).collect().await
    }

    /// The last `count` events of the log.
    pub async fn tail(&self, count: usize) -> Result<Vec<Event>, EventLogError> {
        let next = self.watermark.borrow().next.value();
        let from = next.saturating_sub(count as u64);
        self.snapshot(SequenceId(from)).await
    }

    /// Live subscription from the start of the log.
    pub fn subscribe(&self) -> EventSubscription {
        self.subscribe_from(SequenceId::ZERO)
    }

    /// Live subscription delivering every event with `sequence_id >= from`.
    pub fn subscribe_from(&self, from: SequenceId) -> EventSubscription {
        EventSubscription {
            store: self.store.clone(),
            session_id: self.session_id,
            cursor: from,
            watermark: self.watermark.subscribe(),
            buffer: VecDeque::new(),
            page_size: DEFAULT_PAGE_SIZE,
            detached: false,
            finished: false,
        }
    }

    /// Mark the log terminal. Returns `false` if it was already closed.
    pub async fn close(&self) -> bool {
        let mut writer = self.writer.lock().await;
        if writer.closed {
            return false;
        }
        writer.closed = true;
        self.watermark.send_replace(Watermark {
            next: writer.next,
            closed: true,
        });
        debug!(session_id = %self.session_id, events = writer.next.value(), "Closed event log");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.watermark.borrow().closed
    }

    /// Number of events appended so far.
    pub fn len(&self) -> u64 {
        self.watermark.borrow().next.value()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn kind_label(event: &Event) -> &'static str {
    match event.payload {
        EventPayload::Action(_) => "action",
        EventPayload::Observation(_) => "observation",
        EventPayload::Error(_) => "error",
        EventPayload::Control(_) => "control",
    }
}

/// Restartable replay over a bounded range of the log.
pub struct EventCursor {
    store: Arc<dyn EventStore>,
    session_id: SessionId,
    start: SequenceId,
    next: SequenceId,
    end: SequenceId,
    page_size: usize,
    buffer: VecDeque<Event>,
}

impl EventCursor {
    pub async fn next(&mut self) -> Option<Result<Event, EventLogError>> {
        if let Some(event) = self.buffer.pop_front() {
            return Some(Ok(event));
        }
        if self.next >= self.end {
            return None;
        }

        let remaining = (self.end.value() - self.next.value()) as usize;
        let limit = remaining.min(self.page_size);
        match self.store.read(self.session_id, self.next, limit).await {
            Ok(events) => {
                let end = self.end;
                let mut page = events.into_iter().filter(|e| e.sequence_id < end);
                let first = page.next()?;
                self.buffer.extend(page);
                self.next = self.buffer.back().unwrap_or(&first).sequence_id.next();
                Some(Ok(first))
            }
            Err(e) => Some(Err(e.into())),
        }
    }

    /// Rewind to the starting sequence id. The upper bound stays fixed.
    pub fn restart(&mut self) {
        self.next = self.start;
        self.buffer.clear();
    }

    pub async fn collect(mut self) -> Result<Vec<Event>, EventLogError> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event?);
        }
        Ok(events)
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event, EventLogError>> + Send {
        futures::stream::unfold(self, |mut cursor| async move {
            cursor.next().await.map(|item| (item, cursor))
        })
    }
}

/// Live, gapless view of the log with its own cursor.
///
/// Dropping the subscription unsubscribes it.
pub struct EventSubscription {
    store: Arc<dyn EventStore>,
    session_id: SessionId,
    cursor: SequenceId,
    watermark: watch::Receiver<Watermark>,
    buffer: VecDeque<Event>,
    page_size: usize,
    detached: bool,
    finished: bool,
}

impl EventSubscription {
    /// Next event in append order, or `None` once the log is closed and drained.
    pub async fn next(&mut self) -> Option<Result<Event, EventLogError>> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }

            // Observe the watermark before reading so an append racing with
            // the read always triggers `changed()` below.
            let mark = *self.watermark.borrow_and_update();
            if self.cursor < mark.next {
                match self.store.read(self.session_id, self.cursor, self.page_size).await {
                    Ok(events) if !events.is_empty() => {
                        if let Some(last) = events.last() {
                            self.cursor = last.sequence_id.next();
                        }
                        self.buffer.extend(events);
                        continue;
                    }
                    Ok(_) => {}
                    Err(e) => return Some(Err(e.into())),
                }
            }

            if (mark.closed && self.cursor >= mark.next) || self.detached {
                // A detached subscription has already drained what the store holds.
                self.finished = true;
                return None;
            }
            if self.watermark.changed().await.is_err() {
                self.detached = true;
            }
        }
    }

    /// Sequence id of the next event this subscription will deliver.
    pub fn position(&self) -> SequenceId {
        self.cursor
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<Event, EventLogError>> + Send {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription.next().await.map(|item| (item, subscription))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{Action, ActionKind, ControlSignal, EventKind};
    use crate::infrastructure::event_store::InMemoryEventStore;
    use std::time::Duration;

    fn finish_payload(summary: &str) -> EventPayload {
        EventPayload::Action(Action::new(ActionKind::FinishTask {
            summary: summary.to_string(),
        }))
    }

    async fn new_log() -> EventLog {
        EventLog::open(SessionId::new(), Arc::new(InMemoryEventStore::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_assigns_contiguous_ids() {
        let log = new_log().await;
        for i in 0..5 {
            let seq = log.append(EventSource::Agent, finish_payload(&i.to_string())).await.unwrap();
            assert_eq!(seq, SequenceId(i));
        }

        let events = log.snapshot(SequenceId::ZERO).await.unwrap();
        assert_eq!(events.len(), 5);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence_id, SequenceId(i as u64));
            assert_eq!(event.kind, EventKind::Action);
        }
    }

    #[tokio::test]
    async fn test_cursor_is_bounded_and_restartable() {
        let log = new_log().await;
        for i in 0..3 {
            log.append(EventSource::Agent, finish_payload(&i.to_string())).await.unwrap();
        }

        let mut cursor = log.read(SequenceId(1));
        log.append(EventSource::Agent, finish_payload("late")).await.unwrap();

        let first = cursor.next().await.unwrap().unwrap();
        assert_eq!(first.sequence_id, SequenceId(1));
        let second = cursor.next().await.unwrap().unwrap();
        assert_eq!(second.sequence_id, SequenceId(2));
        assert!(cursor.next().await.is_none(), "cursor must not see events appended after it opened");

        cursor.restart();
        assert_eq!(cursor.next().await.unwrap().unwrap().sequence_id, SequenceId(1));
    }

    #[tokio::test]
    async fn test_closed_log_rejects_append_and_ends_subscribers() {
        let log = Arc::new(new_log().await);
        let mut subscription = log.subscribe();

        let waiter = tokio::spawn(async move {
            let mut seen = Vec::new();
            while let Some(event) = subscription.next().await {
                seen.push(event.unwrap().sequence_id);
            }
            seen
        });

        log.append(EventSource::Agent, finish_payload("a")).await.unwrap();
        assert!(log.close().await);
        assert!(!log.close().await);

        let err = log
            .append(
                EventSource::User,
                EventPayload::Control(ControlSignal::Cancel { reason: None }),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EventLogError::Closed { .. }));

        let seen = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("subscriber must be released on close")
            .unwrap();
        assert_eq!(seen, vec![SequenceId(0)]);
    }
}
