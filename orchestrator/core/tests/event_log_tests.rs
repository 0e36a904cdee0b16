// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event log integration tests: durability across reopen, single append
//! point under concurrency, and streaming reads.

use conductor_core::domain::event_log::EventLog;
use conductor_core::domain::events::{
    Action, ActionKind, EventPayload, EventSource, Observation, ObservationKind, SequenceId, SessionId,
};
use conductor_core::domain::repository::{EventStore, StorageBackend};
use conductor_core::infrastructure::{create_event_store, FileEventStore, InMemoryEventStore};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;

fn command(i: usize) -> EventPayload {
    EventPayload::Action(Action::new(ActionKind::RunCommand {
        command: format!("echo {}", i),
        cwd: None,
    }))
}

#[tokio::test]
async fn test_file_log_resumes_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let session_id = SessionId::new();

    {
        let store: Arc<dyn EventStore> = Arc::new(FileEventStore::new(dir.path()).unwrap());
        let log = EventLog::open(session_id, store).await.unwrap();
        for i in 0..3 {
            log.append(EventSource::Agent, command(i)).await.unwrap();
        }
        // Dropped without close(), as after a crash.
    }

    let store: Arc<dyn EventStore> = Arc::new(FileEventStore::new(dir.path()).unwrap());
    let log = EventLog::open(session_id, store).await.unwrap();
    assert_eq!(log.len(), 3);

    let seq = log
        .append(
            EventSource::Runtime,
            EventPayload::Observation(Observation::new(
                conductor_core::domain::events::ActionId::new(),
                ObservationKind::Acknowledged {
                    summary: "resumed".to_string(),
                },
            )),
        )
        .await
        .unwrap();
    assert_eq!(seq, SequenceId(3));

    let events = log.snapshot(SequenceId::ZERO).await.unwrap();
    let ids: Vec<u64> = events.iter().map(|e| e.sequence_id.value()).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_concurrent_appends_are_serialised() {
    let log = Arc::new(
        EventLog::open(SessionId::new(), Arc::new(InMemoryEventStore::new()))
            .await
            .unwrap(),
    );

    let mut writers = Vec::new();
    for w in 0..8 {
        let log = log.clone();
        writers.push(tokio::spawn(async move {
            let mut assigned = Vec::new();
            for i in 0..25 {
                assigned.push(log.append(EventSource::Agent, command(w * 100 + i)).await.unwrap());
            }
            assigned
        }));
    }

    let mut all = HashSet::new();
    for writer in writers {
        let assigned = writer.await.unwrap();
        // Each writer sees its own appends in increasing order.
        assert!(assigned.windows(2).all(|pair| pair[0] < pair[1]));
        all.extend(assigned);
    }
    assert_eq!(all.len(), 200);
    assert_eq!(log.len(), 200);

    let events = log.snapshot(SequenceId::ZERO).await.unwrap();
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event.sequence_id, SequenceId(i as u64));
    }
}

#[tokio::test]
async fn test_read_stream_and_tail() {
    let store = create_event_store(&StorageBackend::InMemory).unwrap();
    let log = EventLog::open(SessionId::new(), store).await.unwrap();
    for i in 0..600 {
        log.append(EventSource::Agent, command(i)).await.unwrap();
    }

    // Spans several pages.
    let streamed: Vec<u64> = log
        .read(SequenceId(10))
        .into_stream()
        .map(|event| event.unwrap().sequence_id.value())
        .collect()
        .await;
    assert_eq!(streamed.len(), 590);
    assert_eq!(streamed.first(), Some(&10));
    assert_eq!(streamed.last(), Some(&599));

    let tail = log.tail(3).await.unwrap();
    let ids: Vec<u64> = tail.iter().map(|e| e.sequence_id.value()).collect();
    assert_eq!(ids, vec![597, 598, 599]);
}

#[tokio::test]
async fn test_subscribe_from_skips_earlier_events() {
    let log = Arc::new(
        EventLog::open(SessionId::new(), Arc::new(InMemoryEventStore::new()))
            .await
            .unwrap(),
    );
    for i in 0..5 {
        log.append(EventSource::Agent, command(i)).await.unwrap();
    }

    let mut subscription = log.subscribe_from(SequenceId(3));
    assert_eq!(subscription.position(), SequenceId(3));
    let appender = {
        let log = log.clone();
        tokio::spawn(async move {
            for i in 5..8 {
                log.append(EventSource::Agent, command(i)).await.unwrap();
            }
            log.close().await;
        })
    };

    let mut seen = Vec::new();
    while let Some(event) = subscription.next().await {
        seen.push(event.unwrap().sequence_id.value());
    }
    appender.await.unwrap();
    assert_eq!(seen, vec![3, 4, 5, 6, 7]);
}
