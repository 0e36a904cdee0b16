// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Event store backends.
//!
//! - [`InMemoryEventStore`] keeps events for the lifetime of the process.
//! - [`FileEventStore`] writes one JSON-lines file per session and syncs
//!   every append to disk before acknowledging it. A trailing line torn by a
//!   crash or a failed write is truncated away before the next append, and
//!   reads seek straight to the requested sequence through an offset index.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::domain::events::{Event, SequenceId, SessionId};
use crate::domain::repository::{EventStore, StorageBackend, StoreError};

pub fn create_event_store(backend: &StorageBackend) -> Result<Arc<dyn EventStore>, StoreError> {
    match backend {
        StorageBackend::InMemory => Ok(Arc::new(InMemoryEventStore::new())),
        StorageBackend::File { directory } => Ok(Arc::new(FileEventStore::new(directory)?)),
    }
}

fn check_order(session_id: SessionId, last: Option<SequenceId>, got: SequenceId) -> Result<(), StoreError> {
    let expected = last.map(SequenceId::next).unwrap_or(SequenceId::ZERO);
    if got != expected {
        return Err(StoreError::OutOfOrder {
            session_id,
            expected,
            got,
        });
    }
    Ok(())
}

#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    sessions: Arc<RwLock<HashMap<SessionId, Vec<Event>>>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let events = sessions.entry(event.session_id).or_default();
        check_order(event.session_id, events.last().map(|e| e.sequence_id), event.sequence_id)?;
        events.push(event.clone());
        Ok(())
    }

    async fn read(&self, session_id: SessionId, from: SequenceId, limit: usize) -> Result<Vec<Event>, StoreError> {
        let sessions = self.sessions.read();
        let Some(events) = sessions.get(&session_id) else {
            return Ok(Vec::new());
        };
        // Sequence ids are contiguous from zero, so they double as indices.
        let start = (from.value() as usize).min(events.len());
        Ok(events[start..].iter().take(limit).cloned().collect())
    }

    async fn last_sequence(&self, session_id: SessionId) -> Result<Option<SequenceId>, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(&session_id)
            .and_then(|events| events.last())
            .map(|e| e.sequence_id))
    }
}

/// What the store knows about one session file: where each acknowledged
/// line starts and how long the acknowledged prefix is. Bytes past `len`
/// belong to a write that was never acknowledged.
#[derive(Debug, Default)]
struct SessionIndex {
    /// Indexed by sequence id.
    offsets: Vec<u64>,
    len: u64,
}

impl SessionIndex {
    fn head(&self) -> Option<SequenceId> {
        self.offsets.len().checked_sub(1).map(|last| SequenceId(last as u64))
    }
}

pub struct FileEventStore {
    directory: PathBuf,
    /// Populated on first touch of a session.
    indexes: Mutex<HashMap<SessionId, SessionIndex>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileEventStore {
    pub fn new(directory: impl AsRef<Path>) -> Result<Self, StoreError> {
        let directory = directory.as_ref().to_path_buf();
        std::fs::create_dir_all(&directory)?;
        Ok(Self {
            directory,
            indexes: Mutex::new(HashMap::new()),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn session_path(&self, session_id: SessionId) -> PathBuf {
        self.directory.join(format!("{}.jsonl", session_id))
    }

    /// Drop an incomplete trailing line so the next append starts clean.
    async fn repair(&self, session_id: SessionId) -> Result<(), StoreError> {
        let path = self.session_path(session_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let keep = bytes.iter().rposition(|b| *b == b'\n').map(|i| i + 1).unwrap_or(0);
        if keep < bytes.len() {
            warn!(
                session_id = %session_id,
                dropped_bytes = bytes.len() - keep,
                "Truncating torn trailing line in event file"
            );
            let file = tokio::fs::OpenOptions::new().write(true).open(&path).await?;
            file.set_len(keep as u64).await?;
            file.sync_data().await?;
        }
        Ok(())
    }

    /// Repair the file, then index every line in it.
    async fn scan(&self, session_id: SessionId) -> Result<SessionIndex, StoreError> {
        self.repair(session_id).await?;
        let bytes = match tokio::fs::read(self.session_path(session_id)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(SessionIndex::default()),
            Err(e) => return Err(e.into()),
        };

        let mut index = SessionIndex::default();
        let mut start = 0;
        for (end, _) in bytes.iter().enumerate().filter(|(_, b)| **b == b'\n') {
            let line = &bytes[start..end];
            if !line.iter().all(u8::is_ascii_whitespace) {
                let event: Event = serde_json::from_slice(line)?;
                check_order(session_id, index.head(), event.sequence_id)?;
                index.offsets.push(start as u64);
            }
            start = end + 1;
        }
        index.len = start as u64;
        debug!(session_id = %session_id, events = index.offsets.len(), "Indexed event file");
        Ok(index)
    }

    /// Head and acknowledged length. Caller must hold `write_lock`.
    async fn head_locked(&self, session_id: SessionId) -> Result<(Option<SequenceId>, u64), StoreError> {
        if let Some(index) = self.indexes.lock().get(&session_id) {
            return Ok((index.head(), index.len));
        }
        let index = self.scan(session_id).await?;
        let head = (index.head(), index.len);
        self.indexes.lock().insert(session_id, index);
        Ok(head)
    }

    /// Write `line` at `offset`, discarding whatever an earlier failed write
    /// left there.
    async fn write_at(file: &mut tokio::fs::File, offset: u64, line: &[u8]) -> std::io::Result<()> {
        file.set_len(offset).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        file.write_all(line).await?;
        file.sync_data().await
    }

    /// Byte offset of `from` and how many acknowledged events follow it.
    async fn locate(&self, session_id: SessionId, from: SequenceId) -> Result<Option<(u64, usize)>, StoreError> {
        let cached = self.indexes.lock().contains_key(&session_id);
        if !cached {
            let _guard = self.write_lock.lock().await;
            self.head_locked(session_id).await?;
        }
        let indexes = self.indexes.lock();
        let Some(index) = indexes.get(&session_id) else {
            return Ok(None);
        };
        let position = from.value() as usize;
        Ok(index
            .offsets
            .get(position)
            .map(|offset| (*offset, index.offsets.len() - position)))
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;

        let (head, len) = self.head_locked(event.session_id).await?;
        check_order(event.session_id, head, event.sequence_id)?;

        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(self.session_path(event.session_id))
            .await?;
        if let Err(e) = Self::write_at(&mut file, len, &line).await {
            // The index still ends at `len`; cut the unacknowledged bytes now
            // so readers of the raw file see a clean tail too.
            if let Err(truncate) = file.set_len(len).await {
                warn!(
                    session_id = %event.session_id,
                    error = %truncate,
                    "Failed to truncate event file after a failed append"
                );
            }
            return Err(e.into());
        }

        if let Some(index) = self.indexes.lock().get_mut(&event.session_id) {
            index.offsets.push(len);
            index.len = len + line.len() as u64;
        }
        Ok(())
    }

    async fn read(&self, session_id: SessionId, from: SequenceId, limit: usize) -> Result<Vec<Event>, StoreError> {
        let Some((offset, available)) = self.locate(session_id, from).await? else {
            return Ok(Vec::new());
        };
        let count = available.min(limit);

        let mut file = tokio::fs::File::open(self.session_path(session_id)).await?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::with_capacity(count);
        while events.len() < count {
            let Some(line) = lines.next_line().await? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<Event>(&line)?);
        }
        Ok(events)
    }

    async fn last_sequence(&self, session_id: SessionId) -> Result<Option<SequenceId>, StoreError> {
        if let Some(index) = self.indexes.lock().get(&session_id) {
            return Ok(index.head());
        }
        let _guard = self.write_lock.lock().await;
        Ok(self.head_locked(session_id).await?.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::events::{Action, ActionKind, EventPayload, EventSource};

    fn event(session_id: SessionId, seq: u64) -> Event {
        Event::new(
            session_id,
            SequenceId(seq),
            EventSource::Agent,
            EventPayload::Action(Action::new(ActionKind::RunCommand {
                command: format!("echo {}", seq),
                cwd: None,
            })),
        )
    }

    #[tokio::test]
    async fn test_in_memory_read_window() {
        let store = InMemoryEventStore::new();
        let session_id = SessionId::new();
        for seq in 0..5 {
            store.append(&event(session_id, seq)).await.unwrap();
        }

        let page = store.read(session_id, SequenceId(2), 2).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.sequence_id.value()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(store.read(session_id, SequenceId(9), 10).await.unwrap().is_empty());
        assert!(store.read(SessionId::new(), SequenceId::ZERO, 10).await.unwrap().is_empty());
        assert_eq!(store.last_sequence(session_id).await.unwrap(), Some(SequenceId(4)));
    }

    #[tokio::test]
    async fn test_in_memory_rejects_gaps() {
        let store = InMemoryEventStore::new();
        let session_id = SessionId::new();
        store.append(&event(session_id, 0)).await.unwrap();
        let err = store.append(&event(session_id, 2)).await.unwrap_err();
        assert!(matches!(err, StoreError::OutOfOrder { expected: SequenceId(1), .. }));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        {
            let store = FileEventStore::new(dir.path()).unwrap();
            for seq in 0..3 {
                store.append(&event(session_id, seq)).await.unwrap();
            }
        }

        let store = FileEventStore::new(dir.path()).unwrap();
        assert_eq!(store.last_sequence(session_id).await.unwrap(), Some(SequenceId(2)));
        let events = store.read(session_id, SequenceId::ZERO, 100).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].session_id, session_id);
        store.append(&event(session_id, 3)).await.unwrap();
        assert_eq!(store.last_sequence(session_id).await.unwrap(), Some(SequenceId(3)));
    }

    #[tokio::test]
    async fn test_file_store_ignores_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        let store = FileEventStore::new(dir.path()).unwrap();
        store.append(&event(session_id, 0)).await.unwrap();
        store.append(&event(session_id, 1)).await.unwrap();

        // Simulate a crash halfway through the third write.
        let path = store.session_path(session_id);
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(br#"{"sequence_id":2,"session_"#);
        std::fs::write(&path, content).unwrap();

        let reopened = FileEventStore::new(dir.path()).unwrap();
        assert_eq!(reopened.last_sequence(session_id).await.unwrap(), Some(SequenceId(1)));
        assert_eq!(reopened.read(session_id, SequenceId::ZERO, 10).await.unwrap().len(), 2);

        reopened.append(&event(session_id, 2)).await.unwrap();
        let events = reopened.read(session_id, SequenceId::ZERO, 10).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].sequence_id, SequenceId(2));
    }

    #[tokio::test]
    async fn test_file_store_recovers_from_failed_append() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        let store = FileEventStore::new(dir.path()).unwrap();
        store.append(&event(session_id, 0)).await.unwrap();
        store.append(&event(session_id, 1)).await.unwrap();

        // A write that died halfway, seen by the same store instance.
        let path = store.session_path(session_id);
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(br#"{"sequence_id":2,"sess"#);
        std::fs::write(&path, &content).unwrap();

        store.append(&event(session_id, 2)).await.unwrap();
        let events = store.read(session_id, SequenceId::ZERO, 10).await.unwrap();
        let ids: Vec<u64> = events.iter().map(|e| e.sequence_id.value()).collect();
        assert_eq!(ids, vec![0, 1, 2]);

        let reopened = FileEventStore::new(dir.path()).unwrap();
        assert_eq!(reopened.read(session_id, SequenceId::ZERO, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_unacknowledged_line_is_rewritten_not_duplicated() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        let store = FileEventStore::new(dir.path()).unwrap();
        store.append(&event(session_id, 0)).await.unwrap();

        // Fully written but never acknowledged, e.g. the sync failed.
        let path = store.session_path(session_id);
        let mut content = std::fs::read(&path).unwrap();
        content.extend_from_slice(&serde_json::to_vec(&event(session_id, 1)).unwrap());
        content.push(b'\n');
        std::fs::write(&path, &content).unwrap();

        assert_eq!(store.read(session_id, SequenceId::ZERO, 10).await.unwrap().len(), 1);
        assert_eq!(store.last_sequence(session_id).await.unwrap(), Some(SequenceId::ZERO));

        store.append(&event(session_id, 1)).await.unwrap();
        let lines = std::fs::read_to_string(&path).unwrap();
        assert_eq!(lines.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_file_store_reads_pages_by_offset() {
        let dir = tempfile::tempdir().unwrap();
        let session_id = SessionId::new();
        let store = FileEventStore::new(dir.path()).unwrap();
        for seq in 0..6 {
            store.append(&event(session_id, seq)).await.unwrap();
        }

        let page = store.read(session_id, SequenceId(3), 2).await.unwrap();
        let ids: Vec<u64> = page.iter().map(|e| e.sequence_id.value()).collect();
        assert_eq!(ids, vec![3, 4]);
        assert!(store.read(session_id, SequenceId(6), 10).await.unwrap().is_empty());
        assert!(store.read(SessionId::new(), SequenceId::ZERO, 10).await.unwrap().is_empty());

        let reopened = FileEventStore::new(dir.path()).unwrap();
        let page = reopened.read(session_id, SequenceId(5), 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].sequence_id, SequenceId(5));
    }
}
