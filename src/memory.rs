//! In-process implementation of the storage collaborators.
//!
//! [`InMemoryStorage`] keeps the global log, the stream index, documents and
//! shard progress behind one `tokio::sync::RwLock`. A commit validates every
//! guard under the write lock before touching any state, so a rejected
//! [`UnitOfWork`] leaves nothing behind.
//!
//! Besides backing the crate's tests it is usable as a development store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{ConcurrencyError, StoreError};
use crate::event::{Event, Identity, NewEvent, now_millis};
use crate::storage::{
    DocumentOperation, DocumentStore, EventFilter, EventRange, EventStore, ProgressUpdate,
    Storage, StoredDocument, UnitOfWork,
};
use crate::versioning::{
    ExpectedVersion, StreamGuard, StreamState, assign_versions, check_expected_version,
};

type StreamKey = (String, Identity);
type DocumentKey = (String, String, Identity);

#[derive(Debug, Default)]
struct State {
    /// Global log keyed by sequence. Tombstones included.
    events: BTreeMap<u64, Event>,
    /// Stream index: sequences of each stream in version order.
    streams: HashMap<StreamKey, (StreamState, Vec<u64>)>,
    /// Last sequence handed out by `reserve_sequences`.
    reserved: u64,
    /// Highest sequence with no missing position below it.
    contiguous: u64,
    documents: HashMap<DocumentKey, StoredDocument>,
    progress: HashMap<String, u64>,
}

impl State {
    fn advance_contiguous(&mut self) {
        while self.events.contains_key(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
    }

    fn check_guard(&self, guard: &StreamGuard) -> Result<(), ConcurrencyError> {
        let key = (guard.tenant_id.clone(), guard.stream.clone());
        let actual = self.streams.get(&key).map(|(s, _)| s.version).unwrap_or(0);
        if actual == guard.current_version {
            Ok(())
        } else {
            Err(ConcurrencyError::Stream {
                stream: guard.stream.clone(),
                expected: guard.current_version.to_string(),
                actual,
            })
        }
    }

    fn check_document(&self, op: &DocumentOperation) -> Result<(), ConcurrencyError> {
        let DocumentOperation::Upsert {
            document_type,
            tenant_id,
            id,
            expected_version: Some(expected),
            ..
        } = op
        else {
            return Ok(());
        };
        let key = (document_type.clone(), tenant_id.clone(), id.clone());
        let actual = self.documents.get(&key).and_then(|d| d.version);
        if actual == Some(*expected) {
            Ok(())
        } else {
            Err(ConcurrencyError::Document {
                document_type: document_type.clone(),
                id: id.clone(),
                expected: Some(*expected),
                actual,
            })
        }
    }

    fn check_progress(&self, update: &ProgressUpdate) -> Result<(), ConcurrencyError> {
        let actual = self.progress.get(&update.shard).copied().unwrap_or(0);
        if actual == update.from {
            Ok(())
        } else {
            Err(ConcurrencyError::Progress {
                shard: update.shard.clone(),
                expected: update.from,
                actual,
            })
        }
    }

    fn append_event(&mut self, event: Event) {
        let key = (event.tenant_id.clone(), event.stream.clone());
        let entry = self.streams.entry(key).or_insert_with(|| {
            (
                StreamState {
                    stream: event.stream.clone(),
                    tenant_id: event.tenant_id.clone(),
                    version: 0,
                    aggregate_type: event.aggregate_type.clone(),
                    is_archived: false,
                },
                Vec::new(),
            )
        });
        entry.0.version = entry.0.version.max(event.version);
        if entry.0.aggregate_type.is_none() {
            entry.0.aggregate_type = event.aggregate_type.clone();
        }
        entry.1.push(event.sequence);
        self.reserved = self.reserved.max(event.sequence);
        self.events.insert(event.sequence, event);
    }

    fn archive(&mut self, tenant_id: &str, stream: &Identity) {
        let key = (tenant_id.to_owned(), stream.clone());
        let Some((state, sequences)) = self.streams.get_mut(&key) else {
            return;
        };
        state.is_archived = true;
        for sequence in sequences.iter() {
            if let Some(event) = self.events.get_mut(sequence) {
                event.is_archived = true;
            }
        }
    }

    fn apply_document(&mut self, op: DocumentOperation) {
        match op {
            DocumentOperation::Upsert {
                document_type,
                tenant_id,
                id,
                data,
                version,
                ..
            } => {
                let key = (document_type, tenant_id, id.clone());
                self.documents
                    .insert(key, StoredDocument { id, data, version });
            }
            DocumentOperation::Delete {
                document_type,
                tenant_id,
                id,
            } => {
                self.documents.remove(&(document_type, tenant_id, id));
            }
        }
    }
}

/// Event log, document store and progress table held in memory.
///
/// Sequences are handed out by [`EventStore::reserve_sequences`] and only
/// become visible once committed or tombstoned; the high-water mark stops at
/// the first missing position.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    state: RwLock<State>,
    fail_commits: AtomicUsize,
    commits: AtomicUsize,
}

impl InMemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` commits fail with [`StoreError::Unavailable`]
    /// without writing anything.
    pub fn fail_next_commits(&self, count: usize) {
        self.fail_commits.store(count, Ordering::SeqCst);
    }

    /// Number of commits that were applied.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Append raw events to a stream, bypassing any projection.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] if `expected` does not hold, or the
    /// commit's own error. Reserved sequences of a failed commit are
    /// filled with tombstones.
    pub async fn append(
        &self,
        tenant_id: &str,
        stream: Identity,
        expected: ExpectedVersion,
        events: Vec<NewEvent>,
    ) -> Result<Vec<Event>, StoreError> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.stream_state(tenant_id, &stream).await?;
        let current = check_expected_version(&stream, expected, state.as_ref())
            .map_err(StoreError::Conflict)?;
        let aggregate_type = state.and_then(|s| s.aggregate_type);

        let sequences = self.reserve_sequences(events.len()).await?;
        let timestamp = now_millis();
        let appended: Vec<Event> = events
            .into_iter()
            .zip(sequences.iter().copied().zip(assign_versions(current, sequences.len())))
            .map(|(new, (sequence, version))| Event {
                id: uuid::Uuid::new_v4(),
                sequence,
                stream: stream.clone(),
                version,
                tenant_id: tenant_id.to_owned(),
                event_type: new.event_type,
                timestamp,
                data: new.data,
                aggregate_type: aggregate_type.clone(),
                metadata: Default::default(),
                is_archived: false,
            })
            .collect();

        let work = UnitOfWork {
            events: appended.clone(),
            stream_guards: vec![StreamGuard {
                tenant_id: tenant_id.to_owned(),
                stream,
                current_version: current,
            }],
            ..UnitOfWork::default()
        };
        if let Err(err) = self.commit(work).await {
            self.write_tombstones(&sequences).await?;
            return Err(err);
        }
        Ok(appended)
    }

    /// Every event in the log, tombstones included, in sequence order.
    pub async fn all_events(&self) -> Vec<Event> {
        self.state.read().await.events.values().cloned().collect()
    }

    /// Number of stored documents of `document_type` across tenants.
    pub async fn document_count(&self, document_type: &str) -> usize {
        self.state
            .read()
            .await
            .documents
            .keys()
            .filter(|(t, _, _)| t == document_type)
            .count()
    }
}

#[async_trait]
impl EventStore for InMemoryStorage {
    async fn stream_state(
        &self,
        tenant_id: &str,
        stream: &Identity,
    ) -> Result<Option<StreamState>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .streams
            .get(&(tenant_id.to_owned(), stream.clone()))
            .map(|(s, _)| s.clone()))
    }

    async fn reserve_sequences(&self, count: usize) -> Result<Vec<u64>, StoreError> {
        let mut state = self.state.write().await;
        let first = state.reserved + 1;
        state.reserved += count as u64;
        Ok((first..=state.reserved).collect())
    }

    async fn write_tombstones(&self, sequences: &[u64]) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        let timestamp = now_millis();
        for &sequence in sequences {
            if !state.events.contains_key(&sequence) {
                state.events.insert(sequence, Event::tombstone(sequence, timestamp));
            }
        }
        state.advance_contiguous();
        tracing::debug!(count = sequences.len(), "tombstones stored");
        Ok(())
    }

    async fn load_range(
        &self,
        range: &EventRange,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, StoreError> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let state = self.state.read().await;
        Ok(state
            .events
            .range(range.floor + 1..=range.ceiling)
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .cloned()
            .collect())
    }

    async fn fetch_stream(
        &self,
        tenant_id: &str,
        stream: &Identity,
    ) -> Result<Vec<Event>, StoreError> {
        let state = self.state.read().await;
        let Some((_, sequences)) = state.streams.get(&(tenant_id.to_owned(), stream.clone()))
        else {
            return Ok(Vec::new());
        };
        Ok(sequences
            .iter()
            .filter_map(|s| state.events.get(s))
            .cloned()
            .collect())
    }

    async fn high_water_mark(&self) -> Result<u64, StoreError> {
        Ok(self.state.read().await.contiguous)
    }
}

#[async_trait]
impl DocumentStore for InMemoryStorage {
    async fn load(
        &self,
        document_type: &str,
        tenant_id: &str,
        id: &Identity,
    ) -> Result<Option<StoredDocument>, StoreError> {
        let state = self.state.read().await;
        let key = (document_type.to_owned(), tenant_id.to_owned(), id.clone());
        Ok(state.documents.get(&key).cloned())
    }

    async fn load_many(
        &self,
        document_type: &str,
        tenant_id: &str,
        ids: &[Identity],
    ) -> Result<Vec<StoredDocument>, StoreError> {
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                let key = (document_type.to_owned(), tenant_id.to_owned(), id.clone());
                state.documents.get(&key).cloned()
            })
            .collect())
    }

    async fn load_progress(&self, shard: &str) -> Result<u64, StoreError> {
        Ok(self
            .state
            .read()
            .await
            .progress
            .get(shard)
            .copied()
            .unwrap_or(0))
    }

    async fn teardown(&self, document_type: &str, shard: &str) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        state.documents.retain(|(t, _, _), _| t != document_type);
        state.progress.remove(shard);
        Ok(())
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn commit(&self, work: UnitOfWork) -> Result<(), StoreError> {
        let injected = self
            .fail_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StoreError::Unavailable("injected commit failure".into()));
        }

        let mut state = self.state.write().await;

        // Validate everything before mutating anything.
        for guard in &work.stream_guards {
            state.check_guard(guard).map_err(StoreError::Conflict)?;
        }
        for op in &work.operations {
            state.check_document(op).map_err(StoreError::Conflict)?;
        }
        for update in &work.progress {
            state.check_progress(update).map_err(StoreError::Conflict)?;
        }

        for event in work.events {
            state.append_event(event);
        }
        for (tenant_id, stream) in &work.archived_streams {
            state.archive(tenant_id, stream);
        }
        for op in work.operations {
            state.apply_document(op);
        }
        for update in work.progress {
            state.progress.insert(update.shard, update.to);
        }
        state.advance_contiguous();
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
