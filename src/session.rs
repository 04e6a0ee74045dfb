//! Write sessions: buffered appends committed together with the inline
//! projections they trigger.
//!
//! An [`EventSession`] queues appends and archive requests in memory. On
//! [`save_changes`](EventSession::save_changes) it validates every expected
//! version, reserves global sequences, folds the new events through all
//! inline projections, and commits events, stream guards and document
//! operations in a single [`UnitOfWork`]. If anything fails after the
//! sequences were reserved, the reserved positions are filled with
//! tombstones so the global sequence stays contiguous.

use tracing::Instrument;

use crate::aggregate::Aggregate;
use crate::context::SessionContext;
use crate::error::ProjectionError;
use crate::event::{Event, Identity, NewEvent, now_millis};
use crate::storage::UnitOfWork;
use crate::store::ProjectionStore;
use crate::versioning::{ExpectedVersion, StreamGuard, assign_versions, check_expected_version};

/// Appends queued for one stream.
#[derive(Debug)]
struct PendingStream {
    stream: Identity,
    expected: ExpectedVersion,
    aggregate_type: Option<String>,
    events: Vec<NewEvent>,
}

/// A unit of work against a [`ProjectionStore`] for one tenant.
///
/// Obtained from [`ProjectionStore::session`] or
/// [`ProjectionStore::session_for`]. Nothing is written until
/// [`save_changes`](EventSession::save_changes).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_projections::{
///     Aggregate, AggregateProjection, AggregationBuilder, InMemoryStorage, NewEvent,
///     ProjectionStore, SessionContext,
/// };
/// use serde::{Deserialize, Serialize};
/// use serde_json::json;
///
/// #[derive(Clone, Default, Serialize, Deserialize)]
/// struct Trip { name: String }
/// impl Aggregate for Trip { const AGGREGATE_TYPE: &'static str = "trip"; }
///
/// #[derive(Deserialize)]
/// struct Started { name: String }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), eventfold_projections::ProjectionError> {
/// let store = ProjectionStore::builder(Arc::new(InMemoryStorage::new()))
///     .projection(AggregateProjection::single_stream(
///         AggregationBuilder::<Trip>::new()
///             .create("TripStarted", |e: Started, _| Trip { name: e.name }),
///     ))
///     .build()?;
///
/// let mut session = store
///     .session()
///     .with_context(SessionContext::default().with_user("user-42"));
/// session.start_stream::<Trip>("trip-1", [NewEvent::new("TripStarted", json!({"name": "Lisbon"}))]);
/// let appended = session.save_changes().await?;
/// assert_eq!(appended[0].metadata.user.as_deref(), Some("user-42"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct EventSession {
    store: ProjectionStore,
    tenant_id: String,
    context: SessionContext,
    pending: Vec<PendingStream>,
    archived: Vec<Identity>,
}

impl EventSession {
    pub(crate) fn new(store: ProjectionStore, tenant_id: String, context: SessionContext) -> Self {
        Self {
            store,
            tenant_id,
            context,
            pending: Vec::new(),
            archived: Vec::new(),
        }
    }

    /// Replace the metadata stamped on appended events.
    pub fn with_context(mut self, context: SessionContext) -> Self {
        self.context = context;
        self
    }

    /// Tenant the session appends for.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Metadata stamped onto appended events.
    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    /// Number of queued events across all streams.
    pub fn pending_events(&self) -> usize {
        self.pending.iter().map(|p| p.events.len()).sum()
    }

    /// Start a new stream tagged with `A`'s aggregate type.
    ///
    /// Fails at save time if the stream already exists.
    pub fn start_stream<A: Aggregate>(
        &mut self,
        id: impl Into<Identity>,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> &mut Self {
        self.queue(
            id.into(),
            ExpectedVersion::NoStream,
            Some(A::AGGREGATE_TYPE.to_owned()),
            events,
        )
    }

    /// Append to a stream without a version expectation. The stream is
    /// created if needed.
    pub fn append(
        &mut self,
        id: impl Into<Identity>,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> &mut Self {
        self.queue(id.into(), ExpectedVersion::Any, None, events)
    }

    /// Append to a stream that must be at exactly `expected_version`
    /// before these events.
    pub fn append_optimistic(
        &mut self,
        id: impl Into<Identity>,
        expected_version: u64,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> &mut Self {
        self.queue(
            id.into(),
            ExpectedVersion::Exact(expected_version),
            None,
            events,
        )
    }

    /// Append with an explicit [`ExpectedVersion`].
    pub fn append_expected(
        &mut self,
        id: impl Into<Identity>,
        expected: ExpectedVersion,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> &mut Self {
        self.queue(id.into(), expected, None, events)
    }

    /// Mark a stream as archived. Its events stop being delivered to async
    /// projections.
    pub fn archive_stream(&mut self, id: impl Into<Identity>) -> &mut Self {
        let id = id.into();
        if !self.archived.contains(&id) {
            self.archived.push(id);
        }
        self
    }

    // Repeated appends to one stream extend the same batch. The first
    // non-`Any` expectation applies to the whole batch.
    fn queue(
        &mut self,
        stream: Identity,
        expected: ExpectedVersion,
        aggregate_type: Option<String>,
        events: impl IntoIterator<Item = NewEvent>,
    ) -> &mut Self {
        let events: Vec<NewEvent> = events.into_iter().collect();
        match self.pending.iter_mut().find(|p| p.stream == stream) {
            Some(existing) => {
                if existing.expected == ExpectedVersion::Any {
                    existing.expected = expected;
                }
                if existing.aggregate_type.is_none() {
                    existing.aggregate_type = aggregate_type;
                }
                existing.events.extend(events);
            }
            None => self.pending.push(PendingStream {
                stream,
                expected,
                aggregate_type,
                events,
            }),
        }
        self
    }

    /// Commit every queued append and archive request, applying inline
    /// projections in the same unit of work.
    ///
    /// The queue is cleared whether or not the commit succeeds.
    ///
    /// # Returns
    ///
    /// The appended events, with their global sequences and stream versions.
    ///
    /// # Errors
    ///
    /// - [`ProjectionError::Concurrency`] if a stream is not at its expected
    ///   version, checked both before reserving sequences and at commit.
    /// - [`ProjectionError::Apply`] if an inline projection fails.
    /// - [`ProjectionError::Store`] if the storage collaborator fails.
    ///
    /// Nothing is written on error; reserved sequences become tombstones.
    pub async fn save_changes(&mut self) -> Result<Vec<Event>, ProjectionError> {
        let pending = std::mem::take(&mut self.pending);
        let archived = std::mem::take(&mut self.archived);
        if pending.iter().all(|p| p.events.is_empty()) && archived.is_empty() {
            return Ok(Vec::new());
        }

        let span = tracing::info_span!(
            "save_changes",
            tenant_id = %self.tenant_id,
            streams = pending.len(),
        );
        self.commit(pending, archived).instrument(span).await
    }

    async fn commit(
        &self,
        pending: Vec<PendingStream>,
        archived: Vec<Identity>,
    ) -> Result<Vec<Event>, ProjectionError> {
        let storage = self.store.storage().as_ref();

        // Validate every expectation before consuming sequence numbers.
        let mut batches = Vec::with_capacity(pending.len());
        for batch in pending.into_iter().filter(|p| !p.events.is_empty()) {
            let state = storage.stream_state(&self.tenant_id, &batch.stream).await?;
            let current = check_expected_version(&batch.stream, batch.expected, state.as_ref())?;
            let aggregate_type = batch
                .aggregate_type
                .clone()
                .or_else(|| state.and_then(|s| s.aggregate_type));
            batches.push((batch, current, aggregate_type));
        }

        let total: usize = batches.iter().map(|(b, _, _)| b.events.len()).sum();
        let sequences = if total > 0 {
            storage.reserve_sequences(total).await?
        } else {
            Vec::new()
        };

        let timestamp = now_millis();
        let metadata = self.context.event_metadata();
        let mut next_sequence = sequences.iter().copied();
        let mut events = Vec::with_capacity(total);
        let mut stream_guards = Vec::with_capacity(batches.len());
        for (batch, current, aggregate_type) in batches {
            let count = batch.events.len();
            for (new, version) in batch.events.into_iter().zip(assign_versions(current, count)) {
                let Some(sequence) = next_sequence.next() else {
                    break;
                };
                events.push(Event {
                    id: uuid::Uuid::new_v4(),
                    sequence,
                    stream: batch.stream.clone(),
                    version,
                    tenant_id: self.tenant_id.clone(),
                    event_type: new.event_type,
                    timestamp,
                    data: new.data,
                    aggregate_type: aggregate_type.clone(),
                    metadata: metadata.clone(),
                    is_archived: false,
                });
            }
            stream_guards.push(StreamGuard {
                tenant_id: self.tenant_id.clone(),
                stream: batch.stream,
                current_version: current,
            });
        }

        match self.apply_and_commit(events, stream_guards, archived).await {
            Ok(events) => {
                tracing::info!(
                    tenant_id = %self.tenant_id,
                    events = events.len(),
                    "session committed"
                );
                Ok(events)
            }
            Err(err) => {
                if !sequences.is_empty() {
                    tracing::warn!(
                        tenant_id = %self.tenant_id,
                        sequences = sequences.len(),
                        error = %err,
                        "session commit failed, writing tombstones"
                    );
                    if let Err(tombstone_err) = storage.write_tombstones(&sequences).await {
                        tracing::error!(
                            error = %tombstone_err,
                            "failed to write tombstones for reserved sequences"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn apply_and_commit(
        &self,
        events: Vec<Event>,
        stream_guards: Vec<StreamGuard>,
        archived: Vec<Identity>,
    ) -> Result<Vec<Event>, ProjectionError> {
        let storage = self.store.storage().as_ref();

        let mut operations = Vec::new();
        for projection in self.store.inline_projections() {
            let ops = projection.apply_inline(storage, &events).await?;
            tracing::debug!(
                projection = projection.name(),
                operations = ops.len(),
                "inline projection applied"
            );
            operations.extend(ops);
        }

        let work = UnitOfWork {
            events: events.clone(),
            stream_guards,
            archived_streams: archived
                .into_iter()
                .map(|id| (self.tenant_id.clone(), id))
                .collect(),
            operations,
            progress: Vec::new(),
        };
        storage.commit(work).await?;
        Ok(events)
    }
}
