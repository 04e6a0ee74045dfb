//! Storage collaborator traits.
//!
//! The engine never talks to a database directly. It reads events through
//! [`EventStore`], reads documents and shard progress through
//! [`DocumentStore`], and writes everything through [`Storage::commit`], which
//! a relational backend implements as one transaction.
//!
//! Documents cross this boundary as JSON so the traits stay object-safe;
//! [`AggregationRuntime`](crate::AggregationRuntime) converts to and from the
//! typed aggregate.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StoreError;
use crate::event::{Event, Identity};
use crate::versioning::{StreamGuard, StreamState};

/// A bounded window `(floor, ceiling]` of the global sequence.
///
/// `floor` is the watermark a shard held before the iteration and `ceiling`
/// the watermark it holds after committing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRange {
    /// Exclusive lower bound: the last sequence already applied.
    pub floor: u64,
    /// Inclusive upper bound.
    pub ceiling: u64,
}

impl EventRange {
    /// Create a range. `ceiling` is clamped to be at least `floor`.
    pub fn new(floor: u64, ceiling: u64) -> Self {
        Self {
            floor,
            ceiling: ceiling.max(floor),
        }
    }

    /// Returns `true` if `sequence` falls inside the range.
    pub fn contains(&self, sequence: u64) -> bool {
        sequence > self.floor && sequence <= self.ceiling
    }

    /// Number of sequence positions covered.
    pub fn size(&self) -> u64 {
        self.ceiling - self.floor
    }

    /// Returns `true` when the range covers no positions.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }
}

/// Which events a projection wants to see.
///
/// Tombstones never match. Archived events only match when
/// `include_archived` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Restrict to these event types. `None` accepts every type.
    pub event_types: Option<BTreeSet<String>>,
    /// Restrict to streams tagged with this aggregate type.
    pub aggregate_type: Option<String>,
    /// Deliver events of archived streams.
    pub include_archived: bool,
}

impl EventFilter {
    /// A filter accepting every live event.
    pub fn all() -> Self {
        Self::default()
    }

    /// Returns `true` if `event` passes the filter.
    pub fn matches(&self, event: &Event) -> bool {
        if event.is_tombstone() {
            return false;
        }
        if event.is_archived && !self.include_archived {
            return false;
        }
        if let Some(types) = &self.event_types
            && !types.contains(&event.event_type)
        {
            return false;
        }
        if let Some(aggregate_type) = &self.aggregate_type
            && event.aggregate_type.as_deref() != Some(aggregate_type.as_str())
        {
            return false;
        }
        true
    }
}

/// A document as persisted by the document store.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    /// Document identity.
    pub id: Identity,
    /// Serialized document body.
    pub data: Value,
    /// Version column, for versioned aggregates.
    pub version: Option<u64>,
}

/// A document write produced by the aggregation runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentOperation {
    /// Insert or replace a document.
    Upsert {
        /// Document type (the aggregate type name).
        document_type: String,
        /// Owning tenant.
        tenant_id: String,
        /// Document identity.
        id: Identity,
        /// Serialized document body.
        data: Value,
        /// Version to store alongside the body.
        version: Option<u64>,
        /// Version the writer loaded. The store rejects the write when the
        /// stored version differs. `None` skips the check.
        expected_version: Option<u64>,
    },
    /// Delete a document by identity.
    Delete {
        /// Document type (the aggregate type name).
        document_type: String,
        /// Owning tenant.
        tenant_id: String,
        /// Document identity.
        id: Identity,
    },
}

/// Move a shard's watermark from `from` to `to`.
///
/// The store rejects the update if the persisted watermark is not `from`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    /// Shard name.
    pub shard: String,
    /// Watermark the shard expects to be persisted.
    pub from: u64,
    /// New watermark.
    pub to: u64,
}

/// Everything written by one commit, applied atomically or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitOfWork {
    /// Events to append, with sequences already reserved.
    pub events: Vec<Event>,
    /// Per-stream version checks for the appended events.
    pub stream_guards: Vec<StreamGuard>,
    /// Streams to mark archived, as `(tenant, stream)`.
    pub archived_streams: Vec<(String, Identity)>,
    /// Document writes.
    pub operations: Vec<DocumentOperation>,
    /// Shard watermark moves.
    pub progress: Vec<ProgressUpdate>,
}

impl UnitOfWork {
    /// Returns `true` if committing this unit would change nothing.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
            && self.archived_streams.is_empty()
            && self.operations.is_empty()
            && self.progress.is_empty()
    }
}

/// Append-only event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Current state of a stream, or `None` if it was never appended to.
    async fn stream_state(
        &self,
        tenant_id: &str,
        stream: &Identity,
    ) -> Result<Option<StreamState>, StoreError>;

    /// Reserve `count` consecutive global sequence numbers.
    ///
    /// Reserved numbers are consumed even if the commit that uses them
    /// fails; the caller fills them with tombstones in that case.
    async fn reserve_sequences(&self, count: usize) -> Result<Vec<u64>, StoreError>;

    /// Append tombstones at the given reserved sequences.
    async fn write_tombstones(&self, sequences: &[u64]) -> Result<(), StoreError>;

    /// Events inside `range` that pass `filter`, in ascending sequence order.
    async fn load_range(
        &self,
        range: &EventRange,
        filter: &EventFilter,
    ) -> Result<Vec<Event>, StoreError>;

    /// Every event of one stream, in version order.
    async fn fetch_stream(&self, tenant_id: &str, stream: &Identity)
    -> Result<Vec<Event>, StoreError>;

    /// Highest sequence below which no position is missing.
    ///
    /// Reserved but uncommitted sequences hold this mark back until they are
    /// committed or tombstoned.
    async fn high_water_mark(&self) -> Result<u64, StoreError>;
}

/// Tenant-scoped keyed document storage plus shard progress.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Load one document.
    async fn load(
        &self,
        document_type: &str,
        tenant_id: &str,
        id: &Identity,
    ) -> Result<Option<StoredDocument>, StoreError>;

    /// Load every existing document among `ids` in one round trip.
    async fn load_many(
        &self,
        document_type: &str,
        tenant_id: &str,
        ids: &[Identity],
    ) -> Result<Vec<StoredDocument>, StoreError>;

    /// Persisted watermark of a shard, 0 if it never committed.
    async fn load_progress(&self, shard: &str) -> Result<u64, StoreError>;

    /// Delete every document of `document_type` and reset `shard` to 0.
    async fn teardown(&self, document_type: &str, shard: &str) -> Result<(), StoreError>;
}

/// The full relational backend: events, documents and atomic commits.
#[async_trait]
pub trait Storage: EventStore + DocumentStore {
    /// Apply a [`UnitOfWork`] atomically.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a stream guard, expected
    /// document version, or progress update does not hold; nothing is
    /// written in that case.
    async fn commit(&self, work: UnitOfWork) -> Result<(), StoreError>;
}
