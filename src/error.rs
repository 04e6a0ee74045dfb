//! Crate-level error types for configuration, folding, concurrency and storage.

use crate::event::Identity;

/// Boxed error returned by user handlers and custom groupers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error returned by any projection, session, or daemon operation.
///
/// Each variant is a distinct failure class with its own recovery policy:
/// configuration errors are fatal at build time, apply errors halt the
/// affected shard, concurrency errors are retryable, and store errors are
/// infrastructural and passed through untouched.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The projection configuration is invalid.
    ///
    /// Only ever raised while building a [`ProjectionStore`](crate::ProjectionStore);
    /// never deferred to event processing.
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// A user handler failed while folding a specific event.
    #[error(transparent)]
    Apply(#[from] ApplyError),

    /// An optimistic concurrency check failed.
    ///
    /// Raised for stream version mismatches on append, document version
    /// mismatches on upsert, and out-of-order shard progress updates.
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),

    /// A storage collaborator failed.
    ///
    /// Forwarded unchanged, including when the failure surfaced from inside
    /// an async user handler.
    #[error(transparent)]
    Store(StoreError),

    /// The operation was interrupted by a cancellation signal.
    #[error("operation cancelled")]
    Cancelled,

    /// A shard stopped on a non-retryable failure.
    #[error("shard '{shard}' faulted: {reason}")]
    ShardFaulted {
        /// Shard name.
        shard: String,
        /// Rendered error that halted the shard.
        reason: String,
    },

    /// A shard did not reach the awaited sequence in time.
    #[error("shard '{shard}' did not reach sequence {sequence} in time")]
    Timeout {
        /// Shard name.
        shard: String,
        /// Sequence that was awaited.
        sequence: u64,
    },
}

impl From<StoreError> for ProjectionError {
    fn from(err: StoreError) -> Self {
        // Conflicts reported by the store are concurrency failures, not
        // infrastructure failures.
        match err {
            StoreError::Conflict(conflict) => ProjectionError::Concurrency(conflict),
            other => ProjectionError::Store(other),
        }
    }
}

impl ProjectionError {
    /// Returns `true` when retrying the same work may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProjectionError::Concurrency(_) | ProjectionError::Store(_)
        )
    }
}

/// Invalid projection or store configuration, detected at build time.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A multi-stream projection registered no identity rule and no grouper.
    #[error("projection '{projection}' has no way to resolve aggregate identities")]
    NoIdentity {
        /// Name of the offending projection.
        projection: String,
    },

    /// The aggregate can never be constructed.
    #[error(
        "projection '{projection}' has no create handler and no default constructor for '{aggregate_type}'"
    )]
    NoConstruction {
        /// Name of the offending projection.
        projection: String,
        /// Aggregate type name.
        aggregate_type: String,
    },

    /// Events are tenant-partitioned but the aggregate documents are not.
    #[error(
        "projection '{projection}' stores single-tenant documents but events use conjoined tenancy"
    )]
    TenancyMismatch {
        /// Name of the offending projection.
        projection: String,
    },

    /// The projection expects a different stream identity shape than the store.
    #[error("projection '{projection}' expects {expected:?} stream identities, store uses {actual:?}")]
    IdentityMismatch {
        /// Name of the offending projection.
        projection: String,
        /// Identity shape declared by the projection.
        expected: crate::event::StreamIdentity,
        /// Identity shape used by the store.
        actual: crate::event::StreamIdentity,
    },

    /// Two projections were registered under the same name.
    #[error("projection '{0}' is registered more than once")]
    DuplicateProjection(String),

    /// A shard operation referenced a projection that is not registered.
    #[error("no async projection named '{0}'")]
    UnknownShard(String),

    /// No projection folds the requested aggregate type.
    #[error("no projection registered for aggregate type '{0}'")]
    UnknownAggregate(String),
}

/// A user handler failed while applying an event.
///
/// Carries the identity of the offending event so that a faulted shard or a
/// failed inline write can be traced back to the exact fact that broke the fold.
#[derive(Debug, thiserror::Error)]
#[error(
    "failed to apply event '{event_type}' (sequence {sequence}, stream {stream}, tenant '{tenant_id}') to '{aggregate_type}': {source}"
)]
pub struct ApplyError {
    /// Aggregate type being folded.
    pub aggregate_type: String,
    /// Type tag of the event that failed.
    pub event_type: String,
    /// Global sequence of the event that failed.
    pub sequence: u64,
    /// Stream the event belongs to.
    pub stream: Identity,
    /// Tenant the event belongs to.
    pub tenant_id: String,
    /// The handler's own error.
    #[source]
    pub source: BoxError,
}

/// An optimistic concurrency check failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConcurrencyError {
    /// A stream was not at the version the writer expected.
    #[error("stream {stream} expected version {expected}, actual {actual}")]
    Stream {
        /// Stream that failed the check.
        stream: Identity,
        /// The version the writer expected (rendered from `ExpectedVersion`).
        expected: String,
        /// The version the stream is actually at.
        actual: u64,
    },

    /// A document was modified since it was loaded.
    #[error("document '{document_type}' {id} expected version {expected:?}, actual {actual:?}")]
    Document {
        /// Document (aggregate) type.
        document_type: String,
        /// Document identity.
        id: Identity,
        /// Version the writer loaded.
        expected: Option<u64>,
        /// Version currently stored.
        actual: Option<u64>,
    },

    /// A shard tried to move its watermark from a position it no longer holds.
    #[error("shard '{shard}' progress expected at {expected}, actual {actual}")]
    Progress {
        /// Shard name.
        shard: String,
        /// Watermark the shard believed was persisted.
        expected: u64,
        /// Watermark actually persisted.
        actual: u64,
    },
}

/// Failure reported by a storage collaborator.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The store rejected a write because of a version conflict.
    #[error(transparent)]
    Conflict(ConcurrencyError),

    /// A document or payload could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transport, connection, or command failure.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}
