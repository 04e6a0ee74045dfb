//! Aggregate projections and an async projection daemon for event-sourced
//! relational stores.

mod aggregate;
pub use aggregate::{Aggregate, Aggregation, AggregationBuilder, EventFamily, EventTarget, FoldOutcome};
mod context;
mod daemon;
mod error;
mod event;
mod memory;
mod projection;
mod runtime;
mod session;
mod shard;
mod slicing;
mod storage;
mod store;
mod versioning;

pub use context::SessionContext;
pub use daemon::{DaemonConfig, ProjectionDaemon};
pub use error::{
    ApplyError, BoxError, ConcurrencyError, ConfigError, ProjectionError, StoreError,
};
pub use event::{
    DEFAULT_TENANT, Event, EventMetadata, Identity, NewEvent, StreamIdentity, TOMBSTONE_EVENT_TYPE,
    TOMBSTONE_STREAM, encode_domain_event,
};
pub use memory::InMemoryStorage;
pub use projection::{AggregateProjection, ProjectionLifecycle};
pub use runtime::{AggregationRuntime, DEFAULT_MAX_PARALLEL_SLICES, StorageOperation};
pub use session::EventSession;
pub use shard::{Cancellation, ShardName, ShardState, ShardStatus};
pub use slicing::{
    ActionType, EventGrouper, EventSlice, EventSlicer, FanOutPhase, IdentityGrouping,
    TenantSliceGroup,
};
pub use storage::{
    DocumentOperation, DocumentStore, EventFilter, EventRange, EventStore, ProgressUpdate,
    Storage, StoredDocument, UnitOfWork,
};
pub use store::{ProjectionStore, ProjectionStoreBuilder, StoreOptions, TenancyStyle};
pub use versioning::{
    ExpectedVersion, StreamGuard, StreamState, assign_versions, check_expected_version,
};
