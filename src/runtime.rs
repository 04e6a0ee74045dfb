//! Turns event slices into document writes.
//!
//! [`AggregationRuntime`] is the glue between the slicer, the fold and the
//! document store. It is used in three modes:
//!
//! - **inline**: [`determine_operation`](AggregationRuntime::determine_operation)
//!   for one slice, inside the same unit of work as the triggering append;
//! - **async**: [`determine_operations`](AggregationRuntime::determine_operations)
//!   for every slice of a shard range, with one bulk snapshot pre-load per
//!   tenant and bounded parallelism across identities;
//! - **live**: [`live`](AggregationRuntime::live) folds on demand and never
//!   persists.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;

use crate::aggregate::{Aggregate, Aggregation, FoldOutcome};
use crate::error::{ProjectionError, StoreError};
use crate::event::{Event, Identity};
use crate::slicing::{ActionType, EventSlice, TenantSliceGroup};
use crate::storage::{DocumentOperation, Storage, StoredDocument};

/// Default number of slices folded concurrently.
pub const DEFAULT_MAX_PARALLEL_SLICES: usize = 8;

/// A typed document write produced by one slice.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOperation<A> {
    /// Store the snapshot.
    Upsert {
        /// Owning tenant.
        tenant_id: String,
        /// Document identity.
        id: Identity,
        /// The folded snapshot, version already stamped.
        snapshot: A,
        /// Version of the snapshot the fold started from.
        expected_version: Option<u64>,
    },
    /// Remove the document.
    Delete {
        /// Owning tenant.
        tenant_id: String,
        /// Document identity.
        id: Identity,
    },
}

impl<A: Aggregate> StorageOperation<A> {
    /// Document identity targeted by the operation.
    pub fn id(&self) -> &Identity {
        match self {
            StorageOperation::Upsert { id, .. } | StorageOperation::Delete { id, .. } => id,
        }
    }

    /// Serialize into the untyped form submitted to [`Storage::commit`](crate::Storage::commit).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Serialization`] if the snapshot cannot be serialized.
    pub fn into_document(self) -> Result<DocumentOperation, StoreError> {
        Ok(match self {
            StorageOperation::Upsert {
                tenant_id,
                id,
                snapshot,
                expected_version,
            } => DocumentOperation::Upsert {
                document_type: A::AGGREGATE_TYPE.to_owned(),
                tenant_id,
                id,
                version: snapshot.version(),
                data: serde_json::to_value(&snapshot)?,
                expected_version,
            },
            StorageOperation::Delete { tenant_id, id } => DocumentOperation::Delete {
                document_type: A::AGGREGATE_TYPE.to_owned(),
                tenant_id,
                id,
            },
        })
    }
}

/// Outcome of one slice within a batch, keyed by identity.
pub(crate) struct SliceResult<A> {
    pub id: Identity,
    pub tenant_id: String,
    pub result: Result<Option<StorageOperation<A>>, ProjectionError>,
}

/// Folds slices of one aggregate type and produces storage operations.
pub struct AggregationRuntime<A: Aggregate> {
    aggregation: Arc<Aggregation<A>>,
    single_stream: bool,
    max_parallel: usize,
}

impl<A: Aggregate> Clone for AggregationRuntime<A> {
    fn clone(&self) -> Self {
        Self {
            aggregation: Arc::clone(&self.aggregation),
            single_stream: self.single_stream,
            max_parallel: self.max_parallel,
        }
    }
}

impl<A: Aggregate> std::fmt::Debug for AggregationRuntime<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregationRuntime")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("single_stream", &self.single_stream)
            .field("max_parallel", &self.max_parallel)
            .finish()
    }
}

impl<A: Aggregate> AggregationRuntime<A> {
    /// Create a runtime over a compiled aggregation.
    ///
    /// `single_stream` selects how snapshot versions are stamped and whether a
    /// [`ActionType::Start`] slice may skip loading.
    pub fn new(aggregation: Arc<Aggregation<A>>, single_stream: bool) -> Self {
        Self {
            aggregation,
            single_stream,
            max_parallel: DEFAULT_MAX_PARALLEL_SLICES,
        }
    }

    /// Set how many slices may fold concurrently. Values below 1 are raised to 1.
    pub fn with_max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel.max(1);
        self
    }

    /// The compiled aggregation.
    pub fn aggregation(&self) -> &Aggregation<A> {
        &self.aggregation
    }

    /// Load and decode one stored snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Store`] if the store fails or the stored
    /// document does not decode.
    pub async fn load_snapshot(
        &self,
        documents: &dyn Storage,
        tenant_id: &str,
        id: &Identity,
    ) -> Result<Option<A>, ProjectionError> {
        match documents.load(A::AGGREGATE_TYPE, tenant_id, id).await? {
            Some(doc) => Ok(Some(decode(doc)?)),
            None => Ok(None),
        }
    }

    /// Inline path: produce the write for a single slice.
    ///
    /// The stored snapshot is loaded unless one is pre-attached to the slice,
    /// or the slice starts a new stream of a single-stream projection.
    ///
    /// # Returns
    ///
    /// `None` when nothing must be written.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Apply`] for handler failures and
    /// [`ProjectionError::Store`] for load failures.
    pub async fn determine_operation(
        &self,
        documents: &dyn Storage,
        mut slice: EventSlice<A>,
    ) -> Result<Option<StorageOperation<A>>, ProjectionError> {
        let snapshot = match slice.take_snapshot() {
            Some(attached) => Some(attached),
            None if self.single_stream && slice.action_type() == ActionType::Start => None,
            None => {
                self.load_snapshot(documents, slice.tenant_id(), slice.id())
                    .await?
            }
        };
        self.resolve(slice, snapshot).await
    }

    /// Async path: produce one write per slice for whole tenant groups.
    ///
    /// # Errors
    ///
    /// Fails with the first slice error, in slice order.
    pub async fn determine_operations(
        &self,
        documents: &dyn Storage,
        groups: Vec<TenantSliceGroup<A>>,
    ) -> Result<Vec<StorageOperation<A>>, ProjectionError> {
        let results = self.resolve_groups(documents, groups).await?;
        let mut operations = Vec::with_capacity(results.len());
        for slice in results {
            if let Some(op) = slice.result? {
                operations.push(op);
            }
        }
        Ok(operations)
    }

    /// Pre-load every tenant group's snapshots with one `load_many` each, then
    /// fold all slices with bounded parallelism. Results keep slice order.
    pub(crate) async fn resolve_groups(
        &self,
        documents: &dyn Storage,
        groups: Vec<TenantSliceGroup<A>>,
    ) -> Result<Vec<SliceResult<A>>, ProjectionError> {
        let mut jobs = Vec::new();
        for group in groups {
            let ids: Vec<Identity> = group.slices.iter().map(|s| s.id().clone()).collect();
            let stored = documents
                .load_many(A::AGGREGATE_TYPE, &group.tenant_id, &ids)
                .await?;
            let mut loaded: HashMap<Identity, A> = HashMap::with_capacity(stored.len());
            for doc in stored {
                let id = doc.id.clone();
                loaded.insert(id, decode(doc)?);
            }
            for mut slice in group.slices {
                let snapshot = slice
                    .take_snapshot()
                    .or_else(|| loaded.remove(slice.id()));
                jobs.push((slice, snapshot));
            }
        }

        let results = futures::stream::iter(jobs.into_iter().map(|(slice, snapshot)| async move {
            let id = slice.id().clone();
            let tenant_id = slice.tenant_id().to_owned();
            let result = self.resolve(slice, snapshot).await;
            SliceResult {
                id,
                tenant_id,
                result,
            }
        }))
        .buffered(self.max_parallel)
        .collect::<Vec<_>>()
        .await;
        Ok(results)
    }

    /// Live path: fold `events` onto `snapshot` and return the result without
    /// persisting it.
    ///
    /// # Returns
    ///
    /// `None` if the aggregate was deleted or never started.
    pub async fn live(
        &self,
        id: Identity,
        tenant_id: &str,
        events: Vec<Event>,
        snapshot: Option<A>,
    ) -> Result<Option<A>, ProjectionError> {
        let slice = EventSlice::new(id, tenant_id, events.into_iter().map(Arc::new).collect());
        let previous = snapshot.as_ref().and_then(Aggregate::version);
        match self.aggregation.fold_counted(slice.events(), snapshot).await? {
            (FoldOutcome::Built(mut snapshot), applied) => {
                self.stamp_version(&mut snapshot, &slice, previous, applied);
                Ok(Some(snapshot))
            }
            (FoldOutcome::Deleted | FoldOutcome::Skipped, _) => Ok(None),
        }
    }

    async fn resolve(
        &self,
        slice: EventSlice<A>,
        snapshot: Option<A>,
    ) -> Result<Option<StorageOperation<A>>, ProjectionError> {
        let existed = snapshot.is_some();
        let previous = snapshot.as_ref().and_then(Aggregate::version);

        let (outcome, applied) = self.aggregation.fold_counted(slice.events(), snapshot).await?;
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            id = %slice.id(),
            tenant_id = slice.tenant_id(),
            events = slice.len(),
            applied,
            outcome = outcome_name(&outcome),
            "slice folded"
        );

        Ok(match outcome {
            FoldOutcome::Built(mut built) => {
                self.stamp_version(&mut built, &slice, previous, applied);
                Some(StorageOperation::Upsert {
                    tenant_id: slice.tenant_id().to_owned(),
                    id: slice.id().clone(),
                    snapshot: built,
                    expected_version: previous,
                })
            }
            FoldOutcome::Deleted if existed => Some(StorageOperation::Delete {
                tenant_id: slice.tenant_id().to_owned(),
                id: slice.id().clone(),
            }),
            FoldOutcome::Deleted | FoldOutcome::Skipped => None,
        })
    }

    /// Single-stream snapshots take the version of their stream, including
    /// events the projection does not handle; multi-stream snapshots count
    /// the events applied to them.
    fn stamp_version(
        &self,
        snapshot: &mut A,
        slice: &EventSlice<A>,
        previous: Option<u64>,
        applied: u64,
    ) {
        let version = if self.single_stream {
            slice
                .stream_version()
                .or_else(|| slice.last_event().map(|e| e.version))
        } else {
            Some(previous.unwrap_or(0) + applied)
        };
        if let Some(version) = version {
            snapshot.set_version(version);
        }
    }
}

fn decode<A: Aggregate>(doc: StoredDocument) -> Result<A, StoreError> {
    Ok(serde_json::from_value(doc.data)?)
}

fn outcome_name<A>(outcome: &FoldOutcome<A>) -> &'static str {
    match outcome {
        FoldOutcome::Built(_) => "built",
        FoldOutcome::Deleted => "deleted",
        FoldOutcome::Skipped => "skipped",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Trip, arc_events, event_on, started, trip_aggregation};
    use crate::memory::InMemoryStorage;
    use crate::storage::{Storage, UnitOfWork};
    use crate::{DEFAULT_TENANT, EventSlicer};
    use serde_json::json;

    fn runtime(single_stream: bool) -> AggregationRuntime<Trip> {
        let aggregation = trip_aggregation().build("trips").expect("valid config");
        AggregationRuntime::new(Arc::new(aggregation), single_stream)
    }

    async fn store_trip(storage: &InMemoryStorage, id: &str, trip: Trip) {
        let op = StorageOperation::Upsert {
            tenant_id: DEFAULT_TENANT.to_owned(),
            id: Identity::from(id),
            snapshot: trip,
            expected_version: None,
        };
        storage
            .commit(UnitOfWork {
                operations: vec![op.into_document().expect("serialize")],
                ..UnitOfWork::default()
            })
            .await
            .expect("commit");
    }

    #[tokio::test]
    async fn created_then_renamed_is_stamped_with_stream_version() {
        let storage = InMemoryStorage::new();
        let slice = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![
                started("t-1", 1, "A"),
                event_on("t-1", 2, 2, "TripRenamed", json!({"name": "B"})),
            ]),
        );

        let op = runtime(true)
            .determine_operation(&storage, slice)
            .await
            .expect("fold")
            .expect("an upsert");
        let StorageOperation::Upsert { snapshot, expected_version, .. } = op else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.name, "B");
        assert_eq!(snapshot.version, 2);
        assert_eq!(expected_version, None);
    }

    #[tokio::test]
    async fn out_of_order_slice_is_folded_in_sequence_order() {
        let storage = InMemoryStorage::new();
        let slice = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![
                event_on("t-1", 3, 3, "TripRenamed", json!({"name": "C"})),
                started("t-1", 1, "A"),
                event_on("t-1", 2, 2, "TripRenamed", json!({"name": "B"})),
            ]),
        );
        let op = runtime(true)
            .determine_operation(&storage, slice)
            .await
            .expect("fold")
            .expect("an upsert");
        let StorageOperation::Upsert { snapshot, .. } = op else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.name, "C");
        assert_eq!(snapshot.version, 3);
    }

    #[tokio::test]
    async fn append_slice_loads_existing_snapshot() {
        let storage = InMemoryStorage::new();
        store_trip(
            &storage,
            "t-1",
            Trip {
                name: "A".into(),
                miles: 10,
                version: 1,
                ..Trip::default()
            },
        )
        .await;

        let slice = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![event_on("t-1", 5, 2, "Travelled", json!({"miles": 5}))]),
        );
        let op = runtime(true)
            .determine_operation(&storage, slice)
            .await
            .expect("fold")
            .expect("an upsert");
        let StorageOperation::Upsert { snapshot, expected_version, .. } = op else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.miles, 15);
        assert_eq!(snapshot.version, 2);
        assert_eq!(expected_version, Some(1));
    }

    #[tokio::test]
    async fn delete_only_emitted_for_existing_documents() {
        let storage = InMemoryStorage::new();
        let aborted_new = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![
                started("t-1", 1, "A"),
                event_on("t-1", 2, 2, "TripAborted", json!(null)),
            ]),
        );
        assert!(
            runtime(true)
                .determine_operation(&storage, aborted_new)
                .await
                .expect("fold")
                .is_none()
        );

        store_trip(&storage, "t-2", Trip::default()).await;
        let aborted_existing = EventSlice::new(
            Identity::from("t-2"),
            DEFAULT_TENANT,
            arc_events(vec![event_on("t-2", 7, 4, "TripAborted", json!(null))]),
        );
        let op = runtime(true)
            .determine_operation(&storage, aborted_existing)
            .await
            .expect("fold");
        assert!(matches!(op, Some(StorageOperation::Delete { .. })));
    }

    #[tokio::test]
    async fn multi_stream_version_counts_applied_events() {
        let storage = InMemoryStorage::new();
        store_trip(
            &storage,
            "trip-9",
            Trip {
                version: 4,
                ..Trip::default()
            },
        )
        .await;
        let events = vec![
            event_on("leg-1", 10, 1, "Travelled", json!({"miles": 1, "trip": "trip-9"})),
            event_on("leg-2", 11, 1, "Travelled", json!({"miles": 2, "trip": "trip-9"})),
        ];
        let slicer = EventSlicer::by_rules()
            .identity("Travelled", |e| e.data["trip"].as_str().map(Identity::from));
        let groups = slicer.slice::<Trip>(events, &storage).await.expect("slice");

        let ops = runtime(false)
            .determine_operations(&storage, groups)
            .await
            .expect("fold");
        assert_eq!(ops.len(), 1);
        let StorageOperation::Upsert { snapshot, expected_version, .. } = &ops[0] else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.version, 6);
        assert_eq!(snapshot.miles, 3);
        assert_eq!(*expected_version, Some(4));
    }

    #[tokio::test]
    async fn multi_stream_version_ignores_unhandled_events() {
        let storage = InMemoryStorage::new();
        let events = vec![
            event_on("leg-1", 1, 1, "Travelled", json!({"miles": 4, "trip": "trip-3"})),
            event_on("leg-1", 2, 2, "Noted", json!({"trip": "trip-3"})),
        ];
        let slicer = EventSlicer::by_rules()
            .identity("Travelled", |e| e.data["trip"].as_str().map(Identity::from))
            .identity("Noted", |e| e.data["trip"].as_str().map(Identity::from));
        let groups = slicer.slice::<Trip>(events, &storage).await.expect("slice");
        assert_eq!(groups[0].slices[0].len(), 2);

        let aggregation = trip_aggregation()
            .with_default()
            .build("trips")
            .expect("valid config");
        let ops = AggregationRuntime::new(Arc::new(aggregation), false)
            .determine_operations(&storage, groups)
            .await
            .expect("fold");
        let StorageOperation::Upsert { snapshot, .. } = &ops[0] else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.miles, 4);
        assert_eq!(snapshot.version, 1);
    }

    #[tokio::test]
    async fn filtered_slice_is_stamped_with_stream_version() {
        let storage = InMemoryStorage::new();
        let mut slice = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![
                started("t-1", 1, "A"),
                event_on("t-1", 2, 2, "Noted", json!({})),
            ]),
        );
        slice.retain_events(|e| e.event_type != "Noted");
        assert_eq!(slice.len(), 1);
        assert_eq!(slice.stream_version(), Some(2));

        let op = runtime(true)
            .determine_operation(&storage, slice)
            .await
            .expect("fold")
            .expect("an upsert");
        let StorageOperation::Upsert { snapshot, .. } = op else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.version, 2);
    }

    #[tokio::test]
    async fn attached_snapshot_is_used_instead_of_the_stored_one() {
        let storage = InMemoryStorage::new();
        store_trip(
            &storage,
            "t-1",
            Trip {
                name: "stored".into(),
                miles: 10,
                version: 1,
                ..Trip::default()
            },
        )
        .await;

        let attached = Trip {
            name: "attached".into(),
            miles: 100,
            version: 1,
            ..Trip::default()
        };
        let slice = EventSlice::new(
            Identity::from("t-1"),
            DEFAULT_TENANT,
            arc_events(vec![event_on("t-1", 5, 2, "Travelled", json!({"miles": 5}))]),
        )
        .with_snapshot(Some(attached));

        let op = runtime(true)
            .determine_operation(&storage, slice)
            .await
            .expect("fold")
            .expect("an upsert");
        let StorageOperation::Upsert { snapshot, expected_version, .. } = op else {
            panic!("expected upsert");
        };
        assert_eq!(snapshot.name, "attached");
        assert_eq!(snapshot.miles, 105);
        assert_eq!(snapshot.version, 2);
        assert_eq!(expected_version, Some(1));
    }

    #[tokio::test]
    async fn bulk_path_keeps_slice_order() {
        let storage = InMemoryStorage::new();
        let events: Vec<Event> = (1..=20)
            .map(|i| started(&format!("t-{i:02}"), i, "x"))
            .collect();
        let groups = EventSlicer::by_stream()
            .slice::<Trip>(events, &storage)
            .await
            .expect("slice");
        let ops = runtime(true)
            .with_max_parallel(3)
            .determine_operations(&storage, groups)
            .await
            .expect("fold");
        let ids: Vec<String> = ops.iter().map(|op| op.id().to_string()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn live_fold_is_not_persisted() {
        let storage = InMemoryStorage::new();
        let snapshot = runtime(true)
            .live(
                Identity::from("t-1"),
                DEFAULT_TENANT,
                vec![
                    started("t-1", 1, "A"),
                    event_on("t-1", 2, 2, "Travelled", json!({"miles": 4})),
                ],
                None,
            )
            .await
            .expect("fold")
            .expect("snapshot");
        assert_eq!(snapshot.miles, 4);
        assert_eq!(snapshot.version, 2);
        assert_eq!(storage.document_count("trip").await, 0);
    }

    #[tokio::test]
    async fn corrupt_document_is_a_store_error() {
        let storage = InMemoryStorage::new();
        storage
            .commit(UnitOfWork {
                operations: vec![DocumentOperation::Upsert {
                    document_type: "trip".into(),
                    tenant_id: DEFAULT_TENANT.into(),
                    id: "t-1".into(),
                    data: json!("not a trip"),
                    version: None,
                    expected_version: None,
                }],
                ..UnitOfWork::default()
            })
            .await
            .expect("commit");
        let err = runtime(true)
            .load_snapshot(&storage, DEFAULT_TENANT, &Identity::from("t-1"))
            .await
            .expect_err("must not decode");
        assert!(matches!(err, ProjectionError::Store(StoreError::Serialization(_))));
    }
}
