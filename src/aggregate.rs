//! Aggregate trait, handler registration, and the fold.
//!
//! Handlers are registered explicitly per event type (or per [`EventFamily`])
//! on an [`AggregationBuilder`] and compiled once into an immutable
//! [`Aggregation`] dispatch table. The table is then shared by reference with
//! every runtime and shard that folds this aggregate.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use serde::{Serialize, de::DeserializeOwned};

use crate::error::{ApplyError, BoxError, ConfigError, ProjectionError, StoreError};
use crate::event::Event;

/// A materialized document derived from events.
///
/// # Contract
///
/// - Handlers registered for the aggregate must be deterministic: folding the
///   same events from the same starting snapshot yields the same result.
/// - Handlers must not have side effects outside the returned snapshot;
///   async ranges are redelivered after failures.
pub trait Aggregate: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. `"trip"`). Used as the document type.
    const AGGREGATE_TYPE: &'static str;

    /// Current version of the snapshot, for versioned aggregates.
    fn version(&self) -> Option<u64> {
        None
    }

    /// Stamp a new version on the snapshot. No-op for unversioned aggregates.
    fn set_version(&mut self, _version: u64) {}
}

/// A named set of event types handled as one.
///
/// A family stands in for a shared base type: a handler registered against
/// the family applies to every member, unless a member has its own exact
/// registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFamily {
    name: String,
    members: BTreeSet<String>,
}

impl EventFamily {
    /// Create a family from its member event types.
    pub fn new<I, S>(name: impl Into<String>, members: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    /// Family name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns `true` if `event_type` belongs to the family.
    pub fn contains(&self, event_type: &str) -> bool {
        self.members.contains(event_type)
    }

    /// Member event types.
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(String::as_str)
    }
}

/// What a handler is registered against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    /// One concrete event type.
    Type(String),
    /// Every member of a family.
    Family(EventFamily),
}

impl EventTarget {
    /// Returns `true` if this target covers `event_type`.
    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            EventTarget::Type(name) => name == event_type,
            EventTarget::Family(family) => family.contains(event_type),
        }
    }

    pub(crate) fn names(&self) -> Vec<String> {
        match self {
            EventTarget::Type(name) => vec![name.clone()],
            EventTarget::Family(family) => family.members().map(str::to_owned).collect(),
        }
    }
}

impl From<&str> for EventTarget {
    fn from(name: &str) -> Self {
        EventTarget::Type(name.to_owned())
    }
}

impl From<String> for EventTarget {
    fn from(name: String) -> Self {
        EventTarget::Type(name)
    }
}

impl From<EventFamily> for EventTarget {
    fn from(family: EventFamily) -> Self {
        EventTarget::Family(family)
    }
}

impl From<&EventFamily> for EventTarget {
    fn from(family: &EventFamily) -> Self {
        EventTarget::Family(family.clone())
    }
}

type CreateFn<A> = Arc<dyn Fn(Arc<Event>) -> BoxFuture<'static, Result<A, BoxError>> + Send + Sync>;
type ApplyFn<A> =
    Arc<dyn Fn(A, Arc<Event>) -> BoxFuture<'static, Result<Option<A>, BoxError>> + Send + Sync>;
type DeleteFn<A> =
    Arc<dyn Fn(A, Arc<Event>) -> BoxFuture<'static, Result<(A, bool), BoxError>> + Send + Sync>;
type CtorFn<A> = Arc<dyn Fn() -> A + Send + Sync>;
type MetadataFn<A> = Arc<dyn Fn(&mut A, &Event) + Send + Sync>;

enum Handler<A> {
    Create(CreateFn<A>),
    Apply(ApplyFn<A>),
    ShouldDelete(DeleteFn<A>),
}

struct Registration<A> {
    target: EventTarget,
    handler: Handler<A>,
}

/// Deserialize the payload of `event` into the handler's event type.
fn decode<E: DeserializeOwned>(event: &Event) -> Result<E, BoxError> {
    serde_json::from_value(event.data.clone()).map_err(|e| Box::new(e) as BoxError)
}

/// Collects handler registrations for one aggregate type.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{Aggregate, AggregationBuilder};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Default, Serialize, Deserialize)]
/// struct Party { name: String, size: u32 }
///
/// impl Aggregate for Party {
///     const AGGREGATE_TYPE: &'static str = "party";
/// }
///
/// #[derive(Deserialize)]
/// struct Started { name: String }
/// #[derive(Deserialize)]
/// struct Joined { count: u32 }
///
/// let aggregation = AggregationBuilder::<Party>::new()
///     .create("Started", |e: Started, _| Party { name: e.name, size: 0 })
///     .apply("Joined", |party: &mut Party, e: Joined, _| party.size += e.count)
///     .delete_on("Disbanded")
///     .build("parties")
///     .unwrap();
/// assert!(aggregation.handles("Joined"));
/// ```
pub struct AggregationBuilder<A: Aggregate> {
    registrations: Vec<Registration<A>>,
    default_ctor: Option<CtorFn<A>>,
    metadata: Option<MetadataFn<A>>,
}

impl<A: Aggregate> Default for AggregationBuilder<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: Aggregate> AggregationBuilder<A> {
    /// Create an empty builder.
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            default_ctor: None,
            metadata: None,
        }
    }

    fn register(mut self, target: EventTarget, handler: Handler<A>) -> Self {
        self.registrations.push(Registration { target, handler });
        self
    }

    /// Build the initial snapshot from an event.
    pub fn create<E, F>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(E, &Event) -> A + Send + Sync + 'static,
    {
        let handler: CreateFn<A> = Arc::new(move |event: Arc<Event>| {
            let result = decode::<E>(&event).map(|payload| f(payload, &event));
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Create(handler))
    }

    /// Build the initial snapshot from an event, failing with a handler error.
    pub fn try_create<E, F, Err>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(E, &Event) -> Result<A, Err> + Send + Sync + 'static,
        Err: Into<BoxError>,
    {
        let handler: CreateFn<A> = Arc::new(move |event: Arc<Event>| {
            let result =
                decode::<E>(&event).and_then(|payload| f(payload, &event).map_err(Into::into));
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Create(handler))
    }

    /// Build the initial snapshot asynchronously.
    pub fn create_async<E, F, Fut>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(E, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, BoxError>> + Send + 'static,
    {
        let handler: CreateFn<A> = Arc::new(move |event: Arc<Event>| match decode::<E>(&event) {
            Ok(payload) => f(payload, event).boxed(),
            Err(e) => future::ready(Err(e)).boxed(),
        });
        self.register(target.into(), Handler::Create(handler))
    }

    /// Fold an event by mutating the snapshot in place.
    pub fn apply<E, F>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(&mut A, E, &Event) + Send + Sync + 'static,
    {
        let handler: ApplyFn<A> = Arc::new(move |mut snapshot: A, event: Arc<Event>| {
            let result = decode::<E>(&event).map(|payload| {
                f(&mut snapshot, payload, &event);
                Some(snapshot)
            });
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Apply(handler))
    }

    /// Fold an event by mutating the snapshot in place, failing with a handler error.
    pub fn try_apply<E, F, Err>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(&mut A, E, &Event) -> Result<(), Err> + Send + Sync + 'static,
        Err: Into<BoxError>,
    {
        let handler: ApplyFn<A> = Arc::new(move |mut snapshot: A, event: Arc<Event>| {
            let result = decode::<E>(&event).and_then(|payload| {
                f(&mut snapshot, payload, &event)
                    .map(|()| Some(snapshot))
                    .map_err(Into::into)
            });
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Apply(handler))
    }

    /// Fold an event by returning a new snapshot value.
    pub fn apply_with<E, F>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(A, E, &Event) -> A + Send + Sync + 'static,
    {
        let handler: ApplyFn<A> = Arc::new(move |snapshot: A, event: Arc<Event>| {
            let result = decode::<E>(&event).map(|payload| Some(f(snapshot, payload, &event)));
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Apply(handler))
    }

    /// Fold an event, returning `None` to remove the document.
    pub fn apply_or_remove<E, F>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(A, E, &Event) -> Option<A> + Send + Sync + 'static,
    {
        let handler: ApplyFn<A> = Arc::new(move |snapshot: A, event: Arc<Event>| {
            let result = decode::<E>(&event).map(|payload| f(snapshot, payload, &event));
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::Apply(handler))
    }

    /// Fold an event asynchronously, e.g. to look up auxiliary data.
    pub fn apply_async<E, F, Fut>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(A, E, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<A, BoxError>> + Send + 'static,
    {
        let handler: ApplyFn<A> =
            Arc::new(move |snapshot: A, event: Arc<Event>| match decode::<E>(&event) {
                Ok(payload) => f(snapshot, payload, event).map(|r| r.map(Some)).boxed(),
                Err(e) => future::ready(Err(e)).boxed(),
            });
        self.register(target.into(), Handler::Apply(handler))
    }

    /// Decide, after the event was applied, whether the document is deleted.
    pub fn should_delete<E, F>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(&A, E, &Event) -> bool + Send + Sync + 'static,
    {
        let handler: DeleteFn<A> = Arc::new(move |snapshot: A, event: Arc<Event>| {
            let result = decode::<E>(&event).map(|payload| {
                let delete = f(&snapshot, payload, &event);
                (snapshot, delete)
            });
            future::ready(result).boxed()
        });
        self.register(target.into(), Handler::ShouldDelete(handler))
    }

    /// Asynchronous variant of [`should_delete`](Self::should_delete).
    ///
    /// The handler receives a clone of the current snapshot.
    pub fn should_delete_async<E, F, Fut>(self, target: impl Into<EventTarget>, f: F) -> Self
    where
        E: DeserializeOwned + Send + 'static,
        F: Fn(A, E, Arc<Event>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool, BoxError>> + Send + 'static,
    {
        let handler: DeleteFn<A> =
            Arc::new(move |snapshot: A, event: Arc<Event>| match decode::<E>(&event) {
                Ok(payload) => {
                    let decision = f(snapshot.clone(), payload, event);
                    async move { decision.await.map(|delete| (snapshot, delete)) }.boxed()
                }
                Err(e) => future::ready(Err(e)).boxed(),
            });
        self.register(target.into(), Handler::ShouldDelete(handler))
    }

    /// Delete the document whenever an event of this type is folded.
    pub fn delete_on(self, target: impl Into<EventTarget>) -> Self {
        let handler: DeleteFn<A> = Arc::new(|snapshot: A, _event: Arc<Event>| {
            future::ready(Ok((snapshot, true))).boxed()
        });
        self.register(target.into(), Handler::ShouldDelete(handler))
    }

    /// Constructor used when no create handler matches the first event.
    pub fn default_snapshot(mut self, ctor: impl Fn() -> A + Send + Sync + 'static) -> Self {
        self.default_ctor = Some(Arc::new(ctor));
        self
    }

    /// Use `A::default()` as the fallback constructor.
    pub fn with_default(self) -> Self
    where
        A: Default,
    {
        self.default_snapshot(A::default)
    }

    /// Stamp the final snapshot with the last applied event.
    pub fn apply_metadata(mut self, f: impl Fn(&mut A, &Event) + Send + Sync + 'static) -> Self {
        self.metadata = Some(Arc::new(f));
        self
    }

    /// Compile the registrations into a dispatch table.
    ///
    /// Exact registrations take precedence over family registrations; among
    /// families the first registration wins; among exact registrations of
    /// the same kind the last one wins.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoConstruction`] if the aggregate has neither
    /// a create handler nor a default constructor.
    pub fn build(self, projection: &str) -> Result<Aggregation<A>, ConfigError> {
        let has_create = self
            .registrations
            .iter()
            .any(|r| matches!(r.handler, Handler::Create(_)));
        if !has_create && self.default_ctor.is_none() {
            return Err(ConfigError::NoConstruction {
                projection: projection.to_owned(),
                aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            });
        }

        let names: BTreeSet<String> = self
            .registrations
            .iter()
            .flat_map(|r| r.target.names())
            .collect();

        let mut table = HashMap::with_capacity(names.len());
        for name in names {
            let handlers = Handlers {
                create: resolve(&self.registrations, &name, |h| match h {
                    Handler::Create(f) => Some(f.clone()),
                    _ => None,
                }),
                apply: resolve(&self.registrations, &name, |h| match h {
                    Handler::Apply(f) => Some(f.clone()),
                    _ => None,
                }),
                should_delete: resolve(&self.registrations, &name, |h| match h {
                    Handler::ShouldDelete(f) => Some(f.clone()),
                    _ => None,
                }),
            };
            table.insert(name, handlers);
        }

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            projection,
            event_types = table.len(),
            "aggregation compiled"
        );

        Ok(Aggregation {
            table,
            default_ctor: self.default_ctor,
            metadata: self.metadata,
        })
    }
}

/// Pick the handler of one kind for `name`: last exact match, else first family match.
fn resolve<A, T>(
    registrations: &[Registration<A>],
    name: &str,
    select: impl Fn(&Handler<A>) -> Option<T>,
) -> Option<T> {
    let exact = registrations
        .iter()
        .rev()
        .filter(|r| matches!(&r.target, EventTarget::Type(t) if t == name))
        .find_map(|r| select(&r.handler));
    exact.or_else(|| {
        registrations
            .iter()
            .filter(|r| matches!(&r.target, EventTarget::Family(f) if f.contains(name)))
            .find_map(|r| select(&r.handler))
    })
}

struct Handlers<A> {
    create: Option<CreateFn<A>>,
    apply: Option<ApplyFn<A>>,
    should_delete: Option<DeleteFn<A>>,
}

/// Result of folding a slice.
#[derive(Debug, Clone, PartialEq)]
pub enum FoldOutcome<A> {
    /// A snapshot exists after the fold.
    Built(A),
    /// The document must be deleted.
    Deleted,
    /// No snapshot existed and none could be started.
    Skipped,
}

/// Immutable dispatch table for one aggregate type.
pub struct Aggregation<A: Aggregate> {
    table: HashMap<String, Handlers<A>>,
    default_ctor: Option<CtorFn<A>>,
    metadata: Option<MetadataFn<A>>,
}

impl<A: Aggregate> std::fmt::Debug for Aggregation<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Aggregation")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("event_types", &self.table.len())
            .field("default_ctor", &self.default_ctor.is_some())
            .finish()
    }
}

impl<A: Aggregate> Aggregation<A> {
    /// Returns `true` if any handler is registered for `event_type`.
    pub fn handles(&self, event_type: &str) -> bool {
        self.table.contains_key(event_type)
    }

    /// Every event type with at least one handler.
    pub fn event_types(&self) -> BTreeSet<String> {
        self.table.keys().cloned().collect()
    }

    /// Fold `events` (ascending sequence order) onto `snapshot`.
    ///
    /// Per event, exactly one of create or apply fires. Should-delete runs
    /// after it; a deletion is final and the remaining events are not applied.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Apply`] wrapping a handler failure with the
    /// event's context, or [`ProjectionError::Store`] unchanged when a handler
    /// surfaced a collaborator failure.
    pub async fn fold(
        &self,
        events: &[Arc<Event>],
        snapshot: Option<A>,
    ) -> Result<FoldOutcome<A>, ProjectionError> {
        Ok(self.fold_counted(events, snapshot).await?.0)
    }

    /// Like [`fold`](Self::fold), also returning how many events were
    /// applied. Events without a handler and events skipped before the
    /// snapshot could start are not counted.
    ///
    /// # Errors
    ///
    /// Same as [`fold`](Self::fold).
    pub async fn fold_counted(
        &self,
        events: &[Arc<Event>],
        snapshot: Option<A>,
    ) -> Result<(FoldOutcome<A>, u64), ProjectionError> {
        let mut current = snapshot;
        let mut last_applied: Option<&Arc<Event>> = None;
        let mut applied = 0u64;

        for event in events {
            // Event types without any handler are not part of this aggregate.
            let Some(handlers) = self.table.get(&event.event_type) else {
                continue;
            };

            let next = match current.take() {
                None => {
                    if let Some(create) = &handlers.create {
                        Some(create(event.clone()).await.map_err(|e| self.wrap(event, e))?)
                    } else if let Some(ctor) = &self.default_ctor {
                        let seed = ctor();
                        match &handlers.apply {
                            Some(apply) => apply(seed, event.clone())
                                .await
                                .map_err(|e| self.wrap(event, e))?,
                            None => Some(seed),
                        }
                    } else {
                        tracing::debug!(
                            aggregate_type = A::AGGREGATE_TYPE,
                            event_type = %event.event_type,
                            sequence = event.sequence,
                            "no snapshot and no way to start one, event skipped"
                        );
                        continue;
                    }
                }
                Some(existing) => match &handlers.apply {
                    Some(apply) => apply(existing, event.clone())
                        .await
                        .map_err(|e| self.wrap(event, e))?,
                    None => Some(existing),
                },
            };

            let Some(built) = next else {
                return Ok((FoldOutcome::Deleted, applied + 1));
            };

            let built = match &handlers.should_delete {
                Some(should_delete) => {
                    let (built, delete) = should_delete(built, event.clone())
                        .await
                        .map_err(|e| self.wrap(event, e))?;
                    if delete {
                        return Ok((FoldOutcome::Deleted, applied + 1));
                    }
                    built
                }
                None => built,
            };

            current = Some(built);
            last_applied = Some(event);
            applied += 1;
        }

        match current {
            Some(mut snapshot) => {
                if let (Some(stamp), Some(event)) = (&self.metadata, last_applied) {
                    stamp(&mut snapshot, event);
                }
                Ok((FoldOutcome::Built(snapshot), applied))
            }
            None => Ok((FoldOutcome::Skipped, applied)),
        }
    }

    /// Classify a handler failure: collaborator errors pass through, everything
    /// else is wrapped with the event's context.
    fn wrap(&self, event: &Event, err: BoxError) -> ProjectionError {
        let err = match err.downcast::<StoreError>() {
            Ok(store) => return ProjectionError::Store(*store),
            Err(other) => other,
        };
        let err = match err.downcast::<ProjectionError>() {
            Ok(inner) => return *inner,
            Err(other) => other,
        };
        ProjectionError::Apply(ApplyError {
            aggregate_type: A::AGGREGATE_TYPE.to_owned(),
            event_type: event.event_type.clone(),
            sequence: event.sequence,
            stream: event.stream.clone(),
            tenant_id: event.tenant_id.clone(),
            source: err,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use std::sync::Arc;

    use serde::{Deserialize, Serialize};
    use serde_json::{Value, json};
    use uuid::Uuid;

    use super::{Aggregate, AggregationBuilder};
    use crate::event::{Event, EventMetadata, Identity};

    /// Versioned trip aggregate used across the crate's tests.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub(crate) struct Trip {
        pub name: String,
        pub miles: u32,
        pub legs: u32,
        pub version: u64,
        pub last_modified: u64,
    }

    impl Aggregate for Trip {
        const AGGREGATE_TYPE: &'static str = "trip";

        fn version(&self) -> Option<u64> {
            Some(self.version)
        }

        fn set_version(&mut self, version: u64) {
            self.version = version;
        }
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct Named {
        pub name: String,
    }

    #[derive(Debug, Deserialize)]
    pub(crate) struct Travelled {
        pub miles: u32,
    }

    /// Handlers for `Trip`: `TripStarted` creates, `TripRenamed` and
    /// `Travelled` apply, `TripAborted` deletes.
    pub(crate) fn trip_aggregation() -> AggregationBuilder<Trip> {
        AggregationBuilder::<Trip>::new()
            .create("TripStarted", |e: Named, _| Trip {
                name: e.name,
                ..Trip::default()
            })
            .apply("TripRenamed", |trip: &mut Trip, e: Named, _| trip.name = e.name)
            .apply("Travelled", |trip: &mut Trip, e: Travelled, _| {
                trip.miles += e.miles;
                trip.legs += 1;
            })
            .delete_on("TripAborted")
            .apply_metadata(|trip, event| trip.last_modified = event.timestamp)
    }

    pub(crate) fn event_on(
        stream: impl Into<Identity>,
        sequence: u64,
        version: u64,
        event_type: &str,
        data: Value,
    ) -> Event {
        Event {
            id: Uuid::new_v4(),
            sequence,
            stream: stream.into(),
            version,
            tenant_id: crate::DEFAULT_TENANT.to_owned(),
            event_type: event_type.to_owned(),
            timestamp: 1_700_000_000_000 + sequence,
            data,
            aggregate_type: Some("trip".to_owned()),
            metadata: EventMetadata::default(),
            is_archived: false,
        }
    }

    pub(crate) fn arc_events(events: Vec<Event>) -> Vec<Arc<Event>> {
        events.into_iter().map(Arc::new).collect()
    }

    pub(crate) fn started(stream: &str, sequence: u64, name: &str) -> Event {
        event_on(stream, sequence, 1, "TripStarted", json!({ "name": name }))
    }
}
