//! Top-level entry point that composes registered projections, write
//! sessions and the async daemon into a single [`ProjectionStore`].
//!
//! The store is assembled via [`ProjectionStoreBuilder`], which validates
//! every projection once and freezes the configuration. Nothing about a
//! built store can change afterwards.

use std::collections::HashSet;
use std::sync::Arc;

use crate::aggregate::Aggregate;
use crate::context::SessionContext;
use crate::daemon::{DaemonConfig, ProjectionDaemon};
use crate::error::{ConfigError, ProjectionError};
use crate::event::{DEFAULT_TENANT, Event, Identity, StreamIdentity};
use crate::projection::{
    AggregateProjection, CompiledProjection, ProjectionLifecycle, ProjectionSource,
};
use crate::session::EventSession;
use crate::storage::Storage;

/// How events and documents are partitioned by tenant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum TenancyStyle {
    /// Everything lives under [`DEFAULT_TENANT`].
    #[default]
    Single,
    /// Rows carry the tenant of the session that wrote them.
    Conjoined,
}

/// Store-wide settings that projections are validated against.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{StoreOptions, StreamIdentity, TenancyStyle};
///
/// let options = StoreOptions::default()
///     .tenancy(TenancyStyle::Conjoined)
///     .stream_identity(StreamIdentity::AsString);
/// assert_eq!(options.tenancy, TenancyStyle::Conjoined);
/// assert_eq!(options.default_tenant, "*DEFAULT*");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOptions {
    /// Tenancy of the event log. Default: [`TenancyStyle::Single`].
    pub tenancy: TenancyStyle,
    /// Shape of stream identities. Default: [`StreamIdentity::AsGuid`].
    pub stream_identity: StreamIdentity,
    /// Tenant used by [`ProjectionStore::session`]. Default: [`DEFAULT_TENANT`].
    pub default_tenant: String,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            tenancy: TenancyStyle::Single,
            stream_identity: StreamIdentity::AsGuid,
            default_tenant: DEFAULT_TENANT.to_owned(),
        }
    }
}

impl StoreOptions {
    /// Set the event log tenancy.
    pub fn tenancy(mut self, tenancy: TenancyStyle) -> Self {
        self.tenancy = tenancy;
        self
    }

    /// Set the stream identity shape.
    pub fn stream_identity(mut self, kind: StreamIdentity) -> Self {
        self.stream_identity = kind;
        self
    }

    /// Set the tenant used by sessions opened without one.
    pub fn default_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.default_tenant = tenant.into();
        self
    }
}

struct StoreInner {
    storage: Arc<dyn Storage>,
    options: StoreOptions,
    projections: Vec<Arc<dyn ProjectionSource>>,
    daemon: ProjectionDaemon,
}

/// Registry of validated projections over one storage backend.
///
/// Opens write sessions that apply inline projections, folds streams on
/// demand, and owns the [`ProjectionDaemon`] for async projections.
///
/// `Clone` is cheap: all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct ProjectionStore {
    inner: Arc<StoreInner>,
}

// Manual `Debug` because projections are trait objects.
impl std::fmt::Debug for ProjectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionStore")
            .field("options", &self.inner.options)
            .field("projections", &self.projection_names())
            .finish()
    }
}

impl ProjectionStore {
    /// Start configuring a store over `storage`.
    pub fn builder(storage: Arc<dyn Storage>) -> ProjectionStoreBuilder {
        ProjectionStoreBuilder::new(storage)
    }

    /// Store-wide options the projections were compiled with.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// The storage collaborator shared by sessions and shards.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.inner.storage
    }

    /// Names of every registered projection, in registration order.
    pub fn projection_names(&self) -> Vec<&str> {
        self.inner.projections.iter().map(|p| p.name()).collect()
    }

    /// Controller for the async projections' shards.
    pub fn daemon(&self) -> &ProjectionDaemon {
        &self.inner.daemon
    }

    /// Open a write session for the default tenant.
    pub fn session(&self) -> EventSession {
        self.session_for(self.inner.options.default_tenant.clone())
    }

    /// Open a write session for `tenant_id`.
    pub fn session_for(&self, tenant_id: impl Into<String>) -> EventSession {
        EventSession::new(self.clone(), tenant_id.into(), SessionContext::default())
    }

    pub(crate) fn inline_projections(&self) -> impl Iterator<Item = &Arc<dyn ProjectionSource>> {
        self.inner
            .projections
            .iter()
            .filter(|p| p.lifecycle() == ProjectionLifecycle::Inline)
    }

    fn compiled<A: Aggregate>(&self) -> Result<&CompiledProjection<A>, ProjectionError> {
        self.inner
            .projections
            .iter()
            .filter(|p| p.document_type() == A::AGGREGATE_TYPE)
            .find_map(|p| p.as_any().downcast_ref::<CompiledProjection<A>>())
            .ok_or_else(|| ConfigError::UnknownAggregate(A::AGGREGATE_TYPE.to_owned()).into())
    }

    /// Fold one stream on demand, without persisting anything.
    ///
    /// # Arguments
    ///
    /// * `tenant_id` - Tenant the stream belongs to.
    /// * `id` - Stream identity.
    /// * `version` - Fold only events up to this stream version; `None`
    ///   folds the whole stream.
    ///
    /// # Returns
    ///
    /// The aggregate, or `None` if the stream is empty, was never created,
    /// or ended in a deletion.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownAggregate`] if no projection folds `A`,
    /// and fold or store errors otherwise.
    pub async fn aggregate_stream<A: Aggregate>(
        &self,
        tenant_id: &str,
        id: impl Into<Identity>,
        version: Option<u64>,
    ) -> Result<Option<A>, ProjectionError> {
        let compiled = self.compiled::<A>()?;
        let id = id.into();

        let events: Vec<Event> = self
            .inner
            .storage
            .fetch_stream(tenant_id, &id)
            .await?
            .into_iter()
            .filter(|e| !e.is_tombstone())
            .filter(|e| version.is_none_or(|v| e.version <= v))
            .collect();

        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            %id,
            tenant_id,
            events = events.len(),
            "aggregating stream"
        );
        if events.is_empty() {
            return Ok(None);
        }
        compiled.runtime().live(id, tenant_id, events, None).await
    }

    /// Load the persisted document of `A` for one identity.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownAggregate`] if no projection builds
    /// `A`, or a store error if the document cannot be read or decoded.
    pub async fn load<A: Aggregate>(
        &self,
        tenant_id: &str,
        id: impl Into<Identity>,
    ) -> Result<Option<A>, ProjectionError> {
        let compiled = self.compiled::<A>()?;
        let id = id.into();
        compiled
            .runtime()
            .load_snapshot(
                self.inner.storage.as_ref(),
                compiled.document_tenant(tenant_id),
                &id,
            )
            .await
    }
}

/// Deferred projection compilation, run by [`ProjectionStoreBuilder::build`].
type ProjectionFactory = Box<
    dyn FnOnce(&StoreOptions, usize) -> Result<Arc<dyn ProjectionSource>, ConfigError>,
>;

/// Builder for configuring a [`ProjectionStore`].
///
/// Collects store options, projections and daemon settings, then validates
/// everything at once in [`build`](ProjectionStoreBuilder::build).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use eventfold_projections::{
///     Aggregate, AggregateProjection, AggregationBuilder, InMemoryStorage, ProjectionStore,
/// };
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Default, Serialize, Deserialize)]
/// # struct Trip { name: String }
/// # impl Aggregate for Trip { const AGGREGATE_TYPE: &'static str = "trip"; }
///
/// let store = ProjectionStore::builder(Arc::new(InMemoryStorage::new()))
///     .projection(AggregateProjection::single_stream(
///         AggregationBuilder::<Trip>::new().with_default(),
///     ))
///     .build()
///     .expect("valid configuration");
/// assert_eq!(store.projection_names(), ["trip"]);
/// ```
pub struct ProjectionStoreBuilder {
    storage: Arc<dyn Storage>,
    options: StoreOptions,
    projection_factories: Vec<(String, ProjectionFactory)>,
    daemon_config: DaemonConfig,
}

impl ProjectionStoreBuilder {
    /// Create a builder over `storage` with default options.
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            options: StoreOptions::default(),
            projection_factories: Vec::new(),
            daemon_config: DaemonConfig::default(),
        }
    }

    /// Replace the store options.
    ///
    /// # Arguments
    ///
    /// * `options` - Tenancy, stream identity and default tenant that every
    ///   projection is validated against.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn options(mut self, options: StoreOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the event log tenancy.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn tenancy(mut self, tenancy: TenancyStyle) -> Self {
        self.options.tenancy = tenancy;
        self
    }

    /// Set the stream identity shape.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn stream_identity(mut self, kind: StreamIdentity) -> Self {
        self.options.stream_identity = kind;
        self
    }

    /// Register an aggregate projection.
    ///
    /// The projection is validated when
    /// [`build`](ProjectionStoreBuilder::build) is called.
    ///
    /// # Type Parameters
    ///
    /// * `A` - The aggregate the projection folds.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn projection<A: Aggregate>(mut self, projection: AggregateProjection<A>) -> Self {
        self.projection_factories.push((
            projection.name().to_owned(),
            Box::new(move |options: &StoreOptions, max_parallel: usize| {
                projection.compile(options, max_parallel)
            }),
        ));
        self
    }

    /// Customize the async daemon.
    ///
    /// # Arguments
    ///
    /// * `config` - The [`DaemonConfig`] every shard runs with.
    ///
    /// # Returns
    ///
    /// `self` for method chaining.
    pub fn daemon_config(mut self, config: DaemonConfig) -> Self {
        self.daemon_config = config;
        self
    }

    /// Validate every projection and build the store.
    ///
    /// # Returns
    ///
    /// A fully configured [`ProjectionStore`]. No shard is started.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Configuration`] for the first invalid
    /// projection, or when two projections share a name.
    pub fn build(self) -> Result<ProjectionStore, ProjectionError> {
        let mut names = HashSet::new();
        let mut projections = Vec::with_capacity(self.projection_factories.len());
        for (name, factory) in self.projection_factories {
            if !names.insert(name.clone()) {
                return Err(ConfigError::DuplicateProjection(name).into());
            }
            let compiled = factory(&self.options, self.daemon_config.max_parallel_slices)
                .inspect_err(|e| {
                    tracing::error!(projection = %name, error = %e, "invalid projection");
                })?;
            projections.push(compiled);
        }

        let async_projections = projections
            .iter()
            .filter(|p| p.lifecycle() == ProjectionLifecycle::Async)
            .cloned()
            .collect();
        let daemon = ProjectionDaemon::new(
            self.storage.clone(),
            async_projections,
            self.daemon_config,
        );

        tracing::info!(
            projections = projections.len(),
            tenancy = ?self.options.tenancy,
            "projection store built"
        );

        Ok(ProjectionStore {
            inner: Arc::new(StoreInner {
                storage: self.storage,
                options: self.options,
                projections,
                daemon,
            }),
        })
    }
}

impl std::fmt::Debug for ProjectionStoreBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self
            .projection_factories
            .iter()
            .map(|(n, _)| n.as_str())
            .collect();
        f.debug_struct("ProjectionStoreBuilder")
            .field("options", &self.options)
            .field("projections", &names)
            .field("daemon_config", &self.daemon_config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::test_fixtures::{Trip, trip_aggregation};
    use crate::event::NewEvent;
    use crate::memory::InMemoryStorage;
    use crate::slicing::EventSlicer;
    use crate::versioning::ExpectedVersion;
    use serde_json::json;

    fn storage() -> Arc<InMemoryStorage> {
        Arc::new(InMemoryStorage::new())
    }

    async fn seed_trip(storage: &InMemoryStorage, tenant: &str, stream: &str) {
        storage
            .append(
                tenant,
                Identity::from(stream),
                ExpectedVersion::NoStream,
                vec![
                    NewEvent::new("TripStarted", json!({ "name": "Lisbon" })),
                    NewEvent::new("Travelled", json!({ "miles": 10 })),
                    NewEvent::new("TripRenamed", json!({ "name": "Porto" })),
                    NewEvent::new("TripAborted", json!({})),
                ],
            )
            .await
            .expect("append");
    }

    #[test]
    fn store_options_default_values() {
        let options = StoreOptions::default();
        assert_eq!(options.tenancy, TenancyStyle::Single);
        assert_eq!(options.stream_identity, StreamIdentity::AsGuid);
        assert_eq!(options.default_tenant, DEFAULT_TENANT);
    }

    #[test]
    fn duplicate_projection_names_are_rejected() {
        let err = ProjectionStore::builder(storage())
            .projection(AggregateProjection::single_stream(trip_aggregation()))
            .projection(AggregateProjection::single_stream(trip_aggregation()))
            .build()
            .err()
            .expect("duplicate");
        assert!(matches!(
            err,
            ProjectionError::Configuration(ConfigError::DuplicateProjection(ref n)) if n == "trip"
        ));
    }

    #[test]
    fn invalid_projection_fails_the_build() {
        let err = ProjectionStore::builder(storage())
            .projection(AggregateProjection::multi_stream(
                trip_aggregation(),
                EventSlicer::by_rules(),
            ))
            .build()
            .err()
            .expect("no identity");
        assert!(matches!(
            err,
            ProjectionError::Configuration(ConfigError::NoIdentity { .. })
        ));
    }

    #[test]
    fn only_async_projections_get_shards() {
        let store = ProjectionStore::builder(storage())
            .projection(AggregateProjection::single_stream(trip_aggregation()).named("inline"))
            .projection(
                AggregateProjection::single_stream(trip_aggregation())
                    .named("async")
                    .lifecycle(ProjectionLifecycle::Async),
            )
            .build()
            .expect("valid");
        assert_eq!(store.projection_names(), ["inline", "async"]);
        assert_eq!(
            store.daemon().shard_names(),
            vec![crate::shard::ShardName::new("async")]
        );
        assert_eq!(store.inline_projections().count(), 1);
    }

    #[tokio::test]
    async fn aggregate_stream_honours_version_cap() {
        let storage = storage();
        seed_trip(&storage, DEFAULT_TENANT, "t-1").await;
        let store = ProjectionStore::builder(storage.clone())
            .projection(
                AggregateProjection::single_stream(trip_aggregation())
                    .lifecycle(ProjectionLifecycle::Live),
            )
            .build()
            .expect("valid");

        let at_two = store
            .aggregate_stream::<Trip>(DEFAULT_TENANT, "t-1", Some(2))
            .await
            .expect("fold")
            .expect("trip exists at v2");
        assert_eq!(at_two.name, "Lisbon");
        assert_eq!(at_two.miles, 10);
        assert_eq!(at_two.version, 2);

        let at_three = store
            .aggregate_stream::<Trip>(DEFAULT_TENANT, "t-1", Some(3))
            .await
            .expect("fold")
            .expect("trip exists at v3");
        assert_eq!(at_three.name, "Porto");

        // The fourth event aborts the trip.
        let latest = store
            .aggregate_stream::<Trip>(DEFAULT_TENANT, "t-1", None)
            .await
            .expect("fold");
        assert_eq!(latest, None);

        let missing = store
            .aggregate_stream::<Trip>(DEFAULT_TENANT, "nope", None)
            .await
            .expect("fold");
        assert_eq!(missing, None);
    }

    #[tokio::test]
    async fn unknown_aggregate_is_reported() {
        #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
        struct Unregistered;
        impl Aggregate for Unregistered {
            const AGGREGATE_TYPE: &'static str = "unregistered";
        }

        let store = ProjectionStore::builder(storage()).build().expect("valid");
        let err = store
            .aggregate_stream::<Unregistered>(DEFAULT_TENANT, "x", None)
            .await
            .err()
            .expect("unknown");
        assert!(matches!(
            err,
            ProjectionError::Configuration(ConfigError::UnknownAggregate(ref t)) if t == "unregistered"
        ));
    }

    #[tokio::test]
    async fn load_reads_single_tenant_documents_from_the_default_tenant() {
        let store = ProjectionStore::builder(storage())
            .projection(AggregateProjection::single_stream(trip_aggregation()))
            .build()
            .expect("valid");

        let mut session = store.session();
        session.start_stream::<Trip>(
            "t-1",
            [NewEvent::new("TripStarted", json!({ "name": "Lisbon" }))],
        );
        session.save_changes().await.expect("save");

        let trip = store
            .load::<Trip>("any-tenant", "t-1")
            .await
            .expect("load")
            .expect("inline document");
        assert_eq!(trip.name, "Lisbon");
        assert_eq!(trip.version, 1);
    }
}
