//! Aggregate projection definitions and their type-erased compiled form.
//!
//! An [`AggregateProjection`] pairs an [`AggregationBuilder`] with an
//! [`EventSlicer`] and a lifecycle. The store compiles every registered
//! projection once, validating its configuration, into a
//! [`ProjectionSource`] trait object so that heterogeneous aggregate types
//! can be driven by the same session and daemon code.

use std::any::Any;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::aggregate::{Aggregate, AggregationBuilder};
use crate::error::{ConfigError, ProjectionError};
use crate::event::{DEFAULT_TENANT, Event, StreamIdentity};
use crate::runtime::AggregationRuntime;
use crate::slicing::{EventSlicer, TenantSliceGroup};
use crate::storage::{DocumentOperation, EventFilter, Storage};
use crate::store::{StoreOptions, TenancyStyle};

/// When a projection is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProjectionLifecycle {
    /// Applied in the same unit of work as the events that trigger it.
    Inline,
    /// Applied by a daemon shard, eventually consistent.
    Async,
    /// Never persisted; folded on demand.
    Live,
}

/// Definition of an aggregate projection, before validation.
///
/// # Examples
///
/// ```
/// use eventfold_projections::{
///     Aggregate, AggregateProjection, AggregationBuilder, ProjectionLifecycle,
/// };
/// # use serde::{Deserialize, Serialize};
/// # #[derive(Clone, Default, Serialize, Deserialize)]
/// # struct Trip { name: String }
/// # impl Aggregate for Trip { const AGGREGATE_TYPE: &'static str = "trip"; }
///
/// let projection = AggregateProjection::single_stream(
///     AggregationBuilder::<Trip>::new().with_default(),
/// )
/// .lifecycle(ProjectionLifecycle::Async)
/// .batch_size(250);
/// assert_eq!(projection.name(), "trip");
/// ```
pub struct AggregateProjection<A: Aggregate> {
    name: String,
    lifecycle: ProjectionLifecycle,
    aggregation: AggregationBuilder<A>,
    slicer: EventSlicer,
    identity_kind: Option<StreamIdentity>,
    tenancy: Option<TenancyStyle>,
    event_types: Option<BTreeSet<String>>,
    filter_by_aggregate_type: bool,
    batch_size: Option<usize>,
    max_parallel: Option<usize>,
}

impl<A: Aggregate> AggregateProjection<A> {
    /// A projection whose documents share the identity of their stream.
    pub fn single_stream(aggregation: AggregationBuilder<A>) -> Self {
        Self::new(aggregation, EventSlicer::by_stream())
    }

    /// A projection whose identities are resolved by `slicer`'s rules.
    pub fn multi_stream(aggregation: AggregationBuilder<A>, slicer: EventSlicer) -> Self {
        Self::new(aggregation, slicer)
    }

    fn new(aggregation: AggregationBuilder<A>, slicer: EventSlicer) -> Self {
        Self {
            name: A::AGGREGATE_TYPE.to_owned(),
            lifecycle: ProjectionLifecycle::Inline,
            aggregation,
            slicer,
            identity_kind: None,
            tenancy: None,
            event_types: None,
            filter_by_aggregate_type: false,
            batch_size: None,
            max_parallel: None,
        }
    }

    /// Projection name. Defaults to the aggregate type.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Rename the projection. The shard name derives from it.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the lifecycle. Defaults to [`ProjectionLifecycle::Inline`].
    pub fn lifecycle(mut self, lifecycle: ProjectionLifecycle) -> Self {
        self.lifecycle = lifecycle;
        self
    }

    /// Replace the slicer, e.g. to add fan-out rules to a single-stream projection.
    pub fn slicer(mut self, slicer: EventSlicer) -> Self {
        self.slicer = slicer;
        self
    }

    /// Declare the stream identity shape the projection's documents use.
    ///
    /// Checked against the store at build time.
    pub fn identity_kind(mut self, kind: StreamIdentity) -> Self {
        self.identity_kind = Some(kind);
        self
    }

    /// Tenancy of the projection's documents. Defaults to the store's tenancy.
    pub fn tenancy(mut self, tenancy: TenancyStyle) -> Self {
        self.tenancy = Some(tenancy);
        self
    }

    /// Restrict async processing to these event types instead of the types
    /// derived from the registered handlers and slicer rules.
    pub fn event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Only process events of streams tagged with this aggregate type.
    pub fn filter_by_aggregate_type(mut self) -> Self {
        self.filter_by_aggregate_type = true;
        self
    }

    /// Override the daemon's batch size for this projection's shard.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = Some(size.max(1));
        self
    }

    /// Override how many slices fold concurrently within one range.
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = Some(max_parallel.max(1));
        self
    }

    /// Validate the definition and compile it.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] describing the first invalid setting.
    pub(crate) fn compile(
        self,
        options: &StoreOptions,
        default_max_parallel: usize,
    ) -> Result<Arc<dyn ProjectionSource>, ConfigError> {
        let single_stream = self.slicer.is_by_stream();

        if !self.slicer.has_identity_source() {
            return Err(ConfigError::NoIdentity {
                projection: self.name,
            });
        }

        if single_stream
            && let Some(kind) = self.identity_kind
            && kind != options.stream_identity
        {
            return Err(ConfigError::IdentityMismatch {
                projection: self.name,
                expected: kind,
                actual: options.stream_identity,
            });
        }

        let tenancy = self.tenancy.unwrap_or(options.tenancy);
        if single_stream
            && options.tenancy == TenancyStyle::Conjoined
            && tenancy == TenancyStyle::Single
        {
            return Err(ConfigError::TenancyMismatch {
                projection: self.name,
            });
        }

        let aggregation = Arc::new(self.aggregation.build(&self.name)?);
        let slicer = self.slicer.with_tenancy(tenancy);

        let event_types = self.event_types.unwrap_or_else(|| {
            let mut types = aggregation.event_types();
            types.extend(slicer.source_event_types());
            types
        });
        let filter = EventFilter {
            event_types: Some(event_types),
            aggregate_type: self
                .filter_by_aggregate_type
                .then(|| A::AGGREGATE_TYPE.to_owned()),
            include_archived: false,
        };
        // Single-stream slices see every event of their stream so snapshots
        // carry the stream's version; types are narrowed after slicing.
        let load_filter = if single_stream {
            EventFilter {
                event_types: None,
                ..filter.clone()
            }
        } else {
            filter.clone()
        };

        let runtime = AggregationRuntime::new(aggregation, single_stream)
            .with_max_parallel(self.max_parallel.unwrap_or(default_max_parallel));

        tracing::debug!(
            projection = %self.name,
            aggregate_type = A::AGGREGATE_TYPE,
            lifecycle = ?self.lifecycle,
            single_stream,
            "projection compiled"
        );

        Ok(Arc::new(CompiledProjection {
            name: self.name,
            lifecycle: self.lifecycle,
            runtime,
            slicer,
            filter,
            load_filter,
            batch_size: self.batch_size,
        }))
    }
}

/// Operations produced for one shard range.
#[derive(Debug, Default)]
pub(crate) struct RangeOutput {
    pub operations: Vec<DocumentOperation>,
    /// Slices dropped because their fold failed and apply errors are skipped.
    pub skipped: usize,
}

/// Type-erased interface over compiled projections.
///
/// Lets the session and the daemon drive projections of any aggregate type.
/// Async methods return boxed futures for trait-object compatibility.
pub(crate) trait ProjectionSource: Send + Sync {
    /// Projection name.
    fn name(&self) -> &str;

    fn lifecycle(&self) -> ProjectionLifecycle;

    /// Document type written by this projection.
    fn document_type(&self) -> &'static str;

    /// Filter the shard loads range events with.
    fn load_filter(&self) -> &EventFilter;

    /// Per-projection batch size override.
    fn batch_size(&self) -> Option<usize>;

    /// Fold freshly appended events inside the appending unit of work.
    fn apply_inline<'a>(
        &'a self,
        storage: &'a dyn Storage,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<Vec<DocumentOperation>, ProjectionError>>;

    /// Fold one shard range. With `skip_apply_errors`, slices failing with
    /// an apply error are logged and dropped instead of failing the range.
    fn apply_range<'a>(
        &'a self,
        storage: &'a dyn Storage,
        events: Vec<Event>,
        skip_apply_errors: bool,
    ) -> BoxFuture<'a, Result<RangeOutput, ProjectionError>>;

    /// Downcast support for typed access to the runtime.
    fn as_any(&self) -> &dyn Any;
}

/// A validated projection for aggregate `A`.
pub(crate) struct CompiledProjection<A: Aggregate> {
    name: String,
    lifecycle: ProjectionLifecycle,
    runtime: AggregationRuntime<A>,
    slicer: EventSlicer,
    /// Events folded into documents.
    filter: EventFilter,
    /// Events handed to the slicer; wider than `filter` for single-stream
    /// projections.
    load_filter: EventFilter,
    batch_size: Option<usize>,
}

impl<A: Aggregate> CompiledProjection<A> {
    pub(crate) fn runtime(&self) -> &AggregationRuntime<A> {
        &self.runtime
    }

    /// Tenant under which documents built from `tenant_id`'s events live.
    pub(crate) fn document_tenant<'a>(&self, tenant_id: &'a str) -> &'a str {
        match self.slicer.tenancy() {
            TenancyStyle::Single => DEFAULT_TENANT,
            TenancyStyle::Conjoined => tenant_id,
        }
    }

    async fn inline(
        &self,
        storage: &dyn Storage,
        events: &[Event],
    ) -> Result<Vec<DocumentOperation>, ProjectionError> {
        // Inline projections see the events of the current append only,
        // filtered like async ones.
        let relevant: Vec<Event> = events
            .iter()
            .filter(|e| self.load_filter.matches(e))
            .cloned()
            .collect();
        if relevant.is_empty() {
            return Ok(Vec::new());
        }

        let groups = self.slice(storage, relevant).await?;
        let mut operations = Vec::new();
        for group in groups {
            for slice in group.slices {
                if let Some(op) = self.runtime.determine_operation(storage, slice).await? {
                    operations.push(op.into_document()?);
                }
            }
        }
        Ok(operations)
    }

    async fn slice(
        &self,
        storage: &dyn Storage,
        events: Vec<Event>,
    ) -> Result<Vec<TenantSliceGroup<A>>, ProjectionError> {
        let mut groups = self.slicer.slice::<A>(events, storage).await?;
        if self.slicer.is_by_stream() {
            for slice in groups.iter_mut().flat_map(|g| g.slices.iter_mut()) {
                slice.retain_events(|e| self.filter.matches(e));
            }
        }
        Ok(groups)
    }

    async fn range(
        &self,
        storage: &dyn Storage,
        events: Vec<Event>,
        skip_apply_errors: bool,
    ) -> Result<RangeOutput, ProjectionError> {
        let groups = self.slice(storage, events).await?;
        let results = self.runtime.resolve_groups(storage, groups).await?;

        let mut output = RangeOutput::default();
        for slice in results {
            match slice.result {
                Ok(Some(op)) => output.operations.push(op.into_document()?),
                Ok(None) => {}
                Err(ProjectionError::Apply(err)) if skip_apply_errors => {
                    tracing::warn!(
                        projection = %self.name,
                        id = %slice.id,
                        tenant_id = %slice.tenant_id,
                        error = %err,
                        "skipping slice that failed to apply"
                    );
                    output.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(output)
    }
}

impl<A: Aggregate> ProjectionSource for CompiledProjection<A> {
    fn name(&self) -> &str {
        &self.name
    }

    fn lifecycle(&self) -> ProjectionLifecycle {
        self.lifecycle
    }

    fn document_type(&self) -> &'static str {
        A::AGGREGATE_TYPE
    }

    fn load_filter(&self) -> &EventFilter {
        &self.load_filter
    }

    fn batch_size(&self) -> Option<usize> {
        self.batch_size
    }

    fn apply_inline<'a>(
        &'a self,
        storage: &'a dyn Storage,
        events: &'a [Event],
    ) -> BoxFuture<'a, Result<Vec<DocumentOperation>, ProjectionError>> {
        Box::pin(self.inline(storage, events))
    }

    fn apply_range<'a>(
        &'a self,
        storage: &'a dyn Storage,
        events: Vec<Event>,
        skip_apply_errors: bool,
    ) -> BoxFuture<'a, Result<RangeOutput, ProjectionError>> {
        Box::pin(self.range(storage, events, skip_apply_errors))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
