//! Partitioning event batches into per-aggregate slices.
//!
//! An [`EventSlicer`] turns a flat batch of events into [`TenantSliceGroup`]s:
//! one group per tenant, one [`EventSlice`] per aggregate identity. It is
//! configured once per projection and is immutable afterwards.
//!
//! Slicing is deterministic: groups are ordered by tenant, slices by
//! identity, and events inside a slice by `(sequence, position in batch)`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::aggregate::EventTarget;
use crate::error::ProjectionError;
use crate::event::{DEFAULT_TENANT, Event, Identity};
use crate::storage::Storage;
use crate::store::TenancyStyle;

/// Whether a slice starts its aggregate or continues it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    /// The slice's first event is the first event of its stream.
    Start,
    /// The aggregate may already have a stored snapshot.
    Append,
}

/// Events for one aggregate identity within one tenant.
#[derive(Debug, Clone)]
pub struct EventSlice<A> {
    id: Identity,
    tenant_id: String,
    events: Vec<Arc<Event>>,
    snapshot: Option<A>,
    stream_version: Option<u64>,
}

impl<A> EventSlice<A> {
    /// Create a slice. Events are stably sorted by sequence.
    pub fn new(id: Identity, tenant_id: impl Into<String>, mut events: Vec<Arc<Event>>) -> Self {
        events.sort_by_key(|e| e.sequence);
        Self {
            id,
            tenant_id: tenant_id.into(),
            events,
            snapshot: None,
            stream_version: None,
        }
    }

    /// Drop the events `keep` rejects, remembering the highest version seen
    /// before filtering as [`stream_version`](Self::stream_version).
    pub(crate) fn retain_events(&mut self, mut keep: impl FnMut(&Event) -> bool) {
        let highest = self.events.iter().map(|e| e.version).max();
        self.stream_version = self.stream_version.max(highest);
        self.events.retain(|e| keep(e));
    }

    /// Highest stream version covered by the slice, counting events that
    /// were filtered out of the fold. `None` if nothing was filtered.
    pub fn stream_version(&self) -> Option<u64> {
        self.stream_version
    }

    /// Attach a snapshot loaded ahead of the fold.
    pub fn with_snapshot(mut self, snapshot: Option<A>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Aggregate identity.
    pub fn id(&self) -> &Identity {
        &self.id
    }

    /// Owning tenant.
    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// Events in fold order.
    pub fn events(&self) -> &[Arc<Event>] {
        &self.events
    }

    /// The pre-attached snapshot, if any.
    pub fn snapshot(&self) -> Option<&A> {
        self.snapshot.as_ref()
    }

    pub(crate) fn take_snapshot(&mut self) -> Option<A> {
        self.snapshot.take()
    }

    /// Last event of the slice.
    pub fn last_event(&self) -> Option<&Arc<Event>> {
        self.events.last()
    }

    /// [`ActionType::Start`] if the first event opened its stream.
    pub fn action_type(&self) -> ActionType {
        match self.events.first() {
            Some(first) if first.version == 1 => ActionType::Start,
            _ => ActionType::Append,
        }
    }

    /// Number of events.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Returns `true` if the slice holds no events.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// The slices of one tenant within one processed batch.
#[derive(Debug, Clone)]
pub struct TenantSliceGroup<A> {
    /// Owning tenant.
    pub tenant_id: String,
    /// One slice per identity, ordered by identity.
    pub slices: Vec<EventSlice<A>>,
}

/// Identity assignments collected while slicing one tenant's events.
///
/// Handed to [`EventGrouper`]s so they can add their own assignments.
pub struct IdentityGrouping {
    ordinals: HashMap<Uuid, usize>,
    groups: BTreeMap<Identity, Vec<(usize, Arc<Event>)>>,
}

impl IdentityGrouping {
    fn new(events: &[(usize, Arc<Event>)]) -> Self {
        Self {
            ordinals: events.iter().map(|(o, e)| (e.id, *o)).collect(),
            groups: BTreeMap::new(),
        }
    }

    /// Assign `event` to the aggregate `id`.
    ///
    /// Events that were not part of the batch (e.g. read from a related
    /// stream) are accepted and ordered by sequence after batch events of
    /// the same sequence.
    pub fn add(&mut self, id: impl Into<Identity>, event: &Arc<Event>) {
        let ordinal = self.ordinals.get(&event.id).copied().unwrap_or(usize::MAX);
        self.groups
            .entry(id.into())
            .or_default()
            .push((ordinal, event.clone()));
    }

    /// Assign `event` to every identity in `ids`.
    pub fn add_many<I>(&mut self, ids: I, event: &Arc<Event>)
    where
        I: IntoIterator,
        I::Item: Into<Identity>,
    {
        for id in ids {
            self.add(id, event);
        }
    }
}

/// Custom identity resolution that may consult storage.
///
/// Used when an event names no aggregate directly, e.g. a reset event whose
/// affected aggregates must be looked up by re-reading a related stream.
#[async_trait]
pub trait EventGrouper: Send + Sync {
    /// Add identity assignments for `events` (one tenant's share of the batch).
    async fn group(
        &self,
        storage: &dyn Storage,
        tenant_id: &str,
        events: &[Arc<Event>],
        grouping: &mut IdentityGrouping,
    ) -> Result<(), ProjectionError>;

    /// Event types this grouper needs to see, added to the shard's filter.
    fn event_types(&self) -> Vec<String> {
        Vec::new()
    }
}

/// When a fan-out rule runs relative to identity resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanOutPhase {
    /// Children are resolved to identities like any other event.
    BeforeGrouping,
    /// Children join the slice of their source event.
    AfterGrouping,
}

type IdentitiesFn = Arc<dyn Fn(&Event) -> Vec<Identity> + Send + Sync>;
type FanOutFn = Arc<dyn Fn(&Event) -> Vec<Value> + Send + Sync>;

#[derive(Clone)]
struct IdentityRule {
    target: EventTarget,
    resolve: IdentitiesFn,
}

#[derive(Clone)]
struct FanOutRule {
    source: EventTarget,
    child_type: String,
    phase: FanOutPhase,
    expand: FanOutFn,
}

/// Groups events by aggregate identity.
#[derive(Clone)]
pub struct EventSlicer {
    by_stream: bool,
    tenancy: TenancyStyle,
    rules: Vec<IdentityRule>,
    groupers: Vec<Arc<dyn EventGrouper>>,
    fan_outs: Vec<FanOutRule>,
}

impl std::fmt::Debug for EventSlicer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSlicer")
            .field("by_stream", &self.by_stream)
            .field("tenancy", &self.tenancy)
            .field("rules", &self.rules.len())
            .field("groupers", &self.groupers.len())
            .field("fan_outs", &self.fan_outs.len())
            .finish()
    }
}

impl EventSlicer {
    /// Slice by stream: the aggregate identity is the event's stream.
    pub fn by_stream() -> Self {
        Self {
            by_stream: true,
            tenancy: TenancyStyle::Single,
            rules: Vec::new(),
            groupers: Vec::new(),
            fan_outs: Vec::new(),
        }
    }

    /// Slice by identity rules and groupers (multi-stream aggregates).
    pub fn by_rules() -> Self {
        Self {
            by_stream: false,
            ..Self::by_stream()
        }
    }

    /// Partition events by tenant before grouping.
    pub fn with_tenancy(mut self, tenancy: TenancyStyle) -> Self {
        self.tenancy = tenancy;
        self
    }

    /// Resolve one identity per matching event. `None` leaves the event
    /// to other resolvers.
    pub fn identity(
        mut self,
        target: impl Into<EventTarget>,
        f: impl Fn(&Event) -> Option<Identity> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(IdentityRule {
            target: target.into(),
            resolve: Arc::new(move |event| f(event).into_iter().collect()),
        });
        self
    }

    /// Resolve several identities per matching event (fan-in).
    pub fn identities(
        mut self,
        target: impl Into<EventTarget>,
        f: impl Fn(&Event) -> Vec<Identity> + Send + Sync + 'static,
    ) -> Self {
        self.rules.push(IdentityRule {
            target: target.into(),
            resolve: Arc::new(f),
        });
        self
    }

    /// Add a custom grouper.
    pub fn grouper(mut self, grouper: impl EventGrouper + 'static) -> Self {
        self.groupers.push(Arc::new(grouper));
        self
    }

    /// Expand each matching event into children of `child_type` before grouping.
    pub fn fan_out(
        self,
        source: impl Into<EventTarget>,
        child_type: impl Into<String>,
        f: impl Fn(&Event) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.add_fan_out(source, child_type, FanOutPhase::BeforeGrouping, f)
    }

    /// Expand each matching event into children of `child_type` inside its slice.
    pub fn fan_out_after_grouping(
        self,
        source: impl Into<EventTarget>,
        child_type: impl Into<String>,
        f: impl Fn(&Event) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.add_fan_out(source, child_type, FanOutPhase::AfterGrouping, f)
    }

    fn add_fan_out(
        mut self,
        source: impl Into<EventTarget>,
        child_type: impl Into<String>,
        phase: FanOutPhase,
        f: impl Fn(&Event) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.fan_outs.push(FanOutRule {
            source: source.into(),
            child_type: child_type.into(),
            phase,
            expand: Arc::new(f),
        });
        self
    }

    /// Returns `true` if slices are keyed by stream.
    pub fn is_by_stream(&self) -> bool {
        self.by_stream
    }

    /// Tenancy applied while slicing.
    pub fn tenancy(&self) -> TenancyStyle {
        self.tenancy
    }

    /// Returns `true` if at least one way of resolving identities exists.
    pub fn has_identity_source(&self) -> bool {
        self.by_stream || !self.rules.is_empty() || !self.groupers.is_empty()
    }

    /// Event types the slicer itself needs beyond the fold's handlers.
    pub fn source_event_types(&self) -> BTreeSet<String> {
        let mut types = BTreeSet::new();
        for rule in &self.rules {
            types.extend(rule.target.names());
        }
        for fan_out in &self.fan_outs {
            types.extend(fan_out.source.names());
        }
        for grouper in &self.groupers {
            types.extend(grouper.event_types());
        }
        types
    }

    /// Slice a batch of events.
    ///
    /// # Errors
    ///
    /// Returns whatever a custom [`EventGrouper`] fails with.
    pub async fn slice<A>(
        &self,
        events: Vec<Event>,
        storage: &dyn Storage,
    ) -> Result<Vec<TenantSliceGroup<A>>, ProjectionError> {
        let expanded = self.expand(
            events.into_iter().map(Arc::new),
            FanOutPhase::BeforeGrouping,
        );

        let mut partitions: BTreeMap<String, Vec<(usize, Arc<Event>)>> = BTreeMap::new();
        for (ordinal, event) in expanded.into_iter().enumerate() {
            let tenant = match self.tenancy {
                TenancyStyle::Conjoined => event.tenant_id.clone(),
                TenancyStyle::Single => DEFAULT_TENANT.to_owned(),
            };
            partitions.entry(tenant).or_default().push((ordinal, event));
        }

        let mut groups = Vec::with_capacity(partitions.len());
        for (tenant_id, events) in partitions {
            let mut grouping = IdentityGrouping::new(&events);

            if self.by_stream {
                for (_, event) in &events {
                    grouping.add(event.stream.clone(), event);
                }
            } else {
                for (_, event) in &events {
                    for rule in self.rules.iter().filter(|r| r.target.matches(&event.event_type)) {
                        grouping.add_many((rule.resolve)(event), event);
                    }
                }
                if !self.groupers.is_empty() {
                    let batch: Vec<Arc<Event>> = events.iter().map(|(_, e)| e.clone()).collect();
                    for grouper in &self.groupers {
                        grouper.group(storage, &tenant_id, &batch, &mut grouping).await?;
                    }
                }
            }

            let slices = self.build_slices(&tenant_id, grouping);
            tracing::debug!(
                tenant_id = %tenant_id,
                events = events.len(),
                slices = slices.len(),
                "events sliced"
            );
            if !slices.is_empty() {
                groups.push(TenantSliceGroup { tenant_id, slices });
            }
        }

        Ok(groups)
    }

    fn build_slices<A>(&self, tenant_id: &str, grouping: IdentityGrouping) -> Vec<EventSlice<A>> {
        grouping
            .groups
            .into_iter()
            .map(|(id, mut items)| {
                items.sort_by_key(|(ordinal, e)| (e.sequence, *ordinal));
                // The same event resolved to one identity twice counts once.
                items.dedup_by(|a, b| a.1.id == b.1.id);
                let events = self.expand(
                    items.into_iter().map(|(_, e)| e),
                    FanOutPhase::AfterGrouping,
                );
                EventSlice::new(id, tenant_id, events)
            })
            .collect()
    }

    /// Insert each rule's children right after their source event.
    fn expand(
        &self,
        events: impl Iterator<Item = Arc<Event>>,
        phase: FanOutPhase,
    ) -> Vec<Arc<Event>> {
        let rules: Vec<&FanOutRule> = self.fan_outs.iter().filter(|r| r.phase == phase).collect();
        let mut out = Vec::new();
        for event in events {
            let children: Vec<Arc<Event>> = rules
                .iter()
                .filter(|rule| rule.source.matches(&event.event_type))
                .flat_map(|rule| {
                    (rule.expand)(&event)
                        .into_iter()
                        .map(|data| Arc::new(event.with_data(rule.child_type.clone(), data)))
                        .collect::<Vec<_>>()
                })
                .collect();
            out.push(event);
            out.extend(children);
        }
        out
    }
}
