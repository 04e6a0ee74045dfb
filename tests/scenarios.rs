//! End-to-end behaviour of sessions, inline and async projections over the
//! in-memory store.

use std::sync::Arc;
use std::time::Duration;

use eventfold_projections::{
    Aggregate, AggregateProjection, AggregationBuilder, DEFAULT_TENANT, DaemonConfig, EventSlicer,
    EventStore, Identity, InMemoryStorage, NewEvent, ProjectionError, ProjectionLifecycle,
    ProjectionStore, ShardStatus, encode_domain_event,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn fast_daemon() -> DaemonConfig {
    DaemonConfig {
        poll_interval: Duration::from_millis(5),
        batch_size: 3,
        retry_base_delay: Duration::from_millis(5),
        retry_max_delay: Duration::from_millis(20),
        ..DaemonConfig::default()
    }
}

// --- Project aggregate ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
enum ProjectEvent {
    Created { name: String },
    Renamed { name: String },
    TaskAdded { title: String },
}

#[derive(Debug, Deserialize)]
struct NamePayload {
    name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Project {
    name: String,
    tasks: u32,
    version: u64,
}

impl Aggregate for Project {
    const AGGREGATE_TYPE: &'static str = "project";

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

fn project_aggregation() -> AggregationBuilder<Project> {
    AggregationBuilder::<Project>::new()
        .create("Created", |e: NamePayload, _| Project {
            name: e.name,
            ..Project::default()
        })
        .apply("Renamed", |p: &mut Project, e: NamePayload, _| p.name = e.name)
        .apply("TaskAdded", |p: &mut Project, _e: serde_json::Value, _| {
            p.tasks += 1
        })
}

fn encode(event: ProjectEvent) -> NewEvent {
    encode_domain_event(&event).expect("tagged project event")
}

// --- Tally aggregate: counts every applied event ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Tally {
    count: u64,
    version: u64,
}

impl Aggregate for Tally {
    const AGGREGATE_TYPE: &'static str = "tally";

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

fn tally_aggregation() -> AggregationBuilder<Tally> {
    AggregationBuilder::<Tally>::new()
        .with_default()
        .apply("Ticked", |t: &mut Tally, _e: serde_json::Value, _| t.count += 1)
}

fn tick() -> NewEvent {
    NewEvent::new("Ticked", json!({}))
}

#[tokio::test]
async fn created_then_renamed_folds_to_version_two() {
    init_tracing();
    let store = ProjectionStore::builder(Arc::new(InMemoryStorage::new()))
        .projection(AggregateProjection::single_stream(project_aggregation()))
        .build()
        .expect("valid store");

    let mut session = store.session();
    session.start_stream::<Project>(
        "p-1",
        [
            encode(ProjectEvent::Created { name: "A".into() }),
            encode(ProjectEvent::Renamed { name: "B".into() }),
        ],
    );
    session.save_changes().await.expect("save");

    let inline = store
        .load::<Project>(DEFAULT_TENANT, "p-1")
        .await
        .expect("load")
        .expect("inline document");
    assert_eq!(inline.name, "B");
    assert_eq!(inline.version, 2);

    let live = store
        .aggregate_stream::<Project>(DEFAULT_TENANT, "p-1", None)
        .await
        .expect("live fold")
        .expect("stream exists");
    assert_eq!(live, inline);
}

#[tokio::test]
async fn concurrent_appends_at_the_same_version_conflict() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let store = ProjectionStore::builder(storage.clone())
        .projection(AggregateProjection::single_stream(project_aggregation()))
        .build()
        .expect("valid store");

    let mut setup = store.session();
    setup.start_stream::<Project>(
        "p-1",
        [
            encode(ProjectEvent::Created { name: "A".into() }),
            encode(ProjectEvent::TaskAdded { title: "one".into() }),
            encode(ProjectEvent::TaskAdded { title: "two".into() }),
        ],
    );
    setup.save_changes().await.expect("setup");

    let mut first = store.session();
    let mut second = store.session();
    first.append_optimistic("p-1", 3, [encode(ProjectEvent::Renamed { name: "first".into() })]);
    second.append_optimistic("p-1", 3, [encode(ProjectEvent::Renamed { name: "second".into() })]);

    first.save_changes().await.expect("first writer wins");
    let err = second.save_changes().await.err().expect("second writer loses");
    assert!(matches!(err, ProjectionError::Concurrency(_)), "got {err:?}");

    let state = storage
        .stream_state(DEFAULT_TENANT, &Identity::from("p-1"))
        .await
        .expect("state")
        .expect("stream exists");
    assert_eq!(state.version, 4);

    let project = store
        .load::<Project>(DEFAULT_TENANT, "p-1")
        .await
        .expect("load")
        .expect("document");
    assert_eq!(project.name, "first");
    assert_eq!(project.version, 4);
}

#[tokio::test]
async fn rebuild_filtered_to_one_event_type_skips_other_streams() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let aggregation = AggregationBuilder::<Tally>::new()
        .with_default()
        .apply("EventTypeA", |t: &mut Tally, _e: serde_json::Value, _| t.count += 1)
        .apply("EventTypeB", |t: &mut Tally, _e: serde_json::Value, _| t.count += 1);
    let store = ProjectionStore::builder(storage.clone())
        .projection(
            AggregateProjection::single_stream(aggregation)
                .lifecycle(ProjectionLifecycle::Async)
                .event_types(["EventTypeA"]),
        )
        .daemon_config(fast_daemon())
        .build()
        .expect("valid store");

    let mut session = store.session();
    session
        .append("only-a", [NewEvent::new("EventTypeA", json!({}))])
        .append(
            "only-b",
            [
                NewEvent::new("EventTypeB", json!({})),
                NewEvent::new("EventTypeB", json!({})),
            ],
        )
        .append(
            "mixed",
            [
                NewEvent::new("EventTypeB", json!({})),
                NewEvent::new("EventTypeA", json!({})),
            ],
        );
    session.save_changes().await.expect("save");

    store.daemon().rebuild("tally").await.expect("rebuild");

    assert_eq!(storage.document_count("tally").await, 2);
    assert!(
        store
            .load::<Tally>(DEFAULT_TENANT, "only-b")
            .await
            .expect("load")
            .is_none()
    );
    let mixed = store
        .load::<Tally>(DEFAULT_TENANT, "mixed")
        .await
        .expect("load")
        .expect("document");
    assert_eq!(mixed.count, 1);

    let state = store.daemon().shard_state("tally:All").expect("known shard");
    assert_eq!(state.status, ShardStatus::Rebuilt);
    assert_eq!(state.sequence, 5);
}

#[tokio::test]
async fn failed_commits_are_retried_without_double_application() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let store = ProjectionStore::builder(storage.clone())
        .projection(
            AggregateProjection::single_stream(tally_aggregation())
                .lifecycle(ProjectionLifecycle::Async),
        )
        .daemon_config(fast_daemon())
        .build()
        .expect("valid store");

    let mut session = store.session();
    session.append("clock", [tick(), tick()]);
    session.save_changes().await.expect("first append");

    // A failed inline append leaves a tombstone at sequence 3.
    storage.fail_next_commits(1);
    session.append("clock", [tick()]);
    assert!(session.save_changes().await.is_err());

    session.append("clock", [tick(), tick(), tick()]);
    let appended = session.save_changes().await.expect("third append");
    assert_eq!(appended.first().map(|e| e.sequence), Some(4));
    assert_eq!(appended.first().map(|e| e.version), Some(3));

    let sequences: Vec<u64> = storage.all_events().await.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, (1..=6).collect::<Vec<_>>());
    assert_eq!(
        storage
            .all_events()
            .await
            .iter()
            .filter(|e| e.is_tombstone())
            .count(),
        1
    );

    // The first range commit of the shard fails and is retried.
    storage.fail_next_commits(1);
    store.daemon().start_all().await.expect("start");
    let state = store
        .daemon()
        .wait_for_shard("tally", 6, WAIT)
        .await
        .expect("shard caught up");
    assert_eq!(state.sequence, 6);
    store.daemon().stop_all().await.expect("stop");

    let tally = store
        .load::<Tally>(DEFAULT_TENANT, "clock")
        .await
        .expect("load")
        .expect("document");
    assert_eq!(tally.count, 5);
    assert_eq!(tally.version, 5);
}

#[tokio::test]
async fn rebuilding_twice_yields_identical_documents() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let store = ProjectionStore::builder(storage.clone())
        .projection(
            AggregateProjection::single_stream(project_aggregation())
                .lifecycle(ProjectionLifecycle::Async),
        )
        .daemon_config(fast_daemon())
        .build()
        .expect("valid store");

    let mut session = store.session();
    for n in 0..4 {
        session.start_stream::<Project>(
            format!("p-{n}"),
            [
                encode(ProjectEvent::Created { name: format!("project {n}") }),
                encode(ProjectEvent::TaskAdded { title: "plan".into() }),
                encode(ProjectEvent::Renamed { name: format!("renamed {n}") }),
            ],
        );
    }
    session.save_changes().await.expect("save");

    store.daemon().rebuild("project").await.expect("first rebuild");
    let mut first = Vec::new();
    for n in 0..4 {
        first.push(store.load::<Project>(DEFAULT_TENANT, format!("p-{n}")).await.expect("load"));
    }

    store.daemon().rebuild("project").await.expect("second rebuild");
    for (n, before) in first.into_iter().enumerate() {
        let after = store
            .load::<Project>(DEFAULT_TENANT, format!("p-{n}"))
            .await
            .expect("load");
        assert_eq!(after, before);
        let after = after.expect("document");
        assert_eq!(after.version, 3);
        assert_eq!(after.tasks, 1);
    }
}

// --- Multi-stream: per-assignee workload across project streams ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Workload {
    assignments: u32,
    version: u64,
}

impl Aggregate for Workload {
    const AGGREGATE_TYPE: &'static str = "workload";

    fn version(&self) -> Option<u64> {
        Some(self.version)
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

#[tokio::test]
async fn multi_stream_projection_groups_by_assignee() {
    init_tracing();
    let storage = Arc::new(InMemoryStorage::new());
    let slicer = EventSlicer::by_rules().identities("Assigned", |event| {
        event.data["assignees"]
            .as_array()
            .map(|users| {
                users
                    .iter()
                    .filter_map(|u| u.as_str())
                    .map(Identity::from)
                    .collect()
            })
            .unwrap_or_default()
    });
    let aggregation = AggregationBuilder::<Workload>::new()
        .with_default()
        .apply("Assigned", |w: &mut Workload, _e: serde_json::Value, _| {
            w.assignments += 1
        });
    let store = ProjectionStore::builder(storage.clone())
        .projection(
            AggregateProjection::multi_stream(aggregation, slicer)
                .lifecycle(ProjectionLifecycle::Async),
        )
        .daemon_config(fast_daemon())
        .build()
        .expect("valid store");

    store.daemon().start_all().await.expect("start");

    let mut session = store.session();
    session
        .append("p-1", [NewEvent::new("Assigned", json!({ "assignees": ["ana", "ben"] }))])
        .append("p-2", [NewEvent::new("Assigned", json!({ "assignees": ["ana"] }))]);
    session.save_changes().await.expect("save");
    store
        .daemon()
        .wait_for_non_stale_data(WAIT)
        .await
        .expect("caught up");

    session.append("p-3", [NewEvent::new("Assigned", json!({ "assignees": ["ana"] }))]);
    session.save_changes().await.expect("save");
    store
        .daemon()
        .wait_for_non_stale_data(WAIT)
        .await
        .expect("caught up again");
    store.daemon().stop_all().await.expect("stop");

    let ana = store
        .load::<Workload>(DEFAULT_TENANT, "ana")
        .await
        .expect("load")
        .expect("ana's workload");
    assert_eq!(ana.assignments, 3);
    // Two events applied in the first range, one more in a later range.
    assert_eq!(ana.version, 3);

    let ben = store
        .load::<Workload>(DEFAULT_TENANT, "ben")
        .await
        .expect("load")
        .expect("ben's workload");
    assert_eq!(ben.assignments, 1);
}
