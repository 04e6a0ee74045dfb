//! Async projection daemon: starts, stops and rebuilds one shard per async
//! projection.
//!
//! This module provides [`DaemonConfig`] for tuning the shard loops and
//! [`ProjectionDaemon`] for controlling them. Each running shard is a
//! spawned tokio task; shards share nothing but the storage collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ConfigError, ProjectionError};
use crate::projection::ProjectionSource;
use crate::runtime::DEFAULT_MAX_PARALLEL_SLICES;
use crate::shard::{Cancellation, ProjectionShard, ShardMode, ShardName, ShardState, ShardStatus};
use crate::storage::Storage;

/// Configuration for async projection shards.
///
/// All fields have sensible defaults accessible via
/// [`DaemonConfig::default()`]. Pass to
/// [`ProjectionStoreBuilder::daemon_config`](crate::ProjectionStoreBuilder::daemon_config)
/// to customize.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_projections::DaemonConfig;
///
/// let config = DaemonConfig {
///     batch_size: 100,
///     ..DaemonConfig::default()
/// };
/// assert_eq!(config.batch_size, 100);
/// assert_eq!(config.poll_interval, Duration::from_millis(250));
/// ```
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// How long a caught-up shard sleeps before polling the high-water mark
    /// again.
    ///
    /// Default: 250 milliseconds.
    pub poll_interval: Duration,

    /// Maximum number of sequences per range. A projection may override it
    /// with [`AggregateProjection::batch_size`](crate::AggregateProjection::batch_size).
    ///
    /// Default: 500.
    pub batch_size: usize,

    /// How many slices fold concurrently within one range, unless the
    /// projection sets its own limit.
    ///
    /// Default: 8.
    pub max_parallel_slices: usize,

    /// Base delay for exponential backoff after a retryable failure.
    ///
    /// The shard waits `retry_base_delay`, then twice that, and so on up to
    /// [`retry_max_delay`](DaemonConfig::retry_max_delay). A successful
    /// commit resets the backoff.
    ///
    /// Default: 100 milliseconds.
    pub retry_base_delay: Duration,

    /// Maximum delay between retries.
    ///
    /// Default: 5 seconds.
    pub retry_max_delay: Duration,

    /// Log and drop slices whose fold fails instead of faulting the shard.
    ///
    /// Default: `false`.
    pub skip_apply_errors: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 500,
            max_parallel_slices: DEFAULT_MAX_PARALLEL_SLICES,
            retry_base_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(5),
            skip_apply_errors: false,
        }
    }
}

/// A running shard task and its shutdown signal.
struct ShardHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<Result<(), ProjectionError>>,
}

impl ShardHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Signal the shard to stop and wait for it.
    ///
    /// A shard that already faulted stops cleanly; its error stays visible
    /// in its [`ShardState`].
    async fn stop(self, shard: &ShardName) -> Result<(), ProjectionError> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(_) => Ok(()),
            Err(e) => Err(ProjectionError::ShardFaulted {
                shard: shard.to_string(),
                reason: format!("shard task panicked: {e}"),
            }),
        }
    }
}

struct ShardSlot {
    name: ShardName,
    source: Arc<dyn ProjectionSource>,
    state: Arc<watch::Sender<ShardState>>,
    handle: Mutex<Option<ShardHandle>>,
}

struct DaemonInner {
    storage: Arc<dyn Storage>,
    config: DaemonConfig,
    slots: BTreeMap<String, ShardSlot>,
}

/// Controls the shards of every async projection registered on a
/// [`ProjectionStore`](crate::ProjectionStore).
///
/// Shards are addressed by projection name (`"trips"`) or full shard name
/// (`"trips:All"`). Dropping the daemon does **not** stop running shards;
/// call [`stop_all`](ProjectionDaemon::stop_all) for a graceful shutdown.
///
/// `Clone` is cheap: the shard table is `Arc`-wrapped.
#[derive(Clone)]
pub struct ProjectionDaemon {
    inner: Arc<DaemonInner>,
}

impl ProjectionDaemon {
    pub(crate) fn new(
        storage: Arc<dyn Storage>,
        sources: Vec<Arc<dyn ProjectionSource>>,
        config: DaemonConfig,
    ) -> Self {
        let slots = sources
            .into_iter()
            .map(|source| {
                let name = ShardName::new(source.name());
                let (state, _) = watch::channel(ShardState::default());
                let slot = ShardSlot {
                    name,
                    source,
                    state: Arc::new(state),
                    handle: Mutex::new(None),
                };
                (slot.name.projection().to_owned(), slot)
            })
            .collect();
        Self {
            inner: Arc::new(DaemonInner {
                storage,
                config,
                slots,
            }),
        }
    }

    /// Names of every shard the daemon controls, in name order.
    pub fn shard_names(&self) -> Vec<ShardName> {
        self.inner.slots.values().map(|s| s.name.clone()).collect()
    }

    fn slot(&self, name: &str) -> Result<&ShardSlot, ProjectionError> {
        let projection = name.strip_suffix(":All").unwrap_or(name);
        self.inner
            .slots
            .get(projection)
            .ok_or_else(|| ConfigError::UnknownShard(name.to_owned()).into())
    }

    fn spawn(&self, slot: &ShardSlot) -> ShardHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shard = ProjectionShard::new(
            slot.source.clone(),
            self.inner.storage.clone(),
            self.inner.config.clone(),
            slot.state.clone(),
        );
        let task = tokio::spawn(shard.run(ShardMode::Continuous, Cancellation::new(shutdown_rx)));
        ShardHandle { shutdown_tx, task }
    }

    /// Start every shard that is not already running.
    ///
    /// # Errors
    ///
    /// Propagates the first [`start_shard`](ProjectionDaemon::start_shard) error.
    pub async fn start_all(&self) -> Result<(), ProjectionError> {
        for name in self.inner.slots.keys() {
            self.start_shard(name).await?;
        }
        Ok(())
    }

    /// Start one shard in continuous mode. Starting a running shard is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownShard`] if no async projection has
    /// that name.
    pub async fn start_shard(&self, name: &str) -> Result<(), ProjectionError> {
        let slot = self.slot(name)?;
        let mut handle = slot.handle.lock().await;
        if handle.as_ref().is_some_and(ShardHandle::is_running) {
            return Ok(());
        }
        *handle = Some(self.spawn(slot));
        tracing::info!(shard = %slot.name, "shard started");
        Ok(())
    }

    /// Stop one shard and wait for its current range to finish or abort.
    ///
    /// Stopping a shard that is not running is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownShard`] for an unknown name, or
    /// [`ProjectionError::ShardFaulted`] if the shard task panicked.
    pub async fn stop_shard(&self, name: &str) -> Result<(), ProjectionError> {
        let slot = self.slot(name)?;
        let handle = slot.handle.lock().await.take();
        match handle {
            Some(handle) => handle.stop(&slot.name).await,
            None => Ok(()),
        }
    }

    /// Stop every shard. All shards are signalled even if one fails to stop.
    ///
    /// # Errors
    ///
    /// Returns the first stop failure.
    pub async fn stop_all(&self) -> Result<(), ProjectionError> {
        let mut first_error = None;
        for name in self.inner.slots.keys() {
            if let Err(err) = self.stop_shard(name).await
                && first_error.is_none()
            {
                first_error = Some(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Tear down a projection's documents and progress and replay it up to
    /// the current high-water mark, waiting for completion.
    ///
    /// A running shard is stopped first and restarted in continuous mode
    /// after a successful rebuild. Start and stop calls for the same shard
    /// wait until the rebuild is over.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownShard`] for an unknown name, or the
    /// error that faulted the rebuild.
    pub async fn rebuild(&self, name: &str) -> Result<(), ProjectionError> {
        let slot = self.slot(name)?;
        let mut handle = slot.handle.lock().await;

        let was_running = match handle.take() {
            Some(running) => {
                let alive = running.is_running();
                running.stop(&slot.name).await?;
                alive
            }
            None => false,
        };

        tracing::info!(shard = %slot.name, "rebuild requested");
        let shard = ProjectionShard::new(
            slot.source.clone(),
            self.inner.storage.clone(),
            self.inner.config.clone(),
            slot.state.clone(),
        );
        shard.run(ShardMode::Rebuild, Cancellation::never()).await?;

        if was_running {
            *handle = Some(self.spawn(slot));
            tracing::info!(shard = %slot.name, "shard restarted after rebuild");
        }
        Ok(())
    }

    /// Current state of one shard.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownShard`] for an unknown name.
    pub fn shard_state(&self, name: &str) -> Result<ShardState, ProjectionError> {
        Ok(self.slot(name)?.state.borrow().clone())
    }

    /// Subscribe to state changes of one shard.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::UnknownShard`] for an unknown name.
    pub fn subscribe(&self, name: &str) -> Result<watch::Receiver<ShardState>, ProjectionError> {
        Ok(self.slot(name)?.state.subscribe())
    }

    /// Wait until a shard has committed through `sequence`.
    ///
    /// # Returns
    ///
    /// The shard state that satisfied the wait.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError::Timeout`] if `timeout` elapses first, or
    /// [`ProjectionError::ShardFaulted`] if the shard faults before
    /// reaching `sequence`.
    pub async fn wait_for_shard(
        &self,
        name: &str,
        sequence: u64,
        timeout: Duration,
    ) -> Result<ShardState, ProjectionError> {
        let slot = self.slot(name)?;
        wait_until(slot, sequence, Instant::now() + timeout).await
    }

    /// Wait until every running shard has caught up with the high-water
    /// mark observed on entry.
    ///
    /// # Errors
    ///
    /// Returns the first shard's timeout or fault, or a store error while
    /// reading the high-water mark.
    pub async fn wait_for_non_stale_data(&self, timeout: Duration) -> Result<(), ProjectionError> {
        let deadline = Instant::now() + timeout;
        let high_water = self.inner.storage.high_water_mark().await?;
        for slot in self.inner.slots.values() {
            let running = slot
                .handle
                .lock()
                .await
                .as_ref()
                .is_some_and(ShardHandle::is_running);
            if running {
                wait_until(slot, high_water, deadline).await?;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ProjectionDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionDaemon")
            .field("shards", &self.shard_names())
            .field("config", &self.inner.config)
            .finish()
    }
}

async fn wait_until(
    slot: &ShardSlot,
    sequence: u64,
    deadline: Instant,
) -> Result<ShardState, ProjectionError> {
    let mut rx = slot.state.subscribe();
    let timed_out = || ProjectionError::Timeout {
        shard: slot.name.to_string(),
        sequence,
    };

    let state = match tokio::time::timeout_at(
        deadline,
        rx.wait_for(|s| s.sequence >= sequence || matches!(s.status, ShardStatus::Faulted(_))),
    )
    .await
    {
        Ok(Ok(state)) => state.clone(),
        // The slot owns the sender, so a closed channel cannot happen.
        Ok(Err(_)) | Err(_) => return Err(timed_out()),
    };

    match state.status {
        ShardStatus::Faulted(reason) if state.sequence < sequence => {
            Err(ProjectionError::ShardFaulted {
                shard: slot.name.to_string(),
                reason,
            })
        }
        _ => Ok(state),
    }
}
