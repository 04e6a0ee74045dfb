//! One async projection shard: the loop that tails the event log for a
//! single projection and commits its document operations together with the
//! shard's watermark.
//!
//! A shard reads events in ranges `(watermark, ceiling]`, where the ceiling
//! never passes the store's high-water mark, folds them through the
//! projection, and commits everything in one [`UnitOfWork`]. The watermark
//! only moves with a successful commit, so a failed or cancelled range is
//! simply read again.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use crate::daemon::DaemonConfig;
use crate::error::{ConcurrencyError, ProjectionError};
use crate::projection::ProjectionSource;
use crate::storage::{EventRange, ProgressUpdate, Storage, UnitOfWork};

/// Name of a shard, `"{projection}:All"`.
///
/// # Examples
///
/// ```
/// use eventfold_projections::ShardName;
///
/// let name = ShardName::new("trips");
/// assert_eq!(name.to_string(), "trips:All");
/// assert_eq!(name.projection(), "trips");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardName {
    projection: String,
    identity: String,
}

impl ShardName {
    /// The single shard of `projection`.
    pub fn new(projection: impl Into<String>) -> Self {
        let projection = projection.into();
        let identity = format!("{projection}:All");
        Self {
            projection,
            identity,
        }
    }

    /// Projection the shard belongs to.
    pub fn projection(&self) -> &str {
        &self.projection
    }

    /// Full shard name, the key of its persisted watermark.
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Display for ShardName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity)
    }
}

/// How a shard run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShardMode {
    /// Tail the log until stopped.
    Continuous,
    /// Tear down documents and progress, replay up to the high-water mark
    /// observed at start, then stop.
    Rebuild,
}

/// Lifecycle status published by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardStatus {
    /// Not running.
    Stopped,
    /// Tailing the log.
    Running,
    /// Replaying after a teardown.
    Rebuilding,
    /// A rebuild reached its target and the shard stopped.
    Rebuilt,
    /// Halted on a non-retryable error.
    Faulted(String),
}

/// Snapshot of a shard's progress, published through a `watch` channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardState {
    /// Lifecycle status.
    pub status: ShardStatus,
    /// Last committed sequence.
    pub sequence: u64,
    /// High-water mark seen by the last iteration.
    pub high_water_mark: u64,
    /// Slices dropped because apply errors are skipped.
    pub skipped_slices: u64,
    /// Most recent retried failure, cleared by the next successful commit.
    pub last_error: Option<String>,
}

impl Default for ShardState {
    fn default() -> Self {
        Self {
            status: ShardStatus::Stopped,
            sequence: 0,
            high_water_mark: 0,
            skipped_slices: 0,
            last_error: None,
        }
    }
}

/// Cooperative cancellation signal backed by a `watch` channel.
///
/// Cancelled once the sender publishes `true`. If the sender is dropped
/// without cancelling, the token never fires.
#[derive(Debug, Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Wrap the receiving half of a shutdown channel.
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    /// Returns `true` once cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                // Sender gone without cancelling.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Run `fut` unless cancellation is requested first.
    pub(crate) async fn guard<T, F>(&mut self, fut: F) -> Result<T, ProjectionError>
    where
        F: Future<Output = Result<T, ProjectionError>>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(ProjectionError::Cancelled),
            result = fut => result,
        }
    }
}

/// Drives one projection through the event log.
pub(crate) struct ProjectionShard {
    name: ShardName,
    source: Arc<dyn ProjectionSource>,
    storage: Arc<dyn Storage>,
    config: DaemonConfig,
    state: Arc<watch::Sender<ShardState>>,
}

impl ProjectionShard {
    pub(crate) fn new(
        source: Arc<dyn ProjectionSource>,
        storage: Arc<dyn Storage>,
        config: DaemonConfig,
        state: Arc<watch::Sender<ShardState>>,
    ) -> Self {
        Self {
            name: ShardName::new(source.name()),
            source,
            storage,
            config,
            state,
        }
    }

    fn batch_size(&self) -> u64 {
        self.source
            .batch_size()
            .unwrap_or(self.config.batch_size)
            .max(1) as u64
    }

    fn publish(&self, f: impl FnOnce(&mut ShardState)) {
        self.state.send_modify(f);
    }

    /// Run the shard until it is cancelled, faults, or (in rebuild mode)
    /// reaches its target.
    ///
    /// # Errors
    ///
    /// Returns the non-retryable error that faulted the shard. Cancellation
    /// is a clean exit and returns `Ok(())`.
    pub(crate) async fn run(
        self,
        mode: ShardMode,
        mut cancel: Cancellation,
    ) -> Result<(), ProjectionError> {
        tracing::info!(shard = %self.name, ?mode, "shard starting");
        let result = match mode {
            ShardMode::Continuous => self.run_continuous(&mut cancel).await,
            ShardMode::Rebuild => self.run_rebuild(&mut cancel).await,
        };
        match &result {
            Ok(()) => {
                self.publish(|s| {
                    if s.status != ShardStatus::Rebuilt {
                        s.status = ShardStatus::Stopped;
                    }
                });
                tracing::info!(shard = %self.name, "shard stopped");
            }
            Err(err) => {
                let reason = err.to_string();
                tracing::error!(shard = %self.name, error = %reason, "shard faulted");
                self.publish(|s| s.status = ShardStatus::Faulted(reason));
            }
        }
        result
    }

    async fn run_continuous(&self, cancel: &mut Cancellation) -> Result<(), ProjectionError> {
        self.publish(|s| {
            s.status = ShardStatus::Running;
            s.last_error = None;
        });
        let Some(watermark) = self.initial_watermark(cancel).await? else {
            return Ok(());
        };
        self.tail(watermark, None, cancel).await
    }

    async fn run_rebuild(&self, cancel: &mut Cancellation) -> Result<(), ProjectionError> {
        self.publish(|s| {
            s.status = ShardStatus::Rebuilding;
            s.sequence = 0;
            s.skipped_slices = 0;
            s.last_error = None;
        });

        let target = match cancel
            .guard(async {
                self.storage
                    .teardown(self.source.document_type(), self.name.identity())
                    .await?;
                self.storage
                    .high_water_mark()
                    .await
                    .map_err(ProjectionError::from)
            })
            .await
        {
            Ok(target) => target,
            Err(ProjectionError::Cancelled) => return Ok(()),
            Err(err) => return Err(err),
        };
        tracing::info!(shard = %self.name, target, "rebuild: documents torn down");

        self.tail(0, Some(target), cancel).await?;
        if !cancel.is_cancelled() {
            self.publish(|s| s.status = ShardStatus::Rebuilt);
            tracing::info!(shard = %self.name, target, "rebuild complete");
        }
        Ok(())
    }

    /// Load the persisted watermark, retrying store failures.
    async fn initial_watermark(
        &self,
        cancel: &mut Cancellation,
    ) -> Result<Option<u64>, ProjectionError> {
        let mut backoff = self.config.retry_base_delay;
        loop {
            let loaded = cancel
                .guard(async {
                    self.storage
                        .load_progress(self.name.identity())
                        .await
                        .map_err(ProjectionError::from)
                })
                .await;
            match loaded {
                Ok(watermark) => {
                    self.publish(|s| s.sequence = watermark);
                    return Ok(Some(watermark));
                }
                Err(ProjectionError::Cancelled) => return Ok(None),
                Err(err) if err.is_retryable() => {
                    if !self.back_off(&err, &mut backoff, cancel).await {
                        return Ok(None);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Process ranges from `watermark` on. With a `target`, stop once it is
    /// reached; otherwise poll for new events indefinitely.
    async fn tail(
        &self,
        mut watermark: u64,
        target: Option<u64>,
        cancel: &mut Cancellation,
    ) -> Result<(), ProjectionError> {
        let mut backoff = self.config.retry_base_delay;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if target.is_some_and(|t| watermark >= t) {
                return Ok(());
            }

            let high_water = match cancel
                .guard(async {
                    self.storage
                        .high_water_mark()
                        .await
                        .map_err(ProjectionError::from)
                })
                .await
            {
                Ok(hwm) => hwm,
                Err(ProjectionError::Cancelled) => return Ok(()),
                Err(err) if err.is_retryable() => {
                    if !self.back_off(&err, &mut backoff, cancel).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(err) => return Err(err),
            };
            self.publish(|s| s.high_water_mark = high_water);

            let limit = target.map_or(high_water, |t| t.min(high_water));
            if limit <= watermark {
                if !self.idle(cancel).await {
                    return Ok(());
                }
                continue;
            }

            let ceiling = limit.min(watermark.saturating_add(self.batch_size()));
            let range = EventRange::new(watermark, ceiling);

            let span = tracing::info_span!(
                "shard_range",
                shard = %self.name,
                floor = range.floor,
                ceiling = range.ceiling
            );
            match self.process_range(range, cancel).instrument(span).await {
                Ok(skipped) => {
                    watermark = range.ceiling;
                    backoff = self.config.retry_base_delay;
                    self.publish(|s| {
                        s.sequence = watermark;
                        s.skipped_slices += skipped as u64;
                        s.last_error = None;
                    });
                }
                Err(ProjectionError::Cancelled) => {
                    tracing::debug!(shard = %self.name, floor = range.floor, "range cancelled before commit");
                    return Ok(());
                }
                Err(ProjectionError::Concurrency(ConcurrencyError::Progress { actual, .. })) => {
                    // Another runner moved this shard; continue from its position.
                    tracing::warn!(
                        shard = %self.name,
                        expected = watermark,
                        actual,
                        "shard progress moved underneath, resynchronising"
                    );
                    watermark = actual;
                    self.publish(|s| s.sequence = actual);
                }
                Err(err) if err.is_retryable() => {
                    if !self.back_off(&err, &mut backoff, cancel).await {
                        return Ok(());
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Load, fold and commit one range. Returns the number of skipped slices.
    async fn process_range(
        &self,
        range: EventRange,
        cancel: &mut Cancellation,
    ) -> Result<usize, ProjectionError> {
        let storage = self.storage.as_ref();
        let events = cancel
            .guard(async {
                storage
                    .load_range(&range, self.source.load_filter())
                    .await
                    .map_err(ProjectionError::from)
            })
            .await?;

        tracing::debug!(
            shard = %self.name,
            floor = range.floor,
            ceiling = range.ceiling,
            events = events.len(),
            "processing range"
        );

        let output = if events.is_empty() {
            Default::default()
        } else {
            cancel
                .guard(
                    self.source
                        .apply_range(storage, events, self.config.skip_apply_errors),
                )
                .await?
        };

        if cancel.is_cancelled() {
            return Err(ProjectionError::Cancelled);
        }

        let operations = output.operations.len();
        let work = UnitOfWork {
            operations: output.operations,
            progress: vec![ProgressUpdate {
                shard: self.name.identity().to_owned(),
                from: range.floor,
                to: range.ceiling,
            }],
            ..UnitOfWork::default()
        };
        storage.commit(work).await?;

        if operations > 0 {
            tracing::info!(
                shard = %self.name,
                ceiling = range.ceiling,
                operations,
                "range committed"
            );
        }
        Ok(output.skipped)
    }

    /// Sleep for the poll interval. Returns `false` if cancelled meanwhile.
    async fn idle(&self, cancel: &mut Cancellation) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.config.poll_interval) => true,
            _ = cancel.cancelled() => false,
        }
    }

    /// Record a retryable failure and wait out the backoff. Returns `false`
    /// if cancelled meanwhile.
    async fn back_off(
        &self,
        err: &ProjectionError,
        backoff: &mut Duration,
        cancel: &mut Cancellation,
    ) -> bool {
        let reason = err.to_string();
        tracing::warn!(
            shard = %self.name,
            error = %reason,
            retry_in_ms = backoff.as_millis() as u64,
            "shard iteration failed, will retry"
        );
        self.publish(|s| s.last_error = Some(reason));

        let delay = *backoff;
        *backoff = (*backoff * 2).min(self.config.retry_max_delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = cancel.cancelled() => false,
        }
    }
}
