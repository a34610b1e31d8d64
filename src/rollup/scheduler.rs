//! Rollup refresh scheduling.
//!
//! Every tick the scheduler discovers partitions, evaluates refresh keys and
//! dispatches builds for partitions that are pending, stale or due a retry.
//! Builds run as spawned tasks on a bounded pool and are serialised per
//! partition. The loop in [`RefreshScheduler::run`] never waits on a build.
//!
//! # State machine
//!
//! ```text
//! Pending -> Building -> Fresh -> Stale -> Building -> ...
//!               |                              ^
//!               v                              |
//!             Failed ----- retry after backoff-+
//! ```

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use inflector::Inflector;
use parking_lot::Mutex;
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::partition::{
    parse_timestamp, partition_windows, PartitionKey, PartitionStatus, PartitionWindow,
};
use super::store::{PartitionSlot, RollupStore, Snapshot};
use crate::cache::{table_hash, CacheError, CatalogEntry, RollupCatalog};
use crate::config::{Settings, SettingsError};
use crate::executor::{Executor, ExecutorError};
use crate::semantic::registry::PreAggregation;
use crate::semantic::{QueryError, SqlCompiler};
use crate::sql::{create_table_as, drop_table};

// =============================================================================
// Errors
// =============================================================================

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Catalog(#[from] CacheError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error("unknown rollup '{0}'")]
    UnknownRollup(String),
}

pub type RefreshResult<T> = Result<T, RefreshError>;

// =============================================================================
// Clock
// =============================================================================

/// Wall-clock time, used for partition windows and build timestamps.
///
/// Refresh intervals and backoff use `tokio::time` instead.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(Mutex::new(now))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.0.lock() = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.lock();
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock()
    }
}

// =============================================================================
// Scheduler
// =============================================================================

/// Outcome of one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub dispatched: usize,
    pub built: usize,
    pub failed: usize,
    /// Superseded tables dropped.
    pub dropped: usize,
}

/// Table name of one build: `{entity}_{rollup}_{partition}_{hash8}_v{n}`.
pub fn table_name(rollup: &PreAggregation, partition: &str, schema_hash: &str, version: u64) -> String {
    format!(
        "{}_{}_{}_{}_v{}",
        rollup.entity.to_snake_case(),
        rollup.name.to_snake_case(),
        partition,
        table_hash(schema_hash),
        version
    )
}

struct SchedulerInner {
    compiler: Arc<SqlCompiler>,
    executor: Arc<dyn Executor>,
    store: Arc<RollupStore>,
    catalog: Option<Mutex<RollupCatalog>>,
    clock: Arc<dyn Clock>,
    schema: Option<String>,
    tick: Duration,
    retry_backoff: Duration,
    retry_jitter: Duration,
    default_refresh: Duration,
    builds: Arc<Semaphore>,
    requests_tx: mpsc::UnboundedSender<String>,
    requests_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

pub struct SchedulerBuilder {
    compiler: Arc<SqlCompiler>,
    executor: Arc<dyn Executor>,
    store: Arc<RollupStore>,
    settings: Settings,
    catalog: Option<RollupCatalog>,
    clock: Arc<dyn Clock>,
}

impl SchedulerBuilder {
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.settings = settings.clone();
        self
    }

    pub fn catalog(mut self, catalog: RollupCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> RefreshResult<RefreshScheduler> {
        let scheduler = &self.settings.scheduler;
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let inner = SchedulerInner {
            compiler: self.compiler,
            executor: self.executor,
            store: self.store,
            catalog: self.catalog.map(Mutex::new),
            clock: self.clock,
            schema: self.settings.storage.rollup_schema()?,
            tick: scheduler.tick()?,
            retry_backoff: scheduler.retry_backoff()?,
            retry_jitter: scheduler.retry_jitter()?,
            default_refresh: scheduler.default_refresh()?,
            builds: Arc::new(Semaphore::new(scheduler.build_concurrency.max(1))),
            requests_tx,
            requests_rx: tokio::sync::Mutex::new(requests_rx),
        };
        Ok(RefreshScheduler {
            inner: Arc::new(inner),
        })
    }
}

/// Keeps rollup partitions built and fresh.
#[derive(Clone)]
pub struct RefreshScheduler {
    inner: Arc<SchedulerInner>,
}

impl RefreshScheduler {
    pub fn builder(
        compiler: Arc<SqlCompiler>,
        executor: Arc<dyn Executor>,
        store: Arc<RollupStore>,
    ) -> SchedulerBuilder {
        SchedulerBuilder {
            compiler,
            executor,
            store,
            settings: Settings::default(),
            catalog: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn store(&self) -> &Arc<RollupStore> {
        &self.inner.store
    }

    /// Sender the matcher uses to ask for a build of an unbuilt rollup.
    pub fn build_requests(&self) -> mpsc::UnboundedSender<String> {
        self.inner.requests_tx.clone()
    }

    /// Run one scheduling pass and wait for the builds it dispatched.
    pub async fn tick(&self) -> TickReport {
        let builds = self.dispatch().await;
        let mut report = TickReport {
            dispatched: builds.len(),
            ..Default::default()
        };
        for result in join_all(builds).await {
            match result {
                Ok(true) => report.built += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    error!(error = %e, "rollup.build.aborted");
                    report.failed += 1;
                }
            }
        }

        report.dropped = self.inner.collect_garbage().await;
        if report.dispatched > 0 {
            debug!(
                dispatched = report.dispatched,
                built = report.built,
                failed = report.failed,
                dropped = report.dropped,
                "rollup.tick"
            );
        }
        report
    }

    /// Mark due partitions `Building` and spawn their builds without
    /// waiting for them.
    async fn dispatch(&self) -> Vec<JoinHandle<bool>> {
        let inner = &self.inner;
        let registry = inner.compiler.registry();
        let now = Instant::now();
        let wall = inner.clock.now().naive_utc();

        let mut builds = Vec::new();
        for rollup in registry.pre_aggregations() {
            let slots = match inner.sync_partitions(rollup).await {
                Ok(slots) => slots,
                Err(e) => {
                    warn!(rollup = %rollup.qualified_name(), error = %e, "rollup.partitions.discovery_failed");
                    continue;
                }
            };
            let refresh_key = inner.refresh_key(rollup).await;
            for slot in slots {
                if !inner.is_due(rollup, &slot, refresh_key.as_deref(), now, wall) {
                    continue;
                }
                slot.update(|s| s.status = PartitionStatus::Building);
                let inner = inner.clone();
                let rollup = rollup.clone();
                let refresh_key = refresh_key.clone();
                builds.push(tokio::spawn(async move {
                    inner.build(&rollup, &slot, refresh_key).await
                }));
            }
        }
        builds
    }

    /// Mark every built partition of `rollup` stale and wake the loop.
    pub fn force_refresh(&self, rollup: &str) -> RefreshResult<usize> {
        if self.inner.compiler.registry().pre_aggregation(rollup).is_none() {
            return Err(RefreshError::UnknownRollup(rollup.to_string()));
        }
        let mut marked = 0;
        for slot in self.inner.store.partitions(rollup) {
            let changed = slot.update(|s| match s.status {
                PartitionStatus::Fresh | PartitionStatus::Failed => {
                    s.status = PartitionStatus::Stale;
                    s.retry_at = None;
                    true
                }
                _ => false,
            });
            if changed {
                marked += 1;
            }
        }
        let _ = self.inner.requests_tx.send(rollup.to_string());
        info!(rollup, partitions = marked, "rollup.refresh.forced");
        Ok(marked)
    }

    /// Tick on the configured interval and on build requests until
    /// `shutdown` turns true or its sender is dropped.
    ///
    /// Builds run in the background; the loop keeps ticking while they do.
    /// Builds still running at shutdown are awaited.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut requests = self.inner.requests_rx.lock().await;
        let mut interval = tokio::time::interval(self.inner.tick);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(tick_ms = self.inner.tick.as_millis() as u64, "rollup.scheduler.started");

        let mut in_flight: Vec<JoinHandle<bool>> = Vec::new();
        loop {
            tokio::select! {
                _ = interval.tick() => {}
                Some(rollup) = requests.recv() => {
                    debug!(rollup = %rollup, "rollup.build.requested");
                    while requests.try_recv().is_ok() {}
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let (finished, running): (Vec<_>, Vec<_>) =
                in_flight.drain(..).partition(|h| h.is_finished());
            in_flight = running;
            reap(finished).await;

            let dispatched = self.dispatch().await;
            let dropped = self.inner.collect_garbage().await;
            if !dispatched.is_empty() || dropped > 0 {
                debug!(
                    dispatched = dispatched.len(),
                    in_flight = in_flight.len(),
                    dropped,
                    "rollup.tick"
                );
            }
            in_flight.extend(dispatched);
        }

        reap(in_flight).await;
        info!("rollup.scheduler.stopped");
    }
}

/// Await build tasks whose outcome the loop does not count.
async fn reap(builds: Vec<JoinHandle<bool>>) {
    for result in join_all(builds).await {
        if let Err(e) = result {
            error!(error = %e, "rollup.build.aborted");
        }
    }
}

impl SchedulerInner {
    fn refresh_interval(&self, rollup: &PreAggregation) -> Option<Duration> {
        rollup.refresh_interval(Some(self.default_refresh))
    }

    /// Current value of the rollup's refresh key query, as text.
    async fn refresh_key(&self, rollup: &PreAggregation) -> Option<String> {
        let sql = rollup.refresh_sql.as_ref()?;
        match self.executor.execute(sql).await {
            Ok(result) => Some(result.first_value().map(|v| v.to_string()).unwrap_or_default()),
            Err(e) => {
                warn!(rollup = %rollup.qualified_name(), error = %e, "rollup.refresh_key.failed");
                None
            }
        }
    }

    fn is_due(
        &self,
        rollup: &PreAggregation,
        slot: &PartitionSlot,
        refresh_key: Option<&str>,
        now: Instant,
        wall: NaiveDateTime,
    ) -> bool {
        let state = slot.state();
        match state.status {
            PartitionStatus::Pending | PartitionStatus::Stale => true,
            PartitionStatus::Building => false,
            PartitionStatus::Failed => state.retry_at.map_or(true, |at| now >= at),
            PartitionStatus::Fresh => {
                if let Some(window) = slot.window {
                    if window.is_closed(wall) {
                        if !state.built_while_open {
                            return false;
                        }
                        slot.update(|s| s.status = PartitionStatus::Stale);
                        debug!(partition = %slot.key, "rollup.partition.closed");
                        return true;
                    }
                }

                let expired = state.expired(slot.window, self.refresh_interval(rollup), now);
                let recorded = state.snapshot.as_ref().and_then(|s| s.refresh_key.as_deref());
                let key_changed = refresh_key.is_some_and(|current| recorded != Some(current));
                if !expired && !key_changed {
                    return false;
                }
                slot.update(|s| s.status = PartitionStatus::Stale);
                info!(partition = %slot.key, expired, key_changed, "rollup.partition.stale");
                true
            }
        }
    }

    /// Build one partition. Returns whether the build succeeded.
    async fn build(&self, rollup: &PreAggregation, slot: &PartitionSlot, refresh_key: Option<String>) -> bool {
        let Ok(_permit) = self.builds.clone().acquire_owned().await else {
            return false;
        };
        let _guard = slot.build_lock().lock().await;

        let registry = self.compiler.registry();
        let version = slot.next_version();
        let table = table_name(rollup, &slot.key.partition, registry.schema_hash(), version);
        let started = Instant::now();

        if let Err(e) = self.materialise(rollup, slot.window, &table).await {
            let dialect = self.executor.dialect();
            if let Err(drop_err) = self
                .executor
                .execute(&drop_table(self.schema.as_deref(), &table, dialect))
                .await
            {
                warn!(table = %table, error = %drop_err, "rollup.build.cleanup_failed");
            }
            self.fail(rollup, slot, &e);
            return false;
        }

        let built_at = self.clock.now();
        let snapshot = Arc::new(Snapshot {
            schema: self.schema.clone(),
            table: table.clone(),
            version,
            built_at,
            refresh_key,
        });
        let while_open = slot
            .window
            .is_some_and(|w| !w.is_closed(built_at.naive_utc()));
        slot.swap(snapshot.clone(), Instant::now(), while_open);
        self.record(&slot.key, &snapshot);

        info!(
            partition = %slot.key,
            table = %table,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "rollup.build.completed"
        );
        true
    }

    async fn materialise(
        &self,
        rollup: &PreAggregation,
        window: Option<PartitionWindow>,
        table: &str,
    ) -> RefreshResult<()> {
        let dialect = self.executor.dialect();
        let compiled = self
            .compiler
            .compile_rollup_build(rollup, window.map(|w| (w.start, w.end)), dialect)?;
        let schema = self.schema.as_deref();
        self.executor.execute(&drop_table(schema, table, dialect)).await?;
        self.executor
            .execute(&create_table_as(schema, table, &compiled.query, dialect))
            .await?;
        Ok(())
    }

    /// Record a failed build. The previous snapshot stays current.
    fn fail(&self, rollup: &PreAggregation, slot: &PartitionSlot, err: &RefreshError) {
        let failures = slot.update(|s| {
            s.status = PartitionStatus::Failed;
            s.failures += 1;
            s.failures
        });

        if failures == 1 {
            let delay = self.retry_backoff + self.jitter();
            slot.update(|s| s.retry_at = Some(Instant::now() + delay));
            warn!(
                partition = %slot.key,
                error = %err,
                retry_in_ms = delay.as_millis() as u64,
                "rollup.build.failed"
            );
        } else {
            let wait = self.refresh_interval(rollup).unwrap_or(self.default_refresh);
            slot.update(|s| s.retry_at = Some(Instant::now() + wait));
            error!(
                partition = %slot.key,
                failures,
                error = %err,
                "rollup.build.failed_repeatedly"
            );
        }
    }

    fn jitter(&self) -> Duration {
        let max = self.retry_jitter.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::rng().random_range(0..=max))
    }

    fn record(&self, key: &PartitionKey, snapshot: &Snapshot) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        let entry = CatalogEntry {
            rollup: key.rollup.clone(),
            partition: key.partition.clone(),
            schema: snapshot.schema.clone(),
            table: snapshot.table.clone(),
            version: snapshot.version,
            built_at: snapshot.built_at,
            refresh_key: snapshot.refresh_key.clone(),
            schema_hash: self.compiler.registry().schema_hash().to_string(),
        };
        if let Err(e) = catalog.lock().record(&entry) {
            warn!(partition = %key, error = %e, "rollup.catalog.write_failed");
        }
    }

    /// Create slots for the rollup's partitions, discovering partition
    /// windows from the source's time bounds.
    async fn sync_partitions(&self, rollup: &PreAggregation) -> RefreshResult<Vec<Arc<PartitionSlot>>> {
        let name = rollup.qualified_name();
        let Some(granularity) = rollup.partition_granularity else {
            let (slot, created) = self.store.ensure(PartitionKey::unpartitioned(&name), None);
            if created {
                self.adopt(&slot).await;
            }
            return Ok(vec![slot]);
        };

        let sql = self.compiler.compile_time_bounds(rollup, self.executor.dialect())?;
        let bounds = self.executor.execute(&sql).await?;
        let row = bounds.rows.first();
        let min = row.and_then(|r| r.first()).and_then(parse_timestamp);
        let max = row.and_then(|r| r.get(1)).and_then(parse_timestamp);

        if let (Some(min), Some(max)) = (min, max) {
            for window in partition_windows(min, max, granularity) {
                let key = PartitionKey::new(&name, granularity.partition_label(window.start));
                let (slot, created) = self.store.ensure(key, Some(window));
                if created {
                    self.adopt(&slot).await;
                }
            }
        }
        Ok(self.store.partitions(&name))
    }

    /// Re-adopt the catalogued snapshot of a new slot if it was built for
    /// the current schema.
    async fn adopt(&self, slot: &PartitionSlot) {
        let Some(catalog) = &self.catalog else {
            return;
        };
        let lookup = catalog.lock().lookup(&slot.key.rollup, &slot.key.partition);
        let entry = match lookup {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                warn!(partition = %slot.key, error = %e, "rollup.catalog.read_failed");
                return;
            }
        };

        if entry.schema_hash != self.compiler.registry().schema_hash() {
            info!(partition = %slot.key, table = %entry.table, "rollup.snapshot.discarded");
            let dialect = self.executor.dialect();
            if let Err(e) = self
                .executor
                .execute(&drop_table(entry.schema.as_deref(), &entry.table, dialect))
                .await
            {
                warn!(table = %entry.table, error = %e, "rollup.snapshot.drop_failed");
            }
            let removed = catalog.lock().remove(&entry.rollup, &entry.partition);
            if let Err(e) = removed {
                warn!(partition = %slot.key, error = %e, "rollup.catalog.write_failed");
            }
            return;
        }

        let age = (self.clock.now() - entry.built_at).to_std().unwrap_or_default();
        let now = Instant::now();
        let built_at = now.checked_sub(age).unwrap_or(now);
        let while_open = slot
            .window
            .is_some_and(|w| entry.built_at.naive_utc() < w.end);
        info!(partition = %slot.key, table = %entry.table, "rollup.snapshot.adopted");
        slot.swap(
            Arc::new(Snapshot {
                schema: entry.schema,
                table: entry.table,
                version: entry.version,
                built_at: entry.built_at,
                refresh_key: entry.refresh_key,
            }),
            built_at,
            while_open,
        );
    }

    /// Drop superseded tables no reader holds.
    async fn collect_garbage(&self) -> usize {
        let dialect = self.executor.dialect();
        let mut dropped = 0;
        for slot in self.store.all() {
            for snapshot in slot.take_droppable() {
                let sql = drop_table(snapshot.schema.as_deref(), &snapshot.table, dialect);
                match self.executor.execute(&sql).await {
                    Ok(_) => {
                        dropped += 1;
                        debug!(table = %snapshot.table, "rollup.snapshot.dropped");
                    }
                    Err(e) => warn!(table = %snapshot.table, error = %e, "rollup.snapshot.drop_failed"),
                }
            }
        }
        dropped
    }
}
