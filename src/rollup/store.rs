//! In-memory partition state and snapshot pointers.
//!
//! Each partition slot holds the current [`Snapshot`] behind a short
//! `RwLock`; readers clone the `Arc` and keep the table alive for as long as
//! they hold it. A swap retires the previous snapshot, and retired tables are
//! dropped once no reader holds them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;

use super::partition::{PartitionKey, PartitionStatus, PartitionWindow};

/// One built table version of a partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub schema: Option<String>,
    pub table: String,
    pub version: u64,
    pub built_at: DateTime<Utc>,
    /// `refresh_key.sql` value observed when the build was scheduled.
    pub refresh_key: Option<String>,
}

/// Mutable state of a partition.
#[derive(Debug, Clone)]
pub struct PartitionState {
    pub status: PartitionStatus,
    pub snapshot: Option<Arc<Snapshot>>,
    /// Monotonic time of the last successful build.
    pub built_at: Option<Instant>,
    /// The window was still open when the current snapshot was built.
    pub built_while_open: bool,
    /// Consecutive failed builds.
    pub failures: u32,
    pub retry_at: Option<Instant>,
}

impl Default for PartitionState {
    fn default() -> Self {
        Self {
            status: PartitionStatus::Pending,
            snapshot: None,
            built_at: None,
            built_while_open: false,
            failures: 0,
            retry_at: None,
        }
    }
}

impl PartitionState {
    /// Whether the snapshot has outlived `interval` at `now`. A snapshot
    /// built after its window closed never expires.
    pub fn expired(&self, window: Option<PartitionWindow>, interval: Option<Duration>, now: Instant) -> bool {
        if window.is_some() && !self.built_while_open {
            return false;
        }
        match interval {
            Some(every) => self.built_at.map_or(true, |at| now.duration_since(at) >= every),
            None => false,
        }
    }
}

pub struct PartitionSlot {
    pub key: PartitionKey,
    pub window: Option<PartitionWindow>,
    state: RwLock<PartitionState>,
    build_lock: tokio::sync::Mutex<()>,
    retired: Mutex<Vec<Arc<Snapshot>>>,
    version: AtomicU64,
}

impl std::fmt::Debug for PartitionSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionSlot")
            .field("key", &self.key)
            .field("window", &self.window)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl PartitionSlot {
    pub fn new(key: PartitionKey, window: Option<PartitionWindow>) -> Self {
        Self {
            key,
            window,
            state: RwLock::new(PartitionState::default()),
            build_lock: tokio::sync::Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            version: AtomicU64::new(0),
        }
    }

    pub fn status(&self) -> PartitionStatus {
        self.state.read().status
    }

    pub fn snapshot(&self) -> Option<Arc<Snapshot>> {
        self.state.read().snapshot.clone()
    }

    pub fn state(&self) -> PartitionState {
        self.state.read().clone()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut PartitionState) -> R) -> R {
        f(&mut self.state.write())
    }

    /// Serialises builds of this partition.
    pub fn build_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.build_lock
    }

    /// Next table version for this partition.
    pub fn next_version(&self) -> u64 {
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make `snapshot` current and retire the previous one.
    pub fn swap(&self, snapshot: Arc<Snapshot>, built_at: Instant, built_while_open: bool) {
        self.version.fetch_max(snapshot.version, Ordering::SeqCst);
        let previous = self.update(|state| {
            state.status = PartitionStatus::Fresh;
            state.built_at = Some(built_at);
            state.built_while_open = built_while_open;
            state.failures = 0;
            state.retry_at = None;
            state.snapshot.replace(snapshot)
        });
        if let Some(previous) = previous {
            self.retired.lock().push(previous);
        }
    }

    /// Retired snapshots no reader holds any more. They are removed from the
    /// retired list.
    pub fn take_droppable(&self) -> Vec<Arc<Snapshot>> {
        let mut retired = self.retired.lock();
        let (free, held): (Vec<_>, Vec<_>) = retired
            .drain(..)
            .partition(|s| Arc::strong_count(s) == 1);
        *retired = held;
        free
    }

    pub fn retired_count(&self) -> usize {
        self.retired.lock().len()
    }
}

/// All partitions of all rollups.
#[derive(Debug, Default)]
pub struct RollupStore {
    partitions: DashMap<PartitionKey, Arc<PartitionSlot>>,
    by_rollup: DashMap<String, Vec<PartitionKey>>,
}

impl RollupStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The slot for `key`, created if missing. The flag is true on creation.
    pub fn ensure(&self, key: PartitionKey, window: Option<PartitionWindow>) -> (Arc<PartitionSlot>, bool) {
        if let Some(slot) = self.partitions.get(&key) {
            return (slot.clone(), false);
        }
        let mut created = false;
        let slot = self
            .partitions
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                Arc::new(PartitionSlot::new(key.clone(), window))
            })
            .clone();
        if created {
            let mut keys = self.by_rollup.entry(key.rollup.clone()).or_default();
            keys.push(key);
            keys.sort();
        }
        (slot, created)
    }

    pub fn slot(&self, key: &PartitionKey) -> Option<Arc<PartitionSlot>> {
        self.partitions.get(key).map(|s| s.clone())
    }

    /// Partitions of `rollup` in window order.
    pub fn partitions(&self, rollup: &str) -> Vec<Arc<PartitionSlot>> {
        let keys = self
            .by_rollup
            .get(rollup)
            .map(|k| k.clone())
            .unwrap_or_default();
        let mut slots: Vec<_> = keys.iter().filter_map(|k| self.slot(k)).collect();
        slots.sort_by_key(|s| (s.window.map(|w| w.start), s.key.partition.clone()));
        slots
    }

    pub fn all(&self) -> Vec<Arc<PartitionSlot>> {
        self.partitions.iter().map(|e| e.value().clone()).collect()
    }
}
