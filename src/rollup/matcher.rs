//! Pre-aggregation matching.
//!
//! Finds the first rollup, in declaration order, whose grouping covers a
//! resolved request and whose required partitions all have a built snapshot.
//! Partitions that are not fresh, or whose snapshot outlived the rollup's
//! refresh interval, are served with a [`StaleDataWarning`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDateTime, NaiveTime};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::debug;

use super::partition::PartitionStatus;
use super::store::{RollupStore, Snapshot};
use crate::semantic::planner::{ResolvedFilter, ResolvedRequest, RollupSource};
use crate::semantic::registry::{Member, MemberPath, PreAggregation, SchemaRegistry};

/// A rollup served with partitions that are not fresh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("served from rollup {rollup} with stale partitions: {}", .partitions.join(", "))]
pub struct StaleDataWarning {
    pub rollup: String,
    pub partitions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "lowercase")]
pub enum Freshness {
    Fresh,
    Stale { warning: StaleDataWarning },
}

/// A covering rollup with the snapshots the read will use.
///
/// Holding the match keeps the snapshot tables alive.
#[derive(Debug, Clone)]
pub struct RollupMatch {
    pub source: RollupSource,
    pub freshness: Freshness,
    pub snapshots: Vec<Arc<Snapshot>>,
}

pub struct RollupMatcher<'a> {
    registry: &'a SchemaRegistry,
    build_requests: Option<&'a mpsc::UnboundedSender<String>>,
    default_refresh: Option<Duration>,
}

impl<'a> RollupMatcher<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            build_requests: None,
            default_refresh: None,
        }
    }

    /// Refresh interval of rollups that declare neither `every` nor a key
    /// query. Without it only declared intervals expire.
    pub fn with_default_refresh(mut self, interval: Duration) -> Self {
        self.default_refresh = Some(interval);
        self
    }

    /// Covering rollups without snapshots are reported on this channel.
    pub fn with_build_requests(mut self, sender: &'a mpsc::UnboundedSender<String>) -> Self {
        self.build_requests = Some(sender);
        self
    }

    pub fn find_match(&self, request: &ResolvedRequest<'_>, store: &RollupStore) -> Option<RollupMatch> {
        for rollup in self.registry.pre_aggregations() {
            let Some(reaggregate) = covers(rollup, request) else {
                continue;
            };
            let name = rollup.qualified_name();
            match self.snapshots(rollup, request, store) {
                Some((snapshots, stale)) => {
                    let freshness = if stale.is_empty() {
                        Freshness::Fresh
                    } else {
                        Freshness::Stale {
                            warning: StaleDataWarning {
                                rollup: name.clone(),
                                partitions: stale,
                            },
                        }
                    };
                    debug!(rollup = %name, reaggregate, partitions = snapshots.len(), "rollup.match");
                    return Some(RollupMatch {
                        source: RollupSource {
                            rollup: name,
                            tables: snapshots
                                .iter()
                                .map(|s| (s.schema.clone(), s.table.clone()))
                                .collect(),
                            time_dimension: rollup.time_dimension.clone(),
                            granularity: rollup.granularity,
                            reaggregate,
                        },
                        freshness,
                        snapshots,
                    });
                }
                None => {
                    debug!(rollup = %name, "rollup.match.not_built");
                    if let Some(sender) = self.build_requests {
                        let _ = sender.send(name);
                    }
                }
            }
        }
        None
    }

    /// Snapshots of the partitions the request reads, plus labels of the
    /// ones that are not fresh or have expired. `None` when any required
    /// partition has no snapshot yet.
    fn snapshots(
        &self,
        rollup: &PreAggregation,
        request: &ResolvedRequest<'_>,
        store: &RollupStore,
    ) -> Option<(Vec<Arc<Snapshot>>, Vec<String>)> {
        let mut slots = store.partitions(&rollup.qualified_name());
        if slots.is_empty() {
            return None;
        }
        if let Some((from, to)) = requested_range(request) {
            slots.retain(|s| s.window.map_or(true, |w| w.overlaps(from, to)));
            if slots.is_empty() {
                return None;
            }
        }

        let interval = rollup.refresh_interval(self.default_refresh);
        let now = Instant::now();
        let mut snapshots = Vec::with_capacity(slots.len());
        let mut stale = Vec::new();
        for slot in slots {
            let state = slot.state();
            if state.status != PartitionStatus::Fresh || state.expired(slot.window, interval, now) {
                stale.push(slot.key.partition.clone());
            }
            snapshots.push(state.snapshot?);
        }
        Some((snapshots, stale))
    }
}

fn requested_range(request: &ResolvedRequest<'_>) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let range = request.time_dimension.as_ref()?.date_range?;
    Some((
        range.from().and_time(NaiveTime::MIN),
        range.end_exclusive()?.and_time(NaiveTime::MIN),
    ))
}

/// Whether `rollup` covers `request`, and if so whether the read must
/// re-aggregate.
fn covers(rollup: &PreAggregation, request: &ResolvedRequest<'_>) -> Option<bool> {
    let measures: HashSet<&MemberPath> = rollup.measures.iter().collect();
    let dimensions: HashSet<&MemberPath> = rollup.dimensions.iter().collect();

    // Members the read needs as rollup columns.
    let mut needed_measures = Vec::new();
    let mut needed_dimensions = Vec::new();
    for measure in &request.inner_measures {
        needed_measures.push((measure.path(), measure.measure_type));
    }
    for dimension in &request.inner_dimensions {
        needed_dimensions.push(dimension.path());
    }
    for member in request.filters.iter().flat_map(ResolvedFilter::members) {
        match member {
            Member::Measure(m) => needed_measures.push((m.path(), m.measure_type)),
            Member::Dimension(d) => needed_dimensions.push(d.path()),
            Member::Segment(_) => return None,
        }
    }

    if !needed_measures.iter().all(|(p, _)| measures.contains(p)) {
        return None;
    }
    if !needed_dimensions.iter().all(|p| dimensions.contains(p)) {
        return None;
    }
    // The rollup only stores the bucketed time column.
    if let Some(time) = &rollup.time_dimension {
        if needed_dimensions.contains(time) {
            return None;
        }
    }

    let requested_segments: HashSet<MemberPath> = request.segments.iter().map(|s| s.path()).collect();
    let rollup_segments: HashSet<MemberPath> = rollup.segments.iter().cloned().collect();
    if requested_segments != rollup_segments {
        return None;
    }

    let mut coarser = false;
    if let Some(time) = &request.time_dimension {
        if rollup.time_dimension.as_ref() != Some(&time.dimension.path()) {
            return None;
        }
        let stored = rollup.granularity?;
        match time.granularity {
            Some(requested) if requested < stored => return None,
            Some(requested) => coarser = requested > stored,
            None => {}
        }
        if let Some(range) = time.date_range {
            let from = range.from().and_time(NaiveTime::MIN);
            let to = range.end_exclusive()?.and_time(NaiveTime::MIN);
            if !stored.is_aligned(from) || !stored.is_aligned(to) {
                return None;
            }
        }
    }

    let requested_dimensions: HashSet<MemberPath> =
        request.inner_dimensions.iter().map(|d| d.path()).collect();
    let time_not_grouped = rollup.time_dimension.is_some() && request.granularity().is_none();
    let reaggregate = requested_dimensions.len() != dimensions.len() || coarser || time_not_grouped;

    if reaggregate && !needed_measures.iter().all(|(_, t)| t.is_additive()) {
        return None;
    }
    Some(reaggregate)
}
