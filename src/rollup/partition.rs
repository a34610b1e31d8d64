//! Partition windows and keys.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use serde::Serialize;

use crate::executor::ScalarValue;
use crate::model::Granularity;

/// Label of the single partition of an unpartitioned rollup.
pub const UNPARTITIONED: &str = "all";

/// Upper bound on partitions discovered for one rollup.
const MAX_PARTITIONS: usize = 10_000;

/// `[start, end)` of one partition-granularity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionWindow {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl PartitionWindow {
    /// The window of `granularity` containing `ts`.
    pub fn containing(ts: NaiveDateTime, granularity: Granularity) -> Option<Self> {
        let start = granularity.bucket_start(ts)?;
        let end = granularity.next_bucket(start)?;
        Some(Self { start, end })
    }

    /// A window is closed once `now` has reached its end.
    pub fn is_closed(&self, now: NaiveDateTime) -> bool {
        now >= self.end
    }

    /// Whether the window intersects `[from, to)`.
    pub fn overlaps(&self, from: NaiveDateTime, to: NaiveDateTime) -> bool {
        self.start < to && from < self.end
    }
}

/// Every window of `granularity` between `min` and `max`, both inclusive.
pub fn partition_windows(
    min: NaiveDateTime,
    max: NaiveDateTime,
    granularity: Granularity,
) -> Vec<PartitionWindow> {
    let mut windows = Vec::new();
    let Some(mut current) = PartitionWindow::containing(min, granularity) else {
        return windows;
    };
    while current.start <= max && windows.len() < MAX_PARTITIONS {
        windows.push(current);
        match granularity.next_bucket(current.end) {
            Some(end) => {
                current = PartitionWindow {
                    start: current.end,
                    end,
                }
            }
            None => break,
        }
    }
    windows
}

/// Parse a time-bounds cell: ISO text (date or datetime) or unix seconds.
pub fn parse_timestamp(value: &ScalarValue) -> Option<NaiveDateTime> {
    match value {
        ScalarValue::String(s) => {
            let s = s.trim();
            const FORMATS: [&str; 4] = [
                "%Y-%m-%d %H:%M:%S%.f",
                "%Y-%m-%dT%H:%M:%S%.f",
                "%Y-%m-%d %H:%M",
                "%Y-%m-%dT%H:%M",
            ];
            FORMATS
                .iter()
                .find_map(|f| NaiveDateTime::parse_from_str(s, f).ok())
                .or_else(|| DateTime::parse_from_rfc3339(s).ok().map(|d| d.naive_utc()))
                .or_else(|| {
                    NaiveDate::parse_from_str(s.get(..10)?, "%Y-%m-%d")
                        .ok()
                        .map(|d| d.and_time(NaiveTime::MIN))
                })
        }
        ScalarValue::Int(secs) => DateTime::from_timestamp(*secs, 0).map(|d| d.naive_utc()),
        _ => None,
    }
}

/// Identifies one partition of one rollup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PartitionKey {
    /// `Entity.rollup`
    pub rollup: String,
    /// Window label, or [`UNPARTITIONED`].
    pub partition: String,
}

impl PartitionKey {
    pub fn new(rollup: impl Into<String>, partition: impl Into<String>) -> Self {
        Self {
            rollup: rollup.into(),
            partition: partition.into(),
        }
    }

    pub fn unpartitioned(rollup: impl Into<String>) -> Self {
        Self::new(rollup, UNPARTITIONED)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.rollup, self.partition)
    }
}

/// Refresh state of a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionStatus {
    Pending,
    Building,
    Fresh,
    Stale,
    Failed,
}

impl fmt::Display for PartitionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionStatus::Pending => "pending",
            PartitionStatus::Building => "building",
            PartitionStatus::Fresh => "fresh",
            PartitionStatus::Stale => "stale",
            PartitionStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}
