//! Member types, relationships and time granularities.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Months, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};
use serde::{Deserialize, Serialize};

// =============================================================================
// Granularity
// =============================================================================

/// Time bucket size, ordered finest first.
///
/// Every finer granularity divides every coarser one, which is what lets a
/// rollup built at `month` answer a request at `quarter` or `year`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Granularity {
    Hour,
    Day,
    Month,
    Quarter,
    Year,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hour => "hour",
            Granularity::Day => "day",
            Granularity::Month => "month",
            Granularity::Quarter => "quarter",
            Granularity::Year => "year",
        }
    }

    /// Start of the bucket containing `ts`.
    pub fn bucket_start(&self, ts: NaiveDateTime) -> Option<NaiveDateTime> {
        let date = ts.date();
        match self {
            Granularity::Hour => date.and_hms_opt(ts.hour(), 0, 0),
            Granularity::Day => Some(date.and_time(NaiveTime::MIN)),
            Granularity::Month => {
                NaiveDate::from_ymd_opt(date.year(), date.month(), 1).map(midnight)
            }
            Granularity::Quarter => {
                let month = (date.month0() / 3) * 3 + 1;
                NaiveDate::from_ymd_opt(date.year(), month, 1).map(midnight)
            }
            Granularity::Year => NaiveDate::from_ymd_opt(date.year(), 1, 1).map(midnight),
        }
    }

    /// Start of the bucket following the one that starts at `start`.
    pub fn next_bucket(&self, start: NaiveDateTime) -> Option<NaiveDateTime> {
        match self {
            Granularity::Hour => start.checked_add_signed(TimeDelta::hours(1)),
            Granularity::Day => start.checked_add_signed(TimeDelta::days(1)),
            Granularity::Month => start.checked_add_months(Months::new(1)),
            Granularity::Quarter => start.checked_add_months(Months::new(3)),
            Granularity::Year => start.checked_add_months(Months::new(12)),
        }
    }

    /// Whether `ts` falls exactly on a bucket boundary.
    pub fn is_aligned(&self, ts: NaiveDateTime) -> bool {
        self.bucket_start(ts) == Some(ts)
    }

    /// Compact label used in partition table names (`2024`, `2024q2`, `202403`).
    pub fn partition_label(&self, start: NaiveDateTime) -> String {
        match self {
            Granularity::Hour => start.format("%Y%m%d%H").to_string(),
            Granularity::Day => start.format("%Y%m%d").to_string(),
            Granularity::Month => start.format("%Y%m").to_string(),
            Granularity::Quarter => format!("{}q{}", start.year(), start.month0() / 3 + 1),
            Granularity::Year => start.format("%Y").to_string(),
        }
    }
}

fn midnight(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Granularity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" => Ok(Granularity::Hour),
            "day" => Ok(Granularity::Day),
            "month" => Ok(Granularity::Month),
            "quarter" => Ok(Granularity::Quarter),
            "year" => Ok(Granularity::Year),
            other => Err(format!("unknown granularity '{}'", other)),
        }
    }
}

// =============================================================================
// Member Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DimensionType {
    Number,
    String,
    Boolean,
    Time,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MeasureType {
    Count,
    #[serde(alias = "count_distinct")]
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    /// A raw expression, emitted without an additional aggregate.
    Number,
}

impl MeasureType {
    /// Whether partial results can be combined by a further aggregate.
    pub fn is_additive(&self) -> bool {
        self.reaggregate_function().is_some()
    }

    /// Aggregate applied when rolling partial results up to a coarser grouping.
    pub fn reaggregate_function(&self) -> Option<&'static str> {
        match self {
            MeasureType::Count | MeasureType::Sum => Some("SUM"),
            MeasureType::Min => Some("MIN"),
            MeasureType::Max => Some("MAX"),
            MeasureType::CountDistinct | MeasureType::Avg | MeasureType::Number => None,
        }
    }
}

/// Display hint carried through to metadata; never affects SQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MeasureFormat {
    Number,
    Percent,
    Currency,
}

impl MeasureFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            MeasureFormat::Number => "number",
            MeasureFormat::Percent => "percent",
            MeasureFormat::Currency => "currency",
        }
    }
}

// =============================================================================
// Relationships
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Relationship {
    #[serde(rename = "belongsTo", alias = "belongs_to", alias = "many_to_one")]
    BelongsTo,
    #[serde(rename = "hasMany", alias = "has_many", alias = "one_to_many")]
    HasMany,
    #[serde(rename = "hasOne", alias = "has_one", alias = "one_to_one")]
    HasOne,
}

impl Relationship {
    /// Whether walking this join multiplies rows of the side already joined.
    ///
    /// `forward` is true when traversal goes from the declaring entity to the target.
    pub fn fans_out(&self, forward: bool) -> bool {
        match self {
            Relationship::HasMany => forward,
            Relationship::BelongsTo => !forward,
            Relationship::HasOne => false,
        }
    }
}
