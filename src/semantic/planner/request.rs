//! Request types accepted by the compiler.
//!
//! Requests arrive as camelCase JSON:
//!
//! ```json
//! {
//!   "measures": ["ProjectTrackerMaster.count"],
//!   "dimensions": ["ProjectTrackerMaster.status"],
//!   "filters": [{"member": "ProjectTrackerMaster.state", "operator": "equals", "values": ["NSW"]}],
//!   "timeDimension": {"dimension": "ProjectTrackerMaster.createdAt", "granularity": "month",
//!                     "dateRange": ["2024-01-01", "2024-06-30"]},
//!   "order": [{"id": "ProjectTrackerMaster.count", "desc": true}],
//!   "limit": 100
//! }
//! ```

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::model::Granularity;

/// A request for measures and dimensions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryRequest {
    pub measures: Vec<String>,
    pub dimensions: Vec<String>,
    pub segments: Vec<String>,
    pub filters: Vec<Filter>,
    pub time_dimension: Option<TimeDimensionRequest>,
    pub order: Vec<OrderSpec>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl QueryRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn measure(mut self, path: &str) -> Self {
        self.measures.push(path.to_string());
        self
    }

    pub fn dimension(mut self, path: &str) -> Self {
        self.dimensions.push(path.to_string());
        self
    }

    pub fn segment(mut self, path: &str) -> Self {
        self.segments.push(path.to_string());
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn time_dimension(
        mut self,
        path: &str,
        granularity: Option<Granularity>,
        date_range: Option<DateRange>,
    ) -> Self {
        self.time_dimension = Some(TimeDimensionRequest {
            dimension: path.to_string(),
            granularity,
            date_range,
        });
        self
    }

    pub fn order_by(mut self, id: &str, desc: bool) -> Self {
        self.order.push(OrderSpec {
            id: id.to_string(),
            desc,
        });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeDimensionRequest {
    pub dimension: String,
    /// Absent: the time dimension only filters by `date_range`.
    #[serde(default)]
    pub granularity: Option<Granularity>,
    #[serde(default)]
    pub date_range: Option<DateRange>,
}

/// Inclusive `[from, to]` calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange(pub NaiveDate, pub NaiveDate);

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self(from, to)
    }

    pub fn from(&self) -> NaiveDate {
        self.0
    }

    pub fn to(&self) -> NaiveDate {
        self.1
    }

    /// First day after the range.
    pub fn end_exclusive(&self) -> Option<NaiveDate> {
        self.1.succ_opt()
    }
}

/// Ad-hoc filter: a member predicate or a nested logical group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Filter {
    Member {
        member: String,
        operator: FilterOperator,
        #[serde(default)]
        values: Vec<serde_json::Value>,
    },
    Or {
        or: Vec<Filter>,
    },
    And {
        and: Vec<Filter>,
    },
}

impl Filter {
    pub fn member(member: &str, operator: FilterOperator, values: Vec<serde_json::Value>) -> Self {
        Filter::Member {
            member: member.to_string(),
            operator,
            values,
        }
    }

    /// Every member referenced anywhere in the filter.
    pub fn members(&self) -> Vec<&str> {
        match self {
            Filter::Member { member, .. } => vec![member.as_str()],
            Filter::Or { or: group } | Filter::And { and: group } => {
                group.iter().flat_map(Filter::members).collect()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    Equals,
    NotEquals,
    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Gt,
    Gte,
    Lt,
    Lte,
    Set,
    NotSet,
    InDateRange,
    NotInDateRange,
    BeforeDate,
    AfterDate,
}

impl FilterOperator {
    pub fn is_date_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::InDateRange
                | FilterOperator::NotInDateRange
                | FilterOperator::BeforeDate
                | FilterOperator::AfterDate
        )
    }

    pub fn is_pattern_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::Contains
                | FilterOperator::NotContains
                | FilterOperator::StartsWith
                | FilterOperator::EndsWith
        )
    }
}

/// `{"id": "Cube.member", "desc": true}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderSpec {
    pub id: String,
    #[serde(default)]
    pub desc: bool,
}
