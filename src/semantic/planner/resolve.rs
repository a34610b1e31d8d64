//! Resolve a request against the registry.
//!
//! Every member reference is looked up and checked for its role, filter
//! values are coerced to the member type, ordering is mapped to output
//! columns and the inner (grouped) member sets for windowed requests are
//! computed. Nothing here emits SQL.

use std::collections::HashSet;

use chrono::{NaiveDate, NaiveDateTime};
use serde_json::Value;

use super::request::{DateRange, Filter, FilterOperator, QueryRequest};
use super::{member_column, time_column};
use crate::config::QuerySettings;
use crate::model::{DimensionType, Granularity};
use crate::semantic::error::{QueryError, QueryResult};
use crate::semantic::registry::{
    Dimension, Measure, Member, MemberPath, RefTarget, SchemaRegistry, Segment,
};
use crate::sql::Literal;

/// The time dimension of a request.
#[derive(Debug, Clone)]
pub struct ResolvedTime<'r> {
    pub dimension: &'r Dimension,
    pub granularity: Option<Granularity>,
    pub date_range: Option<DateRange>,
}

impl ResolvedTime<'_> {
    /// Output column, when the time dimension is selected.
    pub fn column(&self) -> Option<String> {
        self.granularity
            .map(|g| time_column(&self.dimension.path(), g))
    }
}

/// A filter with resolved members and coerced values.
#[derive(Debug, Clone)]
pub enum ResolvedFilter<'r> {
    Member {
        path: MemberPath,
        member: Member<'r>,
        operator: FilterOperator,
        values: Vec<Literal>,
    },
    Or(Vec<ResolvedFilter<'r>>),
    And(Vec<ResolvedFilter<'r>>),
}

impl<'r> ResolvedFilter<'r> {
    /// Leaf members in declaration order.
    pub fn members(&self) -> Vec<Member<'r>> {
        match self {
            ResolvedFilter::Member { member, .. } => vec![*member],
            ResolvedFilter::Or(group) | ResolvedFilter::And(group) => {
                group.iter().flat_map(ResolvedFilter::members).collect()
            }
        }
    }

    /// Whether the filter applies to aggregated values.
    pub fn on_measures(&self) -> bool {
        self.members()
            .first()
            .is_some_and(|m| matches!(m, Member::Measure(_)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderItem {
    pub column: String,
    pub desc: bool,
}

/// A request with every reference resolved.
#[derive(Debug, Clone)]
pub struct ResolvedRequest<'r> {
    pub dimensions: Vec<&'r Dimension>,
    pub measures: Vec<&'r Measure>,
    pub segments: Vec<&'r Segment>,
    pub time_dimension: Option<ResolvedTime<'r>>,
    /// Top-level filters, ANDed. Each is entirely on dimensions or entirely on measures.
    pub filters: Vec<ResolvedFilter<'r>>,
    pub order: Vec<OrderItem>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Dimensions aggregated by the grouped query: requested non-windowed
    /// dimensions plus those referenced by windowed templates.
    pub inner_dimensions: Vec<&'r Dimension>,
    /// Measures aggregated by the grouped query.
    pub inner_measures: Vec<&'r Measure>,
}

impl<'r> ResolvedRequest<'r> {
    pub fn is_windowed(&self) -> bool {
        self.dimensions.iter().any(|d| d.is_windowed()) || self.measures.iter().any(|m| m.is_windowed())
    }

    /// Output columns in order: dimensions, time dimension, measures.
    pub fn columns(&self) -> Vec<String> {
        self.dimensions
            .iter()
            .map(|d| member_column(&d.path()))
            .chain(self.time_dimension.as_ref().and_then(ResolvedTime::column))
            .chain(self.measures.iter().map(|m| member_column(&m.path())))
            .collect()
    }

    pub fn dimension_filters(&self) -> impl Iterator<Item = &ResolvedFilter<'r>> {
        self.filters.iter().filter(|f| !f.on_measures())
    }

    pub fn measure_filters(&self) -> impl Iterator<Item = &ResolvedFilter<'r>> {
        self.filters.iter().filter(|f| f.on_measures())
    }

    /// Time granularity when the time dimension is selected.
    pub fn granularity(&self) -> Option<Granularity> {
        self.time_dimension.as_ref().and_then(|t| t.granularity)
    }
}

// =============================================================================
// Resolution
// =============================================================================

pub fn resolve_request<'r>(
    registry: &'r SchemaRegistry,
    request: &QueryRequest,
    settings: &QuerySettings,
) -> QueryResult<ResolvedRequest<'r>> {
    let dimensions = dedup(&request.dimensions)
        .into_iter()
        .map(|path| match registry.resolve_member(path)? {
            Member::Dimension(d) => Ok(d),
            other => Err(QueryError::InvalidRequest(format!(
                "'{}' is a {}, not a dimension",
                path,
                other.kind()
            ))),
        })
        .collect::<QueryResult<Vec<_>>>()?;

    let measures = dedup(&request.measures)
        .into_iter()
        .map(|path| match registry.resolve_member(path)? {
            Member::Measure(m) => Ok(m),
            other => Err(QueryError::InvalidRequest(format!(
                "'{}' is a {}, not a measure",
                path,
                other.kind()
            ))),
        })
        .collect::<QueryResult<Vec<_>>>()?;

    let segments = dedup(&request.segments)
        .into_iter()
        .map(|path| match registry.resolve_member(path)? {
            Member::Segment(s) => Ok(s),
            other => Err(QueryError::InvalidRequest(format!(
                "'{}' is a {}, not a segment",
                path,
                other.kind()
            ))),
        })
        .collect::<QueryResult<Vec<_>>>()?;

    let time_dimension = request
        .time_dimension
        .as_ref()
        .map(|td| {
            let dimension = match registry.resolve_member(&td.dimension)? {
                Member::Dimension(d) if d.dimension_type == DimensionType::Time => d,
                _ => {
                    return Err(QueryError::InvalidRequest(format!(
                        "'{}' is not a time dimension",
                        td.dimension
                    )))
                }
            };
            if let Some(range) = td.date_range {
                if range.from() > range.to() {
                    return Err(QueryError::InvalidRequest(format!(
                        "date range {} .. {} is reversed",
                        range.from(),
                        range.to()
                    )));
                }
            }
            Ok(ResolvedTime {
                dimension,
                granularity: td.granularity,
                date_range: td.date_range,
            })
        })
        .transpose()?;

    let selects_time = time_dimension.as_ref().is_some_and(|t| t.granularity.is_some());
    if dimensions.is_empty() && measures.is_empty() && !selects_time {
        return Err(QueryError::InvalidRequest(
            "request selects no measures or dimensions".into(),
        ));
    }

    if dimensions.is_empty() && !selects_time {
        if let Some(m) = measures.iter().find(|m| m.is_windowed()) {
            return Err(QueryError::UnresolvableMeasure {
                measure: m.path().to_string(),
            });
        }
    }

    let mut filters = Vec::new();
    for filter in &request.filters {
        flatten_and(resolve_filter(registry, filter)?, &mut filters);
    }
    for filter in &filters {
        check_homogeneous(filter)?;
    }

    let (inner_dimensions, inner_measures) =
        inner_members(registry, &dimensions, &measures, time_dimension.as_ref())?;

    let mut resolved = ResolvedRequest {
        dimensions,
        measures,
        segments,
        time_dimension,
        filters,
        order: Vec::new(),
        limit: Some(
            request
                .limit
                .unwrap_or(settings.default_limit)
                .min(settings.max_limit),
        ),
        offset: request.offset,
        inner_dimensions,
        inner_measures,
    };
    resolved.order = resolve_order(&resolved, request)?;
    Ok(resolved)
}

fn dedup(paths: &[String]) -> Vec<&str> {
    let mut seen = HashSet::new();
    paths
        .iter()
        .map(String::as_str)
        .filter(|p| seen.insert(*p))
        .collect()
}

fn flatten_and<'r>(filter: ResolvedFilter<'r>, out: &mut Vec<ResolvedFilter<'r>>) {
    match filter {
        ResolvedFilter::And(group) => {
            for f in group {
                flatten_and(f, out);
            }
        }
        other => out.push(other),
    }
}

/// An OR group cannot mix row-level and aggregate predicates.
fn check_homogeneous(filter: &ResolvedFilter<'_>) -> QueryResult<()> {
    let members = filter.members();
    let measures = members
        .iter()
        .filter(|m| matches!(m, Member::Measure(_)))
        .count();
    if measures != 0 && measures != members.len() {
        let first = members
            .first()
            .map(|m| format!("{}.{}", m.entity(), m.name()))
            .unwrap_or_default();
        return Err(QueryError::invalid_filter(
            &first,
            "a filter group cannot mix measures and dimensions",
        ));
    }
    Ok(())
}

fn resolve_order(resolved: &ResolvedRequest<'_>, request: &QueryRequest) -> QueryResult<Vec<OrderItem>> {
    let columns = resolved.columns();

    if request.order.is_empty() {
        let default = if let Some(column) = resolved.time_dimension.as_ref().and_then(ResolvedTime::column) {
            Some(OrderItem { column, desc: false })
        } else if let Some(m) = resolved.measures.first() {
            Some(OrderItem {
                column: member_column(&m.path()),
                desc: true,
            })
        } else {
            resolved.dimensions.first().map(|d| OrderItem {
                column: member_column(&d.path()),
                desc: false,
            })
        };
        return Ok(default.into_iter().collect());
    }

    request
        .order
        .iter()
        .map(|spec| {
            // A bare time dimension id orders by its selected bucket.
            let column = if columns.contains(&spec.id) {
                Some(spec.id.clone())
            } else {
                resolved
                    .time_dimension
                    .as_ref()
                    .filter(|t| member_column(&t.dimension.path()) == spec.id)
                    .and_then(ResolvedTime::column)
            };
            column
                .map(|column| OrderItem {
                    column,
                    desc: spec.desc,
                })
                .ok_or_else(|| QueryError::InvalidOrder {
                    member: spec.id.clone(),
                })
        })
        .collect()
}

/// Members the grouped query must compute for the windowed pass.
#[allow(clippy::type_complexity)]
fn inner_members<'r>(
    registry: &'r SchemaRegistry,
    dimensions: &[&'r Dimension],
    measures: &[&'r Measure],
    time: Option<&ResolvedTime<'r>>,
) -> QueryResult<(Vec<&'r Dimension>, Vec<&'r Measure>)> {
    let mut inner_dims: Vec<&Dimension> = dimensions.iter().copied().filter(|d| !d.is_windowed()).collect();
    let mut inner_measures: Vec<&Measure> = measures.iter().copied().filter(|m| !m.is_windowed()).collect();

    let selected_time = time.filter(|t| t.granularity.is_some()).map(|t| t.dimension.path());

    let windowed = dimensions
        .iter()
        .filter(|d| d.is_windowed())
        .map(|d| (d.path(), Member::Dimension(d)))
        .chain(
            measures
                .iter()
                .filter(|m| m.is_windowed())
                .map(|m| (m.path(), Member::Measure(m))),
        );

    for (owner, member) in windowed {
        let location = owner.to_string();
        for template in member.templates() {
            for r in template.references() {
                let RefTarget::Member(path) = registry.resolve_ref(&owner.entity, r, &location)? else {
                    continue;
                };
                if selected_time.as_ref() == Some(&path) {
                    continue;
                }
                match registry.resolve_field(&path.entity, &path.member)? {
                    Member::Dimension(d) if d.is_windowed() => {
                        return Err(nested_window(&location, &path));
                    }
                    Member::Dimension(d) => {
                        if !inner_dims.iter().any(|x| x.path() == path) {
                            inner_dims.push(d);
                        }
                    }
                    Member::Measure(m) if m.is_windowed() => {
                        return Err(nested_window(&location, &path));
                    }
                    Member::Measure(m) => {
                        if !inner_measures.iter().any(|x| x.path() == path) {
                            inner_measures.push(m);
                        }
                    }
                    Member::Segment(_) => {
                        return Err(QueryError::InvalidRequest(format!(
                            "windowed member '{}' references segment '{}'",
                            location, path
                        )));
                    }
                }
            }
        }
    }

    Ok((inner_dims, inner_measures))
}

fn nested_window(location: &str, path: &MemberPath) -> QueryError {
    QueryError::InvalidRequest(format!(
        "windowed member '{}' references windowed member '{}'",
        location, path
    ))
}

// =============================================================================
// Filters
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueKind {
    Number,
    String,
    Boolean,
    Time,
}

fn resolve_filter<'r>(registry: &'r SchemaRegistry, filter: &Filter) -> QueryResult<ResolvedFilter<'r>> {
    match filter {
        Filter::Or { or } => Ok(ResolvedFilter::Or(
            or.iter()
                .map(|f| resolve_filter(registry, f))
                .collect::<QueryResult<_>>()?,
        )),
        Filter::And { and } => Ok(ResolvedFilter::And(
            and.iter()
                .map(|f| resolve_filter(registry, f))
                .collect::<QueryResult<_>>()?,
        )),
        Filter::Member {
            member,
            operator,
            values,
        } => {
            let resolved = registry
                .resolve_member(member)
                .map_err(|e| QueryError::invalid_filter(member, e.to_string()))?;
            let kind = match resolved {
                Member::Dimension(d) if d.is_windowed() => {
                    return Err(QueryError::invalid_filter(member, "windowed members cannot be filtered"))
                }
                Member::Measure(m) if m.is_windowed() => {
                    return Err(QueryError::invalid_filter(member, "windowed members cannot be filtered"))
                }
                Member::Dimension(d) => match d.dimension_type {
                    DimensionType::Number => ValueKind::Number,
                    DimensionType::String => ValueKind::String,
                    DimensionType::Boolean => ValueKind::Boolean,
                    DimensionType::Time => ValueKind::Time,
                },
                Member::Measure(_) => ValueKind::Number,
                Member::Segment(_) => {
                    return Err(QueryError::invalid_filter(
                        member,
                        "segments cannot be filtered; request them in 'segments'",
                    ))
                }
            };
            let values = coerce_values(member, kind, *operator, values)?;
            Ok(ResolvedFilter::Member {
                path: MemberPath::new(resolved.entity(), resolved.name()),
                member: resolved,
                operator: *operator,
                values,
            })
        }
    }
}

fn coerce_values(
    member: &str,
    kind: ValueKind,
    operator: FilterOperator,
    values: &[Value],
) -> QueryResult<Vec<Literal>> {
    use FilterOperator::*;

    let expect_count = |n: usize| -> QueryResult<()> {
        if values.len() != n {
            return Err(QueryError::invalid_filter(
                member,
                format!("operator {:?} takes {} value(s), got {}", operator, n, values.len()),
            ));
        }
        Ok(())
    };
    let expect_some = || -> QueryResult<()> {
        if values.is_empty() {
            return Err(QueryError::invalid_filter(
                member,
                format!("operator {:?} needs at least one value", operator),
            ));
        }
        Ok(())
    };

    match operator {
        Set | NotSet => Ok(Vec::new()),
        Equals | NotEquals => {
            expect_some()?;
            values.iter().map(|v| coerce(member, kind, v, true)).collect()
        }
        Gt | Gte | Lt | Lte => {
            if kind == ValueKind::Boolean {
                return Err(QueryError::invalid_filter(
                    member,
                    "boolean members cannot be compared with gt/gte/lt/lte",
                ));
            }
            expect_count(1)?;
            values.iter().map(|v| coerce(member, kind, v, false)).collect()
        }
        Contains | NotContains | StartsWith | EndsWith => {
            if kind != ValueKind::String {
                return Err(QueryError::invalid_filter(
                    member,
                    format!("operator {:?} applies to string members only", operator),
                ));
            }
            expect_some()?;
            values.iter().map(|v| coerce(member, kind, v, false)).collect()
        }
        InDateRange | NotInDateRange | BeforeDate | AfterDate => {
            if kind != ValueKind::Time {
                return Err(QueryError::invalid_filter(
                    member,
                    format!("operator {:?} applies to time dimensions only", operator),
                ));
            }
            expect_count(if matches!(operator, InDateRange | NotInDateRange) { 2 } else { 1 })?;
            let dates = values
                .iter()
                .map(|v| parse_date(member, v))
                .collect::<QueryResult<Vec<_>>>()?;
            if let [from, to] = dates.as_slice() {
                if from > to {
                    return Err(QueryError::invalid_filter(member, "date range is reversed"));
                }
            }
            Ok(dates
                .into_iter()
                .map(|d| Literal::Date(d.format("%Y-%m-%d").to_string()))
                .collect())
        }
    }
}

fn coerce(member: &str, kind: ValueKind, value: &Value, allow_null: bool) -> QueryResult<Literal> {
    let mismatch = || {
        QueryError::invalid_filter(
            member,
            format!("value {} does not match the member type", value),
        )
    };

    if value.is_null() {
        return if allow_null { Ok(Literal::Null) } else { Err(mismatch()) };
    }

    match kind {
        ValueKind::Number => {
            let number = match value {
                Value::Number(n) => n.as_i64().map(Literal::Int).or_else(|| n.as_f64().map(Literal::Float)),
                Value::String(s) => {
                    let s = s.trim();
                    s.parse::<i64>()
                        .map(Literal::Int)
                        .ok()
                        .or_else(|| s.parse::<f64>().ok().map(Literal::Float))
                }
                _ => None,
            };
            match number {
                Some(Literal::Float(f)) if !f.is_finite() => Err(mismatch()),
                Some(lit) => Ok(lit),
                None => Err(mismatch()),
            }
        }
        ValueKind::String => match value {
            Value::String(s) => Ok(Literal::String(s.clone())),
            Value::Number(n) => Ok(Literal::String(n.to_string())),
            Value::Bool(b) => Ok(Literal::String(b.to_string())),
            _ => Err(mismatch()),
        },
        ValueKind::Boolean => match value {
            Value::Bool(b) => Ok(Literal::Bool(*b)),
            Value::String(s) => match s.to_ascii_lowercase().as_str() {
                "true" | "1" => Ok(Literal::Bool(true)),
                "false" | "0" => Ok(Literal::Bool(false)),
                _ => Err(mismatch()),
            },
            Value::Number(n) => match n.as_i64() {
                Some(1) => Ok(Literal::Bool(true)),
                Some(0) => Ok(Literal::Bool(false)),
                _ => Err(mismatch()),
            },
            _ => Err(mismatch()),
        },
        ValueKind::Time => {
            let Value::String(s) = value else {
                return Err(mismatch());
            };
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Ok(Literal::Date(date.format("%Y-%m-%d").to_string()));
            }
            ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .map(|ts| Literal::String(ts.format("%Y-%m-%d %H:%M:%S").to_string()))
                .ok_or_else(mismatch)
        }
    }
}

fn parse_date(member: &str, value: &Value) -> QueryResult<NaiveDate> {
    value
        .as_str()
        .and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
        .ok_or_else(|| {
            QueryError::invalid_filter(member, format!("{} is not a YYYY-MM-DD date", value))
        })
}
