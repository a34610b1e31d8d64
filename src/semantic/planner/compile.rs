//! SQL compiler.
//!
//! Compiles a resolved request into one SELECT statement, either over the
//! joined entity sources (raw) or over a rollup's tables. Windowed members
//! add an outer pass; ordering and pagination always apply to the outermost
//! query.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::NaiveDateTime;
use tracing::debug;

use super::filter::{date_range_predicate, filter_expr};
use super::render::Renderer;
use super::request::{QueryRequest, TimeDimensionRequest};
use super::resolve::{resolve_request, ResolvedRequest};
use super::window::outer_query;
use super::{member_column, time_column};
use crate::config::QuerySettings;
use crate::model::Granularity;
use crate::semantic::error::{QueryError, QueryResult};
use crate::semantic::join_graph::JoinGraph;
use crate::semantic::registry::{Member, MemberPath, PreAggregation, SchemaRegistry};
use crate::sql::{
    col, conjunction, date_trunc, func, lit_date, max, min, table_col, Dialect, Expr, ExprExt,
    OrderByExpr, Query, SetOperation, TableRef,
};

/// Alias of the rollup table (or partition union) in rollup reads.
pub const ROLLUP_ALIAS: &str = "rollup";

/// One compiled statement and its output columns, in order.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub columns: Vec<String>,
    pub query: Query,
}

/// Tables a rollup read selects from.
#[derive(Debug, Clone, PartialEq)]
pub struct RollupSource {
    /// `Entity.rollup`
    pub rollup: String,
    /// `(schema, table)` per partition, in window order.
    pub tables: Vec<(Option<String>, String)>,
    pub time_dimension: Option<MemberPath>,
    pub granularity: Option<Granularity>,
    /// The rollup groups more finely than the request.
    pub reaggregate: bool,
}

/// Compiles requests against one registry.
#[derive(Debug, Clone)]
pub struct SqlCompiler {
    registry: Arc<SchemaRegistry>,
    graph: Arc<JoinGraph>,
    settings: QuerySettings,
}

impl SqlCompiler {
    pub fn new(registry: Arc<SchemaRegistry>, settings: QuerySettings) -> Self {
        let graph = Arc::new(JoinGraph::build(&registry));
        Self {
            registry,
            graph,
            settings,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn join_graph(&self) -> &JoinGraph {
        &self.graph
    }

    pub fn resolve(&self, request: &QueryRequest) -> QueryResult<ResolvedRequest<'_>> {
        resolve_request(&self.registry, request, &self.settings)
    }

    /// Resolve and compile a request against raw entity sources.
    pub fn compile(&self, request: &QueryRequest, dialect: Dialect) -> QueryResult<CompiledQuery> {
        let resolved = self.resolve(request)?;
        self.compile_resolved(&resolved, dialect)
    }

    pub fn compile_resolved(
        &self,
        resolved: &ResolvedRequest<'_>,
        dialect: Dialect,
    ) -> QueryResult<CompiledQuery> {
        let inner = self.grouped_query(resolved, Vec::new())?;
        self.finish(resolved, inner, dialect)
    }

    /// Compile a request that a rollup covers.
    pub fn compile_from_rollup(
        &self,
        resolved: &ResolvedRequest<'_>,
        source: &RollupSource,
        dialect: Dialect,
    ) -> QueryResult<CompiledQuery> {
        let inner = self.rollup_query(resolved, source)?;
        self.finish(resolved, inner, dialect)
    }

    /// The SELECT that materialises a rollup, optionally restricted to the
    /// partition window `[start, end)`.
    pub fn compile_rollup_build(
        &self,
        rollup: &PreAggregation,
        window: Option<(NaiveDateTime, NaiveDateTime)>,
        dialect: Dialect,
    ) -> QueryResult<CompiledQuery> {
        let request = QueryRequest {
            measures: rollup.measures.iter().map(|p| p.to_string()).collect(),
            dimensions: rollup.dimensions.iter().map(|p| p.to_string()).collect(),
            segments: rollup.segments.iter().map(|p| p.to_string()).collect(),
            time_dimension: rollup.time_dimension.as_ref().map(|p| TimeDimensionRequest {
                dimension: p.to_string(),
                granularity: rollup.granularity,
                date_range: None,
            }),
            ..Default::default()
        };
        let mut resolved = self.resolve(&request)?;
        resolved.order.clear();
        resolved.limit = None;
        resolved.offset = None;

        let mut extra = Vec::new();
        if let (Some((start, end)), Some(time)) = (window, &resolved.time_dimension) {
            let renderer = Renderer::new(&self.registry);
            let x = renderer.dimension_expr(time.dimension)?.nested();
            let start = lit_date(&start.date().format("%Y-%m-%d").to_string());
            let end = lit_date(&end.date().format("%Y-%m-%d").to_string());
            extra.push(x.clone().gte(start).and(x.lt(end)));
        }

        let query = self.grouped_query(&resolved, extra)?;
        let sql = query.to_sql(dialect);
        debug!(rollup = %rollup.qualified_name(), sql = %sql, "rollup.build.compiled");
        Ok(CompiledQuery {
            sql,
            columns: resolved.columns(),
            query,
        })
    }

    /// `SELECT MIN(t), MAX(t)` over the time dimension's source.
    pub fn compile_time_bounds(&self, rollup: &PreAggregation, dialect: Dialect) -> QueryResult<String> {
        let path = rollup.time_dimension.as_ref().ok_or_else(|| {
            QueryError::InvalidRequest(format!(
                "rollup {} has no time dimension",
                rollup.qualified_name()
            ))
        })?;
        let dimension = match self.registry.resolve_field(&path.entity, &path.member)? {
            Member::Dimension(d) => d,
            other => {
                return Err(QueryError::InvalidRequest(format!(
                    "'{}' is a {}, not a dimension",
                    path,
                    other.kind()
                )))
            }
        };
        let entity = self.registry.entity(&path.entity).ok_or_else(|| {
            QueryError::InvalidRequest(format!("unknown entity '{}'", path.entity))
        })?;

        let renderer = Renderer::new(&self.registry);
        let expr = renderer.dimension_expr(dimension)?;
        let query = Query::new()
            .select(vec![
                min(expr.clone()).alias("min_time"),
                max(expr).alias("max_time"),
            ])
            .from(renderer.source(entity)?);
        Ok(query.to_sql(dialect))
    }

    // =========================================================================
    // Query construction
    // =========================================================================

    /// The grouped query over joined entity sources.
    fn grouped_query(&self, resolved: &ResolvedRequest<'_>, extra: Vec<Expr>) -> QueryResult<Query> {
        let renderer = Renderer::new(&self.registry);

        let mut members: Vec<Member<'_>> = Vec::new();
        members.extend(resolved.inner_dimensions.iter().map(|d| Member::Dimension(*d)));
        if let Some(time) = &resolved.time_dimension {
            members.push(Member::Dimension(time.dimension));
        }
        members.extend(resolved.inner_measures.iter().map(|m| Member::Measure(*m)));
        members.extend(resolved.segments.iter().map(|s| Member::Segment(*s)));
        members.extend(resolved.filters.iter().flat_map(|f| f.members()));

        let mut required: Vec<String> = Vec::new();
        for member in members {
            for entity in renderer.member_entities(member)? {
                if !required.contains(&entity) {
                    required.push(entity);
                }
            }
        }

        let mut measure_counts: HashMap<String, usize> = HashMap::new();
        for m in &resolved.inner_measures {
            *measure_counts.entry(m.entity.clone()).or_default() += 1;
        }

        let tree = self.graph.resolve(&required, &measure_counts)?;
        let root = self.registry.entity(&tree.root).ok_or_else(|| {
            QueryError::InvalidRequest("request references no entity".into())
        })?;

        let mut query = Query::new().from(renderer.source(root)?);
        for step in &tree.steps {
            let target = self.registry.entity(&step.to).ok_or_else(|| {
                QueryError::InvalidRequest(format!("unknown entity '{}'", step.to))
            })?;
            let on = Expr::Fragment(renderer.template(&step.join.source, &step.join.template)?);
            query = query.left_join(renderer.source(target)?, on);
        }

        let mut select = Vec::new();
        let mut group = Vec::new();

        for dim in &resolved.inner_dimensions {
            let expr = renderer.dimension_expr(dim)?;
            select.push(expr.clone().alias(&member_column(&dim.path())));
            group.push(expr);
        }
        if let Some(time) = &resolved.time_dimension {
            if let Some(granularity) = time.granularity {
                let expr = date_trunc(granularity, renderer.dimension_expr(time.dimension)?);
                select.push(expr.clone().alias(&time_column(&time.dimension.path(), granularity)));
                group.push(expr);
            }
        }
        for measure in &resolved.inner_measures {
            select.push(
                renderer
                    .measure_expr(measure)?
                    .alias(&member_column(&measure.path())),
            );
        }
        query = query.select(select);

        for segment in &resolved.segments {
            query = query.filter(renderer.segment_expr(segment)?);
        }
        let dimension_target = |path: &MemberPath, member: Member<'_>| match member {
            Member::Dimension(d) => renderer.dimension_expr(d),
            _ => Err(QueryError::invalid_filter(&path.to_string(), "expected a dimension")),
        };
        for filter in resolved.dimension_filters() {
            query = query.filter(filter_expr(filter, &dimension_target)?);
        }
        if let Some(time) = &resolved.time_dimension {
            if let Some(range) = time.date_range {
                query = query.filter(date_range_predicate(
                    renderer.dimension_expr(time.dimension)?,
                    range,
                )?);
            }
        }
        for predicate in extra {
            query = query.filter(predicate);
        }

        let measure_target = |path: &MemberPath, member: Member<'_>| match member {
            Member::Measure(m) => renderer.measure_expr(m),
            _ => Err(QueryError::invalid_filter(&path.to_string(), "expected a measure")),
        };
        let having = resolved
            .measure_filters()
            .map(|f| filter_expr(f, &measure_target))
            .collect::<QueryResult<Vec<_>>>()?;
        if let Some(having) = conjunction(having) {
            query = query.having(having);
        }

        if resolved.inner_measures.is_empty() {
            query = query.distinct();
        } else if !group.is_empty() {
            query = query.group_by(group);
        }

        Ok(query)
    }

    /// The query over a rollup's tables.
    fn rollup_query(&self, resolved: &ResolvedRequest<'_>, source: &RollupSource) -> QueryResult<Query> {
        let from = match source.tables.as_slice() {
            [] => {
                return Err(QueryError::InvalidRequest(format!(
                    "rollup {} has no built tables",
                    source.rollup
                )))
            }
            [(schema, table)] => TableRef::table(schema.as_deref(), table),
            tables => {
                let parts = tables
                    .iter()
                    .map(|(schema, table)| {
                        Query::new()
                            .select_star()
                            .from(TableRef::table(schema.as_deref(), table))
                    })
                    .collect();
                let union = SetOperation::union_all_of(parts).ok_or_else(|| {
                    QueryError::InvalidRequest(format!("rollup {} has no built tables", source.rollup))
                })?;
                TableRef::subquery(union)
            }
        };
        let column = |name: &str| table_col(ROLLUP_ALIAS, name);
        let reaggregated = |path: &MemberPath, member: Member<'_>| -> QueryResult<Expr> {
            let Member::Measure(measure) = member else {
                return Err(QueryError::invalid_filter(&path.to_string(), "expected a measure"));
            };
            let value = column(&member_column(path));
            if !source.reaggregate {
                return Ok(value);
            }
            let function = measure.measure_type.reaggregate_function().ok_or_else(|| {
                QueryError::InvalidRequest(format!(
                    "measure '{}' cannot be re-aggregated from rollup {}",
                    path, source.rollup
                ))
            })?;
            Ok(func(function, vec![value]))
        };

        let mut query = Query::new().from(from.with_alias(ROLLUP_ALIAS));
        let mut select = Vec::new();
        let mut group = Vec::new();

        for dim in &resolved.inner_dimensions {
            let name = member_column(&dim.path());
            select.push(column(&name).alias(&name));
            group.push(column(&name));
        }
        if let Some(time) = &resolved.time_dimension {
            if let Some(granularity) = time.granularity {
                let stored = self.rollup_time_column(source)?;
                let expr = if Some(granularity) == source.granularity {
                    column(&stored)
                } else {
                    date_trunc(granularity, column(&stored))
                };
                select.push(expr.clone().alias(&time_column(&time.dimension.path(), granularity)));
                group.push(expr);
            }
        }
        for measure in &resolved.inner_measures {
            let path = measure.path();
            select.push(reaggregated(&path, Member::Measure(*measure))?.alias(&member_column(&path)));
        }
        query = query.select(select);

        let dimension_target = |path: &MemberPath, member: Member<'_>| match member {
            Member::Dimension(_) => Ok(column(&member_column(path))),
            _ => Err(QueryError::invalid_filter(&path.to_string(), "expected a dimension")),
        };
        for filter in resolved.dimension_filters() {
            query = query.filter(filter_expr(filter, &dimension_target)?);
        }
        if let Some(range) = resolved.time_dimension.as_ref().and_then(|t| t.date_range) {
            query = query.filter(date_range_predicate(
                column(&self.rollup_time_column(source)?),
                range,
            )?);
        }

        let measure_predicates = resolved
            .measure_filters()
            .map(|f| filter_expr(f, &reaggregated))
            .collect::<QueryResult<Vec<_>>>()?;
        if let Some(predicate) = conjunction(measure_predicates) {
            // Exact groupings hold one row per group, so measure filters are row filters.
            query = if source.reaggregate {
                query.having(predicate)
            } else {
                query.filter(predicate)
            };
        }

        if source.reaggregate {
            if resolved.inner_measures.is_empty() {
                query = query.distinct();
            } else if !group.is_empty() {
                query = query.group_by(group);
            }
        }

        Ok(query)
    }

    fn rollup_time_column(&self, source: &RollupSource) -> QueryResult<String> {
        match (&source.time_dimension, source.granularity) {
            (Some(path), Some(granularity)) => Ok(time_column(path, granularity)),
            _ => Err(QueryError::InvalidRequest(format!(
                "rollup {} has no time dimension",
                source.rollup
            ))),
        }
    }

    /// Apply the window pass, ordering and pagination.
    fn finish(
        &self,
        resolved: &ResolvedRequest<'_>,
        inner: Query,
        dialect: Dialect,
    ) -> QueryResult<CompiledQuery> {
        let mut query = if resolved.is_windowed() {
            outer_query(&Renderer::new(&self.registry), resolved, inner)?
        } else {
            inner
        };

        let order = resolved
            .order
            .iter()
            .map(|o| {
                if o.desc {
                    OrderByExpr::desc(col(&o.column))
                } else {
                    OrderByExpr::asc(col(&o.column))
                }
            })
            .collect();
        query = query.order_by(order);
        if let Some(limit) = resolved.limit {
            query = query.limit(limit);
        }
        if let Some(offset) = resolved.offset {
            query = query.offset(offset);
        }

        let sql = query.to_sql(dialect);
        Ok(CompiledQuery {
            sql,
            columns: resolved.columns(),
            query,
        })
    }
}
