//! Outer pass for windowed members.
//!
//! Window functions run over the grouped result: the inner query aggregates
//! every plain member (plus helpers the window templates reference) and the
//! outer query selects from it as `base`.

use super::render::{Renderer, BASE_ALIAS};
use super::resolve::ResolvedRequest;
use super::{member_column, time_column};
use crate::semantic::error::QueryResult;
use crate::sql::{table_col, Expr, ExprExt, Query, SelectExpr, TableRef};

pub fn outer_query(
    renderer: &Renderer<'_>,
    resolved: &ResolvedRequest<'_>,
    inner: Query,
) -> QueryResult<Query> {
    let time = resolved
        .time_dimension
        .as_ref()
        .and_then(|t| t.granularity.map(|g| (t.dimension.path(), g)));
    let time_ref = time.as_ref().map(|(path, g)| (path, *g));

    let base_column = |column: &str| -> SelectExpr { table_col(BASE_ALIAS, column).alias(column) };

    let mut select = Vec::new();

    for dim in &resolved.dimensions {
        let column = member_column(&dim.path());
        if dim.is_windowed() {
            let expr: Expr = renderer.windowed_expr(&dim.entity, &dim.template, time_ref)?;
            select.push(expr.alias(&column));
        } else {
            select.push(base_column(&column));
        }
    }

    if let Some((path, granularity)) = &time {
        select.push(base_column(&time_column(path, *granularity)));
    }

    for measure in &resolved.measures {
        let column = member_column(&measure.path());
        match &measure.template {
            Some(template) if measure.is_windowed() => {
                let expr = renderer.windowed_expr(&measure.entity, template, time_ref)?;
                select.push(expr.alias(&column));
            }
            _ => select.push(base_column(&column)),
        }
    }

    Ok(Query::new()
        .select(select)
        .from(TableRef::subquery(inner).with_alias(BASE_ALIAS)))
}
