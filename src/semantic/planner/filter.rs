//! Filter predicates.
//!
//! Filters compile against a caller-supplied member expression so the same
//! code serves raw queries (templates, aggregates) and rollup reads (table
//! columns, re-aggregated columns).

use chrono::NaiveDate;

use super::request::{DateRange, FilterOperator};
use super::resolve::ResolvedFilter;
use crate::semantic::error::{QueryError, QueryResult};
use crate::semantic::registry::{Member, MemberPath};
use crate::sql::{conjunction, disjunction, lit_date, lit_int, lit_str, Expr, ExprExt, Literal};

/// Escape character for LIKE patterns.
const LIKE_ESCAPE: char = '!';

/// Compile a (possibly nested) filter to a predicate.
pub fn filter_expr<'r, F>(filter: &ResolvedFilter<'r>, target: &F) -> QueryResult<Expr>
where
    F: Fn(&MemberPath, Member<'r>) -> QueryResult<Expr>,
{
    match filter {
        ResolvedFilter::Member {
            path,
            member,
            operator,
            values,
        } => member_predicate(path, target(path, *member)?, *operator, values),
        ResolvedFilter::Or(group) => {
            let predicates = group
                .iter()
                .map(|f| filter_expr(f, target))
                .collect::<QueryResult<Vec<_>>>()?;
            Ok(disjunction(predicates).unwrap_or_else(|| lit_int(1).eq(lit_int(0))))
        }
        ResolvedFilter::And(group) => {
            let predicates = group
                .iter()
                .map(|f| filter_expr(f, target))
                .collect::<QueryResult<Vec<_>>>()?;
            Ok(conjunction(predicates)
                .map(|p| Expr::Paren(Box::new(p)))
                .unwrap_or_else(|| lit_int(1).eq(lit_int(1))))
        }
    }
}

/// `expr >= from AND expr < to + 1 day`
pub fn date_range_predicate(expr: Expr, range: DateRange) -> QueryResult<Expr> {
    let from = range.from();
    let end = range
        .end_exclusive()
        .ok_or_else(|| QueryError::InvalidRequest(format!("date {} is out of range", range.to())))?;
    let x = expr.nested();
    Ok(x.clone()
        .gte(date_literal(from))
        .and(x.lt(date_literal(end))))
}

fn date_literal(date: NaiveDate) -> Expr {
    lit_date(&date.format("%Y-%m-%d").to_string())
}

fn next_day(path: &MemberPath, value: &Literal) -> QueryResult<Expr> {
    let Literal::Date(text) = value else {
        return Err(QueryError::invalid_filter(&path.to_string(), "expected a date value"));
    };
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.succ_opt())
        .map(date_literal)
        .ok_or_else(|| QueryError::invalid_filter(&path.to_string(), format!("invalid date '{}'", text)))
}

fn like_pattern(value: &Literal, prefix: &str, suffix: &str) -> Expr {
    let text = match value {
        Literal::String(s) => s.clone(),
        other => format!("{:?}", other),
    };
    let escaped = text
        .replace(LIKE_ESCAPE, "!!")
        .replace('%', "!%")
        .replace('_', "!_");
    lit_str(&format!("{}{}{}", prefix, escaped, suffix))
}

fn member_predicate(
    path: &MemberPath,
    expr: Expr,
    operator: FilterOperator,
    values: &[Literal],
) -> QueryResult<Expr> {
    use FilterOperator::*;

    let x = expr.nested();
    let first = || {
        values
            .first()
            .cloned()
            .map(Expr::Literal)
            .ok_or_else(|| QueryError::invalid_filter(&path.to_string(), "missing value"))
    };
    let no_values = || QueryError::invalid_filter(&path.to_string(), "missing value");

    let non_null: Vec<Expr> = values
        .iter()
        .filter(|v| **v != Literal::Null)
        .cloned()
        .map(Expr::Literal)
        .collect();
    let has_null = values.contains(&Literal::Null);

    let predicate = match operator {
        Equals => {
            let mut preds = Vec::new();
            match non_null.len() {
                0 => {}
                1 => preds.push(x.clone().eq(non_null[0].clone())),
                _ => preds.push(x.clone().in_list(non_null)),
            }
            if has_null {
                preds.push(x.is_null());
            }
            disjunction(preds).ok_or_else(no_values)?
        }
        NotEquals => {
            let differs = match non_null.len() {
                0 => None,
                1 => Some(x.clone().ne(non_null[0].clone())),
                _ => Some(x.clone().not_in_list(non_null)),
            };
            match (differs, has_null) {
                (Some(d), true) => conjunction(vec![d, x.is_not_null()]).ok_or_else(no_values)?,
                (Some(d), false) => disjunction(vec![d, x.is_null()]).ok_or_else(no_values)?,
                (None, true) => x.is_not_null(),
                (None, false) => return Err(no_values()),
            }
        }
        Contains | StartsWith | EndsWith => {
            let (prefix, suffix) = match operator {
                Contains => ("%", "%"),
                StartsWith => ("", "%"),
                _ => ("%", ""),
            };
            let preds = values
                .iter()
                .map(|v| x.clone().like_escape(like_pattern(v, prefix, suffix), LIKE_ESCAPE))
                .collect();
            disjunction(preds).ok_or_else(no_values)?
        }
        NotContains => {
            let preds = values
                .iter()
                .map(|v| x.clone().not_like_escape(like_pattern(v, "%", "%"), LIKE_ESCAPE))
                .collect();
            let all = conjunction(preds).ok_or_else(no_values)?;
            disjunction(vec![all, x.is_null()]).ok_or_else(no_values)?
        }
        Gt => x.gt(first()?),
        Gte => x.gte(first()?),
        Lt => x.lt(first()?),
        Lte => x.lte(first()?),
        Set => x.is_not_null(),
        NotSet => x.is_null(),
        InDateRange | NotInDateRange => {
            let [from, to] = values else {
                return Err(QueryError::invalid_filter(&path.to_string(), "expected two dates"));
            };
            let end = next_day(path, to)?;
            let from = Expr::Literal(from.clone());
            if operator == InDateRange {
                x.clone().gte(from).and(x.lt(end))
            } else {
                disjunction(vec![x.clone().lt(from), x.gte(end)]).ok_or_else(no_values)?
            }
        }
        BeforeDate => x.lt(first()?),
        AfterDate => {
            let value = values.first().ok_or_else(no_values)?;
            x.gte(next_day(path, value)?)
        }
    };
    Ok(predicate)
}
