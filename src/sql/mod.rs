//! SQL generation module.
//!
//! This module provides a type-safe SQL builder that generates multi-dialect SQL.
//! It includes:
//!
//! - [`query`] - SELECT query builder, UNION ALL and rollup table statements
//! - [`expr`] - Expression AST and builder DSL
//! - [`token`] - Token types for SQL generation
//! - [`dialect`] - SQL dialect implementations

pub mod dialect;
pub mod expr;
pub mod query;
pub mod token;

#[cfg(test)]
pub mod test_utils;

// Re-export commonly used types at the sql module level
pub use dialect::{Dialect, SqlDialect};
pub use expr::{
    avg, case_when_else_null, col, conjunction, count, count_distinct, count_star, date_trunc,
    disjunction, func, lit_bool, lit_date, lit_float, lit_int, lit_null, lit_str, max, min, star,
    sum, table_col, BinaryOperator, Expr, ExprExt, Literal, UnaryOperator,
};
pub use query::{
    create_table_as, drop_table, Join, JoinType, LimitOffset, NullsOrder, OrderByExpr, Query,
    SelectExpr, SetOperation, SortDir, TableRef, TableSource,
};
pub use token::{Token, TokenStream};
