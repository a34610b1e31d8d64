//! PostgreSQL SQL dialect.
//!
//! PostgreSQL features used by the compiler:
//! - ANSI identifier quoting (`"`)
//! - Native boolean type (true/false)
//! - `DATE_TRUNC('unit', ts)` for time buckets
//! - `CREATE TABLE ... AS` for rollup materialization

use super::helpers;
use super::SqlDialect;

/// PostgreSQL SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Postgres;

impl SqlDialect for Postgres {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_literal(b)
    }

    // Uses default emit_limit_offset, emit_date_trunc and emit_create_table_as
}
