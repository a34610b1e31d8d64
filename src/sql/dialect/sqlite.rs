//! SQLite SQL dialect.
//!
//! Used by the bundled executor. Differences that matter to the compiler:
//! - Dates are ISO-8601 text; buckets via `date()`/`strftime()`
//! - No `DATE '...'` literal syntax
//! - OFFSET requires LIMIT
//! - Compound SELECT operands cannot be parenthesized

use super::helpers;
use super::SqlDialect;
use crate::model::Granularity;
use crate::sql::token::TokenStream;

/// SQLite SQL dialect.
#[derive(Debug, Clone, Copy)]
pub struct Sqlite;

impl SqlDialect for Sqlite {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn quote_identifier(&self, ident: &str) -> String {
        helpers::quote_double(ident)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        helpers::format_bool_numeric(b)
    }

    fn format_date_literal(&self, date: &str) -> String {
        helpers::quote_string_single(date)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_sqlite(limit, offset)
    }

    fn supports_nulls_ordering(&self) -> bool {
        false
    }

    fn supports_parenthesized_set_operands(&self) -> bool {
        false
    }

    fn emit_date_trunc(&self, granularity: Granularity, expr: &TokenStream) -> TokenStream {
        helpers::date_trunc_sqlite(granularity, expr)
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        helpers::remap_function_sqlite(name)
    }
}
