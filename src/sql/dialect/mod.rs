//! SQL Dialect definitions and formatting rules.
//!
//! This module provides a trait-based abstraction for SQL dialect differences.
//! Each dialect implements `SqlDialect` to handle its specific syntax:
//!
//! - Identifier quoting: `"` (PG/DuckDB/Snowflake/SQLite), `` ` `` (MySQL), `[]` (T-SQL)
//! - Pagination: LIMIT/OFFSET vs OFFSET FETCH
//! - Boolean literals: true/false vs 1/0
//! - Time bucketing: DATE_TRUNC vs DATETRUNC vs DATE_FORMAT vs strftime
//! - Rollup materialization: CREATE TABLE AS vs SELECT INTO
//!
//! # Usage
//!
//! ```ignore
//! use prism::sql::{Dialect, SqlDialect};
//!
//! let dialect = Dialect::Postgres;
//! let quoted = dialect.quote_identifier("Status.name");  // "Status.name"
//! ```

mod duckdb;
pub mod helpers;
mod mysql;
mod postgres;
mod snowflake;
mod sqlite;
mod tsql;

pub use duckdb::DuckDb;
pub use mysql::MySql;
pub use postgres::Postgres;
pub use snowflake::Snowflake;
pub use sqlite::Sqlite;
pub use tsql::TSql;

use std::str::FromStr;

use super::token::TokenStream;
use crate::model::Granularity;

/// SQL dialect trait - defines how SQL constructs are rendered.
///
/// Implementations handle dialect-specific syntax differences.
/// The default implementations follow ANSI SQL where possible.
pub trait SqlDialect: std::fmt::Debug {
    /// Dialect name for display/logging.
    fn name(&self) -> &'static str;

    // =========================================================================
    // Identifier and Literal Quoting
    // =========================================================================

    /// Quote an identifier (table, column, alias).
    fn quote_identifier(&self, ident: &str) -> String;

    /// Quote a string literal.
    fn quote_string(&self, s: &str) -> String {
        helpers::quote_string_single(s)
    }

    /// Format a boolean literal.
    fn format_bool(&self, b: bool) -> &'static str;

    /// Format a date literal.
    ///
    /// - ANSI/PostgreSQL/DuckDB: `DATE 'YYYY-MM-DD'`
    /// - T-SQL/SQLite: `'YYYY-MM-DD'`
    fn format_date_literal(&self, date: &str) -> String {
        format!("DATE '{}'", date)
    }

    // =========================================================================
    // Pagination
    // =========================================================================

    /// Emit LIMIT/OFFSET or equivalent pagination clause.
    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        helpers::emit_limit_offset_standard(limit, offset)
    }

    /// Whether this dialect requires ORDER BY for OFFSET/LIMIT.
    ///
    /// T-SQL requires ORDER BY when using OFFSET FETCH.
    fn requires_order_by_for_offset(&self) -> bool {
        false
    }

    // =========================================================================
    // Operators
    // =========================================================================

    /// String concatenation operator.
    fn concat_operator(&self) -> &'static str {
        "||"
    }

    /// Whether this dialect supports the `||` concat operator.
    ///
    /// MySQL uses `||` as logical OR by default.
    fn supports_concat_operator(&self) -> bool {
        true
    }

    /// Whether this dialect supports NULLS FIRST/LAST in ORDER BY.
    fn supports_nulls_ordering(&self) -> bool {
        true
    }

    // =========================================================================
    // Set Operations
    // =========================================================================

    /// Whether operands of UNION may be wrapped in parentheses.
    ///
    /// SQLite rejects `(SELECT ...) UNION ALL (SELECT ...)`.
    fn supports_parenthesized_set_operands(&self) -> bool {
        true
    }

    // =========================================================================
    // Time Bucketing
    // =========================================================================

    /// Truncate a time expression to the start of its granularity bucket.
    fn emit_date_trunc(&self, granularity: Granularity, expr: &TokenStream) -> TokenStream {
        helpers::date_trunc_keyword_first(granularity, expr)
    }

    // =========================================================================
    // Rollup Materialization
    // =========================================================================

    /// Materialize `query` into a new table.
    fn emit_create_table_as(&self, table: &TokenStream, query: &TokenStream) -> TokenStream {
        helpers::create_table_as_standard(table, query)
    }

    /// Whether this dialect supports IF EXISTS for DROP statements.
    fn supports_if_exists(&self) -> bool {
        true
    }

    // =========================================================================
    // Function Remapping
    // =========================================================================

    /// Remap a function name for this dialect.
    ///
    /// Returns `Some(new_name)` if the function should be remapped, `None` to keep original.
    fn remap_function(&self, name: &str) -> Option<&'static str> {
        let _ = name;
        None
    }
}

/// Supported SQL dialects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dialect {
    #[default]
    Postgres,
    DuckDb,
    MySql,
    TSql,
    Snowflake,
    Sqlite,
}

impl Dialect {
    /// Get the dialect implementation.
    pub fn dialect(&self) -> &'static dyn SqlDialect {
        match self {
            Dialect::Postgres => &Postgres,
            Dialect::DuckDb => &DuckDb,
            Dialect::MySql => &MySql,
            Dialect::TSql => &TSql,
            Dialect::Snowflake => &Snowflake,
            Dialect::Sqlite => &Sqlite,
        }
    }

    /// All dialects, in a stable order.
    pub fn all() -> [Dialect; 6] {
        [
            Dialect::Postgres,
            Dialect::DuckDb,
            Dialect::MySql,
            Dialect::TSql,
            Dialect::Snowflake,
            Dialect::Sqlite,
        ]
    }
}

// Implement SqlDialect for Dialect enum by delegating to concrete types
impl SqlDialect for Dialect {
    fn name(&self) -> &'static str {
        self.dialect().name()
    }

    fn quote_identifier(&self, ident: &str) -> String {
        self.dialect().quote_identifier(ident)
    }

    fn quote_string(&self, s: &str) -> String {
        self.dialect().quote_string(s)
    }

    fn format_bool(&self, b: bool) -> &'static str {
        self.dialect().format_bool(b)
    }

    fn format_date_literal(&self, date: &str) -> String {
        self.dialect().format_date_literal(date)
    }

    fn emit_limit_offset(&self, limit: Option<u64>, offset: Option<u64>) -> TokenStream {
        self.dialect().emit_limit_offset(limit, offset)
    }

    fn requires_order_by_for_offset(&self) -> bool {
        self.dialect().requires_order_by_for_offset()
    }

    fn concat_operator(&self) -> &'static str {
        self.dialect().concat_operator()
    }

    fn supports_concat_operator(&self) -> bool {
        self.dialect().supports_concat_operator()
    }

    fn supports_nulls_ordering(&self) -> bool {
        self.dialect().supports_nulls_ordering()
    }

    fn supports_parenthesized_set_operands(&self) -> bool {
        self.dialect().supports_parenthesized_set_operands()
    }

    fn emit_date_trunc(&self, granularity: Granularity, expr: &TokenStream) -> TokenStream {
        self.dialect().emit_date_trunc(granularity, expr)
    }

    fn emit_create_table_as(&self, table: &TokenStream, query: &TokenStream) -> TokenStream {
        self.dialect().emit_create_table_as(table, query)
    }

    fn supports_if_exists(&self) -> bool {
        self.dialect().supports_if_exists()
    }

    fn remap_function(&self, name: &str) -> Option<&'static str> {
        self.dialect().remap_function(name)
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.dialect().name())
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(Dialect::Postgres),
            "duckdb" => Ok(Dialect::DuckDb),
            "mysql" => Ok(Dialect::MySql),
            "tsql" | "mssql" | "sqlserver" => Ok(Dialect::TSql),
            "snowflake" => Ok(Dialect::Snowflake),
            "sqlite" => Ok(Dialect::Sqlite),
            other => Err(format!("unknown SQL dialect '{}'", other)),
        }
    }
}
