//! Shared helper functions for SQL dialect implementations.
//!
//! This module provides reusable building blocks that dialects can compose
//! to implement the `SqlDialect` trait with minimal duplication.

use super::super::token::{Token, TokenStream};
use crate::model::Granularity;

// =============================================================================
// Identifier Quoting
// =============================================================================

/// Quote identifier with double quotes (ANSI style).
/// Used by: Postgres, DuckDB, Snowflake, SQLite
pub fn quote_double(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote identifier with backticks.
/// Used by: MySQL
pub fn quote_backtick(ident: &str) -> String {
    format!("`{}`", ident.replace('`', "``"))
}

/// Quote identifier with square brackets.
/// Used by: T-SQL
pub fn quote_bracket(ident: &str) -> String {
    format!("[{}]", ident.replace(']', "]]"))
}

// =============================================================================
// String Quoting
// =============================================================================

/// Quote string with single quotes (standard SQL).
pub fn quote_string_single(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}

/// Quote string with N prefix for Unicode (T-SQL).
pub fn quote_string_unicode(s: &str) -> String {
    format!("N'{}'", s.replace('\'', "''"))
}

/// MySQL treats backslash as an escape character inside string literals.
pub fn quote_string_mysql(s: &str) -> String {
    format!("'{}'", s.replace('\\', "\\\\").replace('\'', "''"))
}

// =============================================================================
// Boolean Formatting
// =============================================================================

/// Format boolean as literal true/false.
/// Used by: Postgres, DuckDB, Snowflake
pub fn format_bool_literal(b: bool) -> &'static str {
    if b {
        "true"
    } else {
        "false"
    }
}

/// Format boolean as numeric 1/0.
/// Used by: T-SQL, MySQL, SQLite
pub fn format_bool_numeric(b: bool) -> &'static str {
    if b {
        "1"
    } else {
        "0"
    }
}

// =============================================================================
// Pagination
// =============================================================================

/// Emit LIMIT ... OFFSET ... (standard SQL).
pub fn emit_limit_offset_standard(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();

    if let Some(lim) = limit {
        ts.push(Token::Limit)
            .space()
            .push(Token::LitInt(lim as i64));
    }

    if let Some(off) = offset {
        if limit.is_some() {
            ts.space();
        }
        ts.push(Token::Offset)
            .space()
            .push(Token::LitInt(off as i64));
    }

    ts
}

/// SQLite accepts OFFSET only after a LIMIT; `LIMIT -1` means unbounded.
pub fn emit_limit_offset_sqlite(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    match (limit, offset) {
        (None, Some(_)) => {
            let mut ts = TokenStream::new();
            ts.push(Token::Limit).space().push(Token::LitInt(-1)).space();
            ts.append(&emit_limit_offset_standard(None, offset));
            ts
        }
        _ => emit_limit_offset_standard(limit, offset),
    }
}

/// Emit OFFSET ... ROWS FETCH NEXT ... ROWS ONLY (T-SQL style).
/// Note: Requires ORDER BY clause in T-SQL
pub fn emit_limit_offset_tsql(limit: Option<u64>, offset: Option<u64>) -> TokenStream {
    let mut ts = TokenStream::new();

    let off = offset.unwrap_or(0);
    ts.push(Token::Offset)
        .space()
        .push(Token::LitInt(off as i64))
        .space()
        .push(Token::Rows);

    if let Some(lim) = limit {
        ts.space()
            .push(Token::Fetch)
            .space()
            .push(Token::Next)
            .space()
            .push(Token::LitInt(lim as i64))
            .space()
            .push(Token::Rows)
            .space()
            .push(Token::Only);
    }

    ts
}

// =============================================================================
// Time Truncation
// =============================================================================

/// `DATE_TRUNC('month', expr)`.
/// Used by: Postgres, DuckDB, Snowflake
pub fn date_trunc_keyword_first(granularity: Granularity, expr: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::FunctionName("DATE_TRUNC".into()))
        .lparen()
        .push(Token::LitString(granularity.as_str().into()))
        .comma()
        .space()
        .append(expr)
        .rparen();
    ts
}

/// `DATETRUNC(month, expr)` (SQL Server 2022+).
pub fn date_trunc_tsql(granularity: Granularity, expr: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::FunctionName("DATETRUNC".into()))
        .lparen()
        .push(Token::Raw(granularity.as_str().into()))
        .comma()
        .space()
        .append(expr)
        .rparen();
    ts
}

/// MySQL has no DATE_TRUNC; buckets are rebuilt with DATE_FORMAT.
pub fn date_trunc_mysql(granularity: Granularity, expr: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    match granularity {
        Granularity::Quarter => {
            // MAKEDATE(YEAR(x), 1) + INTERVAL (QUARTER(x) - 1) QUARTER
            ts.push(Token::Raw("MAKEDATE(YEAR(".into()))
                .append(expr)
                .push(Token::Raw("), 1) + INTERVAL (QUARTER(".into()))
                .append(expr)
                .push(Token::Raw(") - 1) QUARTER".into()));
        }
        _ => {
            let format = match granularity {
                Granularity::Hour => "%Y-%m-%d %H:00:00",
                Granularity::Day => "%Y-%m-%d",
                Granularity::Month => "%Y-%m-01",
                _ => "%Y-01-01",
            };
            ts.push(Token::FunctionName("DATE_FORMAT".into()))
                .lparen()
                .append(expr)
                .comma()
                .space()
                .push(Token::LitString(format.into()))
                .rparen();
        }
    }
    ts
}

/// SQLite stores dates as ISO text; buckets are computed with strftime/date.
pub fn date_trunc_sqlite(granularity: Granularity, expr: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    match granularity {
        Granularity::Hour => {
            ts.push(Token::Raw("strftime('%Y-%m-%d %H:00:00', ".into()))
                .append(expr)
                .rparen();
        }
        Granularity::Day => {
            ts.push(Token::Raw("date(".into())).append(expr).rparen();
        }
        Granularity::Month => {
            ts.push(Token::Raw("date(".into()))
                .append(expr)
                .push(Token::Raw(", 'start of month')".into()));
        }
        Granularity::Quarter => {
            ts.push(Token::Raw("date(".into()))
                .append(expr)
                .push(Token::Raw(
                    ", 'start of month', '-' || ((CAST(strftime('%m', ".into(),
                ))
                .append(expr)
                .push(Token::Raw(") AS INTEGER) - 1) % 3) || ' months')".into()));
        }
        Granularity::Year => {
            ts.push(Token::Raw("date(".into()))
                .append(expr)
                .push(Token::Raw(", 'start of year')".into()));
        }
    }
    ts
}

// =============================================================================
// Materialization
// =============================================================================

/// `CREATE TABLE t AS <query>`.
pub fn create_table_as_standard(table: &TokenStream, query: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Create)
        .space()
        .push(Token::Table)
        .space()
        .append(table)
        .space()
        .push(Token::As)
        .newline()
        .append(query);
    ts
}

/// `SELECT * INTO t FROM (<query>) AS src` (T-SQL has no CTAS).
pub fn create_table_as_select_into(table: &TokenStream, query: &TokenStream) -> TokenStream {
    let mut ts = TokenStream::new();
    ts.push(Token::Select)
        .space()
        .push(Token::Star)
        .space()
        .push(Token::Into)
        .space()
        .append(table)
        .space()
        .push(Token::From)
        .space()
        .lparen()
        .newline()
        .append(query)
        .newline()
        .rparen()
        .space()
        .push(Token::As)
        .space()
        .push(Token::Ident("src".into()));
    ts
}

// =============================================================================
// Function Remapping
// =============================================================================

/// Remap functions for T-SQL.
pub fn remap_function_tsql(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "LENGTH" => Some("LEN"),
        "NOW" => Some("GETDATE"),
        _ => None,
    }
}

/// Remap functions for SQLite.
pub fn remap_function_sqlite(name: &str) -> Option<&'static str> {
    match name.to_uppercase().as_str() {
        "NOW" => Some("CURRENT_TIMESTAMP"),
        _ => None,
    }
}
