//! SQL execution against the warehouse.
//!
//! The engine and the refresh scheduler only see the [`Executor`] trait.
//! [`SqliteExecutor`] is bundled for local use and tests.

mod sqlite;

pub use sqlite::SqliteExecutor;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::sql::Dialect;

/// Result type for executor calls.
pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutorError {
    /// The statement was interrupted (cancellation or timeout).
    #[error("statement interrupted")]
    Interrupted,

    /// The store is temporarily unable to run the statement.
    #[error("executor unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("unsupported value in column '{column}'")]
    UnsupportedValue { column: String },
}

impl ExecutorError {
    /// Whether running the same statement again may succeed.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ExecutorError::Interrupted | ExecutorError::Unavailable(_))
    }
}

/// A single cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl ScalarValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int(i) => Some(*i),
            ScalarValue::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(b) => write!(f, "{}", b),
            ScalarValue::Int(i) => write!(f, "{}", i),
            ScalarValue::Float(x) => write!(f, "{}", ryu::Buffer::new().format(*x)),
            ScalarValue::String(s) => write!(f, "{}", s),
        }
    }
}

/// Rows returned by a statement. Statements without a result set return
/// no columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ScalarValue>>,
}

impl ResultSet {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row.
    pub fn first_value(&self) -> Option<&ScalarValue> {
        self.rows.first().and_then(|row| row.first())
    }

    /// Rows keyed by column name.
    pub fn into_records(self) -> Vec<BTreeMap<String, ScalarValue>> {
        let columns = self.columns;
        self.rows
            .into_iter()
            .map(|row| columns.iter().cloned().zip(row).collect())
            .collect()
    }
}

/// Runs SQL in one dialect.
///
/// Dropping the future returned by `execute` must abort the statement in
/// flight.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, sql: &str) -> ExecutorResult<ResultSet>;

    fn dialect(&self) -> Dialect;
}
