//! Error types for the semantic layer.
//!
//! `SchemaError` is fatal at load time. `QueryError` is returned to the caller
//! for a single request and is never retried.

use thiserror::Error;

/// Result type for schema loading.
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Result type for request planning and compilation.
pub type QueryResult<T> = Result<T, QueryError>;

/// A definition failed validation while building the registry.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchemaError {
    #[error("entity '{0}' is declared more than once")]
    DuplicateEntity(String),

    #[error("{referenced_by} references undefined entity '{entity}'")]
    UndefinedEntity {
        referenced_by: String,
        entity: String,
    },

    #[error("invalid SQL expression in {location}: {message}")]
    InvalidExpression { location: String, message: String },

    #[error("extends cycle: {}", .0.join(" -> "))]
    ExtendsCycle(Vec<String>),

    #[error("entity '{entity}' declares more than one primary key: {}", .members.join(", "))]
    MultiplePrimaryKeys {
        entity: String,
        members: Vec<String>,
    },

    #[error("entity '{entity}' declares member '{member}' more than once")]
    DuplicateMember { entity: String, member: String },

    #[error("dimension {entity}.{dimension} references another entity '{referenced}'")]
    CrossEntityDimension {
        entity: String,
        dimension: String,
        referenced: String,
    },

    #[error("{location} references '{entity}', which is not reachable through declared joins")]
    UnreachableReference { location: String, entity: String },

    #[error("measure {entity}.{measure} has no sql expression")]
    MissingExpression { entity: String, measure: String },

    #[error("measure {entity}.{measure} is a raw number expression and cannot carry filters")]
    FilterOnRawMeasure { entity: String, measure: String },

    #[error("member reference cycle: {}", .0.join(" -> "))]
    MemberCycle(Vec<String>),

    #[error("{location} references unknown member '{member}'")]
    UnknownMember { location: String, member: String },

    #[error("entity '{entity}' has an invalid source: {message}")]
    InvalidSource { entity: String, message: String },

    #[error("pre-aggregation {entity}.{name} is invalid: {message}")]
    InvalidPreAggregation {
        entity: String,
        name: String,
        message: String,
    },

    #[error("failed to hash definitions: {0}")]
    Hash(String),
}

/// A member reference that does not resolve.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown field '{field}'{}", .entity.as_ref().map(|e| format!(" on entity '{}'", e)).unwrap_or_default())]
pub struct UnknownFieldError {
    pub entity: Option<String>,
    pub field: String,
}

/// A required entity cannot be reached from the join root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("entity '{entity}' is not reachable from '{root}' through declared joins")]
pub struct DisconnectedGraphError {
    pub root: String,
    pub entity: String,
}

/// A request could not be planned or compiled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    #[error(transparent)]
    UnknownField(#[from] UnknownFieldError),

    #[error("invalid filter on '{member}': {message}")]
    InvalidFilter { member: String, message: String },

    #[error("cannot order by '{member}': it is not selected")]
    InvalidOrder { member: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("windowed measure '{measure}' needs at least one dimension or a time dimension")]
    UnresolvableMeasure { measure: String },

    #[error(transparent)]
    DisconnectedGraph(#[from] DisconnectedGraphError),

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl QueryError {
    pub(crate) fn invalid_filter(member: &str, message: impl Into<String>) -> Self {
        QueryError::InvalidFilter {
            member: member.to_string(),
            message: message.into(),
        }
    }
}
