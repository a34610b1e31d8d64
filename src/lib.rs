//! # Prism
//!
//! A semantic-layer query engine: cube definitions compile to multi-dialect
//! SQL, and covering pre-aggregations are built, refreshed and served in
//! place of raw queries.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │           Cube definitions (JSON / TOML)                 │
//! │  (entities, dimensions, measures, joins, rollups)        │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!                          ▼ [registry]
//! ┌─────────────────────────────────────────────────────────┐
//! │        SchemaRegistry + JoinGraph (immutable)            │
//! └─────────────────────────────────────────────────────────┘
//!                          │
//!            QueryRequest  ▼ [planner]        [scheduler]
//! ┌────────────────────────────────┐   ┌────────────────────┐
//! │  rollup matcher ─▶ rollup read │◀──│ partition builds   │
//! │        └──────────▶ raw query  │   │ (CREATE TABLE AS)  │
//! └────────────────────────────────┘   └────────────────────┘
//!                          │
//!                          ▼ [executor]
//! ┌─────────────────────────────────────────────────────────┐
//! │                 Rows + freshness                         │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod executor;
pub mod model;
pub mod rollup;
pub mod semantic;
pub mod sql;

pub use sql::dialect;
pub use sql::expr;
pub use sql::query;
pub use sql::token;

/// Re-exports for convenient usage.
pub mod prelude {
    pub use crate::config::Settings;
    pub use crate::engine::{Engine, EngineError, QueryOutcome, QueryResponse, QuerySource};
    pub use crate::executor::{Executor, ExecutorError, ResultSet, ScalarValue, SqliteExecutor};
    pub use crate::model::{parse_definitions, CubeDef, Granularity};
    pub use crate::rollup::{Freshness, RefreshScheduler, StaleDataWarning};
    pub use crate::semantic::{
        CompiledQuery, DateRange, Filter, FilterOperator, OrderSpec, QueryError, QueryRequest,
        SchemaError, SchemaRegistry, SqlCompiler, TimeDimensionRequest,
    };
    pub use crate::sql::Dialect;
}

pub use engine::{Engine, EngineError, QueryOutcome, QueryResponse};
pub use sql::Dialect;
