//! Semantic layer - entities, joins, and request compilation.
//!
//! Users declare entities (cubes) with dimensions, measures, segments, joins
//! and pre-aggregations. The registry validates them once at load; requests
//! are then compiled against it:
//!
//! 1. **Registry** - resolve member references, check templates
//! 2. **Join graph** - spanning tree over the entities a request touches
//! 3. **Planner** - SELECT over the join tree or a covering rollup

pub mod error;
pub mod join_graph;
pub mod planner;
pub mod registry;

pub use error::{
    DisconnectedGraphError, QueryError, QueryResult, SchemaError, SchemaResult, UnknownFieldError,
};
pub use join_graph::{JoinGraph, JoinStep, JoinTree};
pub use planner::{
    member_column, time_column, CompiledQuery, DateRange, Filter, FilterOperator, OrderSpec,
    QueryRequest, ResolvedRequest, RollupSource, SqlCompiler, TimeDimensionRequest,
};
pub use registry::{
    Dimension, Entity, EntitySource, JoinDecl, Measure, Member, MemberPath, PreAggregation,
    RefTarget, SchemaRegistry, Segment,
};
