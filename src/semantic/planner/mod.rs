//! Request planning and SQL compilation.
//!
//! 1. **Resolve** - look up members, coerce filter values, map ordering
//! 2. **Render** - expand templates into dialect-aware token streams
//! 3. **Compile** - join tree, SELECT/WHERE/GROUP BY/HAVING, window pass
//!
//! Output columns are named after members: `Cube.member`, and
//! `Cube.member.granularity` for a bucketed time dimension. Rollup tables
//! use the same names, so rollup reads select columns by member.

pub mod compile;
pub mod filter;
pub mod render;
pub mod request;
pub mod resolve;
pub mod window;

pub use compile::{CompiledQuery, RollupSource, SqlCompiler, ROLLUP_ALIAS};
pub use request::{DateRange, Filter, FilterOperator, OrderSpec, QueryRequest, TimeDimensionRequest};
pub use resolve::{OrderItem, ResolvedFilter, ResolvedRequest, ResolvedTime};

use crate::model::Granularity;
use crate::semantic::registry::MemberPath;

/// Output column of a member.
pub fn member_column(path: &MemberPath) -> String {
    path.to_string()
}

/// Output column of a time dimension bucketed to `granularity`.
pub fn time_column(path: &MemberPath, granularity: Granularity) -> String {
    format!("{}.{}", path, granularity.as_str())
}
