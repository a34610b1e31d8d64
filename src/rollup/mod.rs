//! Pre-aggregations (rollups).
//!
//! - [`matcher`] picks a built rollup that covers a request
//! - [`scheduler`] builds and refreshes rollup partitions
//! - [`store`] holds partition state and the current snapshot of each
//! - [`partition`] partition windows and keys
//!
//! Built snapshots are persisted in the [`RollupCatalog`].

pub mod matcher;
pub mod partition;
pub mod scheduler;
pub mod store;

pub use crate::cache::{CatalogEntry, RollupCatalog};
pub use matcher::{Freshness, RollupMatch, RollupMatcher, StaleDataWarning};
pub use partition::{PartitionKey, PartitionStatus, PartitionWindow, UNPARTITIONED};
pub use scheduler::{
    table_name, Clock, FixedClock, RefreshError, RefreshResult, RefreshScheduler, SchedulerBuilder,
    SystemClock, TickReport,
};
pub use store::{PartitionSlot, PartitionState, RollupStore, Snapshot};
