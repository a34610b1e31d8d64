//! Request serving.
//!
//! The engine resolves a request, reads from a covering rollup when one is
//! built (raw entity sources otherwise), and executes the compiled SQL on a
//! bounded worker pool with a per-request deadline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::{CacheError, RollupCatalog};
use crate::config::{Settings, SettingsError};
use crate::executor::{Executor, ExecutorError, ResultSet, ScalarValue};
use crate::rollup::{
    Clock, Freshness, RefreshError, RefreshScheduler, RollupMatcher, RollupStore, Snapshot,
    StaleDataWarning, SystemClock,
};
use crate::semantic::{CompiledQuery, QueryError, QueryRequest, SchemaError, SchemaRegistry, SqlCompiler};

// =============================================================================
// Errors
// =============================================================================

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    Refresh(#[from] RefreshError),

    #[error(transparent)]
    Catalog(#[from] CacheError),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,
}

// =============================================================================
// Responses
// =============================================================================

/// Where the rows came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum QuerySource {
    Raw,
    Rollup { rollup: String },
}

impl std::fmt::Display for QuerySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QuerySource::Raw => write!(f, "raw"),
            QuerySource::Rollup { rollup } => write!(f, "rollup:{}", rollup),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryResponse {
    pub columns: Vec<String>,
    pub rows: Vec<BTreeMap<String, ScalarValue>>,
    pub freshness: Freshness,
    pub source: QuerySource,
    pub sql: String,
}

impl QueryResponse {
    pub fn stale_warning(&self) -> Option<&StaleDataWarning> {
        match &self.freshness {
            Freshness::Stale { warning } => Some(warning),
            Freshness::Fresh => None,
        }
    }
}

/// The three user-visible outcomes of a request.
#[derive(Debug)]
pub enum QueryOutcome {
    Fresh(QueryResponse),
    StaleServed(QueryResponse, StaleDataWarning),
    Failed(EngineError),
}

impl From<EngineResult<QueryResponse>> for QueryOutcome {
    fn from(result: EngineResult<QueryResponse>) -> Self {
        match result {
            Ok(response) => match response.stale_warning().cloned() {
                Some(warning) => QueryOutcome::StaleServed(response, warning),
                None => QueryOutcome::Fresh(response),
            },
            Err(e) => QueryOutcome::Failed(e),
        }
    }
}

/// A compiled request and the snapshots it reads.
#[derive(Debug, Clone)]
pub struct QueryPlan {
    pub compiled: CompiledQuery,
    pub source: QuerySource,
    pub freshness: Freshness,
    /// Held until execution finishes so the tables are not dropped.
    pub snapshots: Vec<Arc<Snapshot>>,
}

// =============================================================================
// Engine
// =============================================================================

pub struct EngineBuilder {
    registry: Arc<SchemaRegistry>,
    executor: Arc<dyn Executor>,
    settings: Settings,
    catalog: Option<RollupCatalog>,
    clock: Arc<dyn Clock>,
}

impl EngineBuilder {
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.settings = settings.clone();
        self
    }

    /// Use this catalog instead of the one configured in `[storage]`.
    pub fn catalog(mut self, catalog: RollupCatalog) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn build(self) -> EngineResult<Engine> {
        let compiler = Arc::new(SqlCompiler::new(self.registry, self.settings.query.clone()));
        let store = Arc::new(RollupStore::new());

        let catalog = match self.catalog {
            Some(catalog) => Some(catalog),
            None => match self.settings.storage.catalog_path()? {
                Some(path) => Some(RollupCatalog::open(path)?),
                None => None,
            },
        };

        let mut scheduler = RefreshScheduler::builder(compiler.clone(), self.executor.clone(), store.clone())
            .settings(&self.settings)
            .clock(self.clock);
        if let Some(catalog) = catalog {
            scheduler = scheduler.catalog(catalog);
        }

        Ok(Engine {
            compiler,
            executor: self.executor,
            store,
            scheduler: scheduler.build()?,
            workers: Arc::new(Semaphore::new(self.settings.engine.workers.max(1))),
            timeout: self.settings.engine.request_timeout()?,
            default_refresh: self.settings.scheduler.default_refresh()?,
        })
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            warn!(error = %e, "rollup.scheduler.join_failed");
        }
    }
}

pub struct Engine {
    compiler: Arc<SqlCompiler>,
    executor: Arc<dyn Executor>,
    store: Arc<RollupStore>,
    scheduler: RefreshScheduler,
    workers: Arc<Semaphore>,
    timeout: Duration,
    default_refresh: Duration,
}

impl Engine {
    pub fn builder(registry: Arc<SchemaRegistry>, executor: Arc<dyn Executor>) -> EngineBuilder {
        EngineBuilder {
            registry,
            executor,
            settings: Settings::default(),
            catalog: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        self.compiler.registry()
    }

    pub fn compiler(&self) -> &SqlCompiler {
        &self.compiler
    }

    pub fn scheduler(&self) -> &RefreshScheduler {
        &self.scheduler
    }

    pub fn store(&self) -> &RollupStore {
        &self.store
    }

    /// Start the scheduling loop on the current runtime.
    pub fn start_scheduler(&self) -> SchedulerHandle {
        let (shutdown, receiver) = watch::channel(false);
        let scheduler = self.scheduler.clone();
        let task = tokio::spawn(async move { scheduler.run(receiver).await });
        SchedulerHandle { shutdown, task }
    }

    /// Resolve and compile a request, preferring a built rollup.
    pub fn plan(&self, request: &QueryRequest) -> EngineResult<QueryPlan> {
        let dialect = self.executor.dialect();
        let resolved = self.compiler.resolve(request)?;
        let requests = self.scheduler.build_requests();

        let matched = RollupMatcher::new(self.compiler.registry())
            .with_build_requests(&requests)
            .with_default_refresh(self.default_refresh)
            .find_match(&resolved, &self.store);
        if let Some(m) = matched {
            match self.compiler.compile_from_rollup(&resolved, &m.source, dialect) {
                Ok(compiled) => {
                    return Ok(QueryPlan {
                        compiled,
                        source: QuerySource::Rollup {
                            rollup: m.source.rollup,
                        },
                        freshness: m.freshness,
                        snapshots: m.snapshots,
                    })
                }
                Err(e) => warn!(rollup = %m.source.rollup, error = %e, "engine.rollup.compile_failed"),
            }
        }
        self.raw_plan(request)
    }

    /// Compile a request against the raw entity sources only.
    pub fn raw_plan(&self, request: &QueryRequest) -> EngineResult<QueryPlan> {
        let resolved = self.compiler.resolve(request)?;
        Ok(QueryPlan {
            compiled: self.compiler.compile_resolved(&resolved, self.executor.dialect())?,
            source: QuerySource::Raw,
            freshness: Freshness::Fresh,
            snapshots: Vec::new(),
        })
    }

    /// Serve a request. Dropping the future aborts the statement in flight.
    ///
    /// A failed rollup read is retried once against the raw sources, within
    /// the same deadline, and the rollup is queued for a rebuild.
    pub async fn query(&self, request: &QueryRequest) -> EngineResult<QueryResponse> {
        let request_id = Uuid::new_v4();
        let _permit = self
            .workers
            .acquire()
            .await
            .map_err(|_| EngineError::Cancelled)?;
        let started = Instant::now();
        let deadline = started + self.timeout;

        let mut plan = self.plan(request)?;
        debug!(request_id = %request_id, source = %plan.source, sql = %plan.compiled.sql, "engine.query.compiled");

        let first = self.run(&plan.compiled.sql, deadline).await;
        let result = match first {
            Err(EngineError::Executor(e)) if plan.source != QuerySource::Raw && e != ExecutorError::Interrupted => {
                warn!(request_id = %request_id, source = %plan.source, error = %e, "engine.rollup.read_failed");
                if let QuerySource::Rollup { rollup } = &plan.source {
                    if let Err(e) = self.scheduler.force_refresh(rollup) {
                        warn!(rollup = %rollup, error = %e, "engine.rollup.refresh_request_failed");
                    }
                }
                plan = self.raw_plan(request)?;
                self.run(&plan.compiled.sql, deadline).await?
            }
            other => other?,
        };
        let QueryPlan {
            compiled,
            source,
            freshness,
            snapshots,
        } = plan;
        drop(snapshots);

        let rows: Vec<BTreeMap<String, ScalarValue>> = result
            .rows
            .into_iter()
            .map(|row| compiled.columns.iter().cloned().zip(row).collect())
            .collect();

        info!(
            request_id = %request_id,
            source = %source,
            stale = matches!(freshness, Freshness::Stale { .. }),
            rows = rows.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "engine.query.served"
        );

        Ok(QueryResponse {
            columns: compiled.columns,
            rows,
            freshness,
            source,
            sql: compiled.sql,
        })
    }

    async fn run(&self, sql: &str, deadline: Instant) -> EngineResult<ResultSet> {
        let result = tokio::time::timeout_at(deadline, self.executor.execute(sql))
            .await
            .map_err(|_| EngineError::Timeout(self.timeout))??;
        Ok(result)
    }

    /// Serve a request and summarise the result as a [`QueryOutcome`].
    pub async fn execute(&self, request: &QueryRequest) -> QueryOutcome {
        self.query(request).await.into()
    }
}
