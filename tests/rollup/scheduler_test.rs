// tests/rollup/scheduler_test.rs
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use prism::cache::{table_hash, RollupCatalog};
use prism::config::{QuerySettings, Settings};
use prism::executor::{Executor, ExecutorResult, ResultSet, ScalarValue, SqliteExecutor};
use prism::model::parse_definitions;
use prism::rollup::{
    FixedClock, PartitionStatus, RefreshError, RefreshScheduler, RollupStore, TickReport,
};
use prism::semantic::{SchemaRegistry, SqlCompiler};
use prism::sql::Dialect;

const PROJECTS: &str = r#"[
    {"name": "Projects", "sql_table": "projects",
     "dimensions": [
        {"name": "id", "sql": "id", "type": "number", "primary_key": true},
        {"name": "state", "sql": "state", "type": "string"},
        {"name": "commissionedAt", "sql": "commissioned_at", "type": "time"}
     ],
     "measures": [
        {"name": "count", "type": "count"},
        {"name": "totalCapacity", "sql": "capacity", "type": "sum"}
     ],
     "pre_aggregations": [
        {"name": "byState", "measures": ["totalCapacity", "count"], "dimensions": ["state"],
         "refresh_key": {"sql": "SELECT COUNT(*) FROM projects"}},
        {"name": "byMonth", "measures": ["totalCapacity"], "dimensions": ["state"],
         "time_dimension": "commissionedAt", "granularity": "month", "partition_granularity": "year"}
     ]}
]"#;

const SOURCE: &str = "
    CREATE TABLE projects (id INTEGER, state TEXT, capacity INTEGER, commissioned_at TEXT);
    INSERT INTO projects VALUES
        (1, 'NSW', 100, '2023-03-15'),
        (2, 'NSW', 250, '2023-11-02'),
        (3, 'VIC', 50, '2024-02-10'),
        (4, 'QLD', 300, '2024-05-20'),
        (5, 'VIC', 75, '2024-05-28');
";

const BY_STATE: &str = "Projects.byState";
const BY_MONTH: &str = "Projects.byMonth";

struct Harness {
    executor: Arc<SqliteExecutor>,
    compiler: Arc<SqlCompiler>,
    clock: Arc<FixedClock>,
    scheduler: RefreshScheduler,
}

fn at(ts: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(ts).unwrap().with_timezone(&Utc)
}

fn compiler(text: &str) -> Arc<SqlCompiler> {
    let registry = SchemaRegistry::register(parse_definitions(text).unwrap()).unwrap();
    Arc::new(SqlCompiler::new(Arc::new(registry), QuerySettings::default()))
}

fn settings() -> Settings {
    let mut settings = Settings::default();
    settings.scheduler.retry_backoff = "0s".into();
    settings.scheduler.retry_jitter = "0s".into();
    settings
}

fn scheduler(
    compiler: &Arc<SqlCompiler>,
    executor: &Arc<SqliteExecutor>,
    clock: &Arc<FixedClock>,
    catalog: RollupCatalog,
) -> RefreshScheduler {
    RefreshScheduler::builder(compiler.clone(), executor.clone(), Arc::new(RollupStore::new()))
        .settings(&settings())
        .catalog(catalog)
        .clock(clock.clone())
        .build()
        .unwrap()
}

fn harness() -> Harness {
    let executor = Arc::new(SqliteExecutor::open_in_memory().unwrap());
    executor.execute_batch(SOURCE).unwrap();
    let compiler = compiler(PROJECTS);
    let clock = Arc::new(FixedClock::new(at("2024-06-15T00:00:00Z")));
    let scheduler = scheduler(
        &compiler,
        &executor,
        &clock,
        RollupCatalog::open_in_memory().unwrap(),
    );
    Harness {
        executor,
        compiler,
        clock,
        scheduler,
    }
}

fn report(dispatched: usize, built: usize, failed: usize, dropped: usize) -> TickReport {
    TickReport {
        dispatched,
        built,
        failed,
        dropped,
    }
}

impl Harness {
    fn current_table(&self, rollup: &str, partition: &str) -> String {
        let slot = self
            .scheduler
            .store()
            .partitions(rollup)
            .into_iter()
            .find(|s| s.key.partition == partition)
            .unwrap();
        slot.snapshot().unwrap().table.clone()
    }

    fn status(&self, rollup: &str) -> Vec<(String, PartitionStatus)> {
        self.scheduler
            .store()
            .partitions(rollup)
            .iter()
            .map(|s| (s.key.partition.clone(), s.status()))
            .collect()
    }

    async fn tables(&self) -> Vec<String> {
        self.executor
            .execute("SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'projects_by_%' ORDER BY name")
            .await
            .unwrap()
            .rows
            .into_iter()
            .filter_map(|r| r[0].as_str().map(String::from))
            .collect()
    }

    async fn rows(&self, sql: &str) -> Vec<Vec<ScalarValue>> {
        self.executor.execute(sql).await.unwrap().rows
    }

    fn hash8(&self) -> String {
        table_hash(self.compiler.registry().schema_hash()).to_string()
    }
}

#[tokio::test]
async fn test_first_tick_builds_every_partition() {
    let h = harness();
    assert_eq!(h.scheduler.tick().await, report(3, 3, 0, 0));

    assert_eq!(h.status(BY_STATE), vec![("all".to_string(), PartitionStatus::Fresh)]);
    assert_eq!(
        h.status(BY_MONTH),
        vec![
            ("2023".to_string(), PartitionStatus::Fresh),
            ("2024".to_string(), PartitionStatus::Fresh)
        ]
    );

    let table = h.current_table(BY_STATE, "all");
    assert_eq!(table, format!("projects_by_state_all_{}_v1", h.hash8()));
    let rows = h
        .rows(&format!(
            "SELECT \"Projects.state\", \"Projects.totalCapacity\", \"Projects.count\" FROM \"{}\" ORDER BY 1",
            table
        ))
        .await;
    assert_eq!(
        rows,
        vec![
            vec![ScalarValue::String("NSW".into()), ScalarValue::Int(350), ScalarValue::Int(2)],
            vec![ScalarValue::String("QLD".into()), ScalarValue::Int(300), ScalarValue::Int(1)],
            vec![ScalarValue::String("VIC".into()), ScalarValue::Int(125), ScalarValue::Int(2)],
        ]
    );

    // 2024 partition holds only 2024 rows, bucketed by month.
    let table = h.current_table(BY_MONTH, "2024");
    let rows = h
        .rows(&format!(
            "SELECT \"Projects.state\", \"Projects.commissionedAt.month\", \"Projects.totalCapacity\" FROM \"{}\" ORDER BY 2, 1",
            table
        ))
        .await;
    assert_eq!(
        rows,
        vec![
            vec![
                ScalarValue::String("VIC".into()),
                ScalarValue::String("2024-02-01".into()),
                ScalarValue::Int(50)
            ],
            vec![
                ScalarValue::String("QLD".into()),
                ScalarValue::String("2024-05-01".into()),
                ScalarValue::Int(300)
            ],
            vec![
                ScalarValue::String("VIC".into()),
                ScalarValue::String("2024-05-01".into()),
                ScalarValue::Int(75)
            ],
        ]
    );
}

#[tokio::test]
async fn test_fresh_partitions_are_left_alone() {
    let h = harness();
    h.scheduler.tick().await;
    assert_eq!(h.scheduler.tick().await, report(0, 0, 0, 0));
    assert_eq!(h.tables().await.len(), 3);
}

#[tokio::test]
async fn test_force_refresh_rebuilds_and_drops_old_table() {
    let h = harness();
    h.scheduler.tick().await;
    let old = h.current_table(BY_STATE, "all");

    assert_eq!(h.scheduler.force_refresh(BY_STATE).unwrap(), 1);
    assert_eq!(h.status(BY_STATE)[0].1, PartitionStatus::Stale);
    assert_eq!(h.scheduler.tick().await, report(1, 1, 0, 1));

    let new = h.current_table(BY_STATE, "all");
    assert_eq!(new, format!("projects_by_state_all_{}_v2", h.hash8()));
    let tables = h.tables().await;
    assert!(tables.contains(&new));
    assert!(!tables.contains(&old));
}

#[tokio::test]
async fn test_rebuild_with_unchanged_data_yields_identical_rows() {
    let h = harness();
    h.scheduler.tick().await;
    let first: Vec<_> = [(BY_STATE, "all"), (BY_MONTH, "2023"), (BY_MONTH, "2024")]
        .into_iter()
        .map(|(rollup, partition)| h.current_table(rollup, partition))
        .collect();

    h.scheduler.force_refresh(BY_STATE).unwrap();
    h.scheduler.force_refresh(BY_MONTH).unwrap();
    // Retired tables are dropped by this tick; read them before it.
    let mut before = Vec::new();
    for table in &first {
        before.push(h.rows(&format!("SELECT * FROM \"{}\" ORDER BY 1, 2, 3", table)).await);
    }
    assert_eq!(h.scheduler.tick().await, report(3, 3, 0, 3));

    let second: Vec<_> = [(BY_STATE, "all"), (BY_MONTH, "2023"), (BY_MONTH, "2024")]
        .into_iter()
        .map(|(rollup, partition)| h.current_table(rollup, partition))
        .collect();
    for ((old, new), rows) in first.iter().zip(&second).zip(&before) {
        assert_ne!(old, new);
        assert!(!rows.is_empty());
        let rebuilt = h.rows(&format!("SELECT * FROM \"{}\" ORDER BY 1, 2, 3", new)).await;
        assert_eq!(&rebuilt, rows, "{} and {} differ", old, new);
    }
}

#[tokio::test]
async fn test_retired_table_survives_while_a_reader_holds_it() {
    let h = harness();
    h.scheduler.tick().await;
    let reader = h
        .scheduler
        .store()
        .partitions(BY_STATE)
        .first()
        .and_then(|slot| slot.snapshot())
        .unwrap();

    h.scheduler.force_refresh(BY_STATE).unwrap();
    assert_eq!(h.scheduler.tick().await, report(1, 1, 0, 0));
    assert!(h.tables().await.contains(&reader.table));

    let old = reader.table.clone();
    drop(reader);
    assert_eq!(h.scheduler.tick().await.dropped, 1);
    assert!(!h.tables().await.contains(&old));
}

#[tokio::test]
async fn test_failed_build_keeps_previous_snapshot() {
    let h = harness();
    h.scheduler.tick().await;
    let built = h.current_table(BY_STATE, "all");

    h.executor.execute_batch("ALTER TABLE projects RENAME TO projects_moved").unwrap();
    h.scheduler.force_refresh(BY_STATE).unwrap();
    assert_eq!(h.scheduler.tick().await, report(1, 0, 1, 0));

    let slot = h.scheduler.store().partitions(BY_STATE).remove(0);
    let state = slot.state();
    assert_eq!(state.status, PartitionStatus::Failed);
    assert_eq!(state.failures, 1);
    assert_eq!(state.snapshot.as_ref().map(|s| s.table.clone()), Some(built.clone()));
    drop(state);

    // One retry after the backoff, then wait for the next refresh.
    assert_eq!(h.scheduler.tick().await, report(1, 0, 1, 0));
    assert_eq!(slot.state().failures, 2);
    assert_eq!(h.scheduler.tick().await, report(0, 0, 0, 0));

    // The half-built tables are cleaned up; the served one is untouched.
    assert_eq!(
        h.tables()
            .await
            .into_iter()
            .filter(|t| t.starts_with("projects_by_state"))
            .collect::<Vec<_>>(),
        vec![built.clone()]
    );

    h.executor.execute_batch("ALTER TABLE projects_moved RENAME TO projects").unwrap();
    h.scheduler.force_refresh(BY_STATE).unwrap();
    assert_eq!(h.scheduler.tick().await, report(1, 1, 0, 1));
    assert_eq!(slot.status(), PartitionStatus::Fresh);
    assert_eq!(slot.state().failures, 0);
    assert_eq!(
        h.current_table(BY_STATE, "all"),
        format!("projects_by_state_all_{}_v4", h.hash8())
    );
}

#[tokio::test]
async fn test_refresh_key_change_triggers_rebuild() {
    let h = harness();
    h.scheduler.tick().await;

    h.executor
        .execute_batch("INSERT INTO projects VALUES (6, 'SA', 20, '2024-06-01')")
        .unwrap();
    // Only the key-driven rollup notices.
    assert_eq!(h.scheduler.tick().await, report(1, 1, 0, 1));
    let table = h.current_table(BY_STATE, "all");
    let rows = h
        .rows(&format!("SELECT COUNT(*) FROM \"{}\"", table))
        .await;
    assert_eq!(rows, vec![vec![ScalarValue::Int(4)]]);
    assert_eq!(h.scheduler.tick().await, report(0, 0, 0, 0));
}

#[tokio::test]
async fn test_closing_partition_is_rebuilt_once() {
    let h = harness();
    h.scheduler.tick().await;
    let closed_2023 = h.current_table(BY_MONTH, "2023");

    h.clock.set(at("2025-01-02T00:00:00Z"));
    assert_eq!(h.scheduler.tick().await, report(1, 1, 0, 1));
    assert_eq!(h.current_table(BY_MONTH, "2023"), closed_2023);
    assert!(h.current_table(BY_MONTH, "2024").ends_with("_v2"));

    h.clock.advance(chrono::Duration::days(30));
    assert_eq!(h.scheduler.tick().await, report(0, 0, 0, 0));
}

#[tokio::test]
async fn test_new_data_discovers_new_partition() {
    let h = harness();
    h.scheduler.tick().await;

    h.executor
        .execute_batch("INSERT INTO projects VALUES (6, 'SA', 20, '2025-03-01')")
        .unwrap();
    // byState sees a new refresh key, byMonth a new 2025 partition.
    let report = h.scheduler.tick().await;
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.built, 2);

    let labels: Vec<String> = h.status(BY_MONTH).into_iter().map(|(p, _)| p).collect();
    assert_eq!(labels, vec!["2023", "2024", "2025"]);
}

#[tokio::test]
async fn test_force_refresh_unknown_rollup() {
    let h = harness();
    assert!(matches!(
        h.scheduler.force_refresh("Projects.missing"),
        Err(RefreshError::UnknownRollup(name)) if name == "Projects.missing"
    ));
    // Nothing built yet, nothing to mark.
    assert_eq!(h.scheduler.force_refresh(BY_STATE).unwrap(), 0);
}

#[tokio::test]
async fn test_restart_adopts_catalogued_snapshots() {
    let path = std::env::temp_dir().join(format!("prism-catalog-{}.db", Uuid::new_v4()));
    let executor = Arc::new(SqliteExecutor::open_in_memory().unwrap());
    executor.execute_batch(SOURCE).unwrap();
    let clock = Arc::new(FixedClock::new(at("2024-06-15T00:00:00Z")));
    let compiled = compiler(PROJECTS);

    let first = scheduler(&compiled, &executor, &clock, RollupCatalog::open(&path).unwrap());
    assert_eq!(first.tick().await.built, 3);
    drop(first);

    // Same definitions: everything is re-adopted.
    let second = scheduler(&compiled, &executor, &clock, RollupCatalog::open(&path).unwrap());
    assert_eq!(second.tick().await, report(0, 0, 0, 0));
    let slot = second.store().partitions(BY_STATE).remove(0);
    assert_eq!(slot.status(), PartitionStatus::Fresh);
    assert!(slot.snapshot().unwrap().table.ends_with("_v1"));
    drop(slot);
    drop(second);

    // Edited definitions: old snapshots are discarded and rebuilt.
    let edited = compiler(&PROJECTS.replace(
        r#"{"name": "count", "type": "count"}"#,
        r#"{"name": "count", "type": "count", "title": "Projects"}"#,
    ));
    assert_ne!(
        edited.registry().schema_hash(),
        compiled.registry().schema_hash()
    );
    let third = scheduler(&edited, &executor, &clock, RollupCatalog::open(&path).unwrap());
    assert_eq!(third.tick().await.built, 3);
    let catalog = RollupCatalog::open(&path).unwrap();
    let entries = catalog.entries().unwrap();
    assert_eq!(entries.len(), 3);
    assert!(entries
        .iter()
        .all(|e| e.schema_hash == edited.registry().schema_hash()));

    let _ = std::fs::remove_file(&path);
}

/// Holds `CREATE TABLE` statements naming `prefix` until the gate opens.
struct GatedExecutor {
    inner: Arc<SqliteExecutor>,
    prefix: String,
    gate: Semaphore,
}

#[async_trait]
impl Executor for GatedExecutor {
    async fn execute(&self, sql: &str) -> ExecutorResult<ResultSet> {
        if sql.starts_with("CREATE TABLE") && sql.contains(&self.prefix) {
            let _open = self.gate.acquire().await;
        }
        self.inner.execute(sql).await
    }

    fn dialect(&self) -> Dialect {
        self.inner.dialect()
    }
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    for _ in 0..250 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_run_keeps_ticking_while_a_build_is_slow() {
    let sqlite = Arc::new(SqliteExecutor::open_in_memory().unwrap());
    sqlite.execute_batch(SOURCE).unwrap();
    let gated = Arc::new(GatedExecutor {
        inner: sqlite,
        prefix: "projects_by_state_".into(),
        gate: Semaphore::new(0),
    });
    let mut settings = settings();
    settings.scheduler.build_concurrency = 4;
    let store = Arc::new(RollupStore::new());
    let scheduler = RefreshScheduler::builder(compiler(PROJECTS), gated.clone(), store.clone())
        .settings(&settings)
        .clock(Arc::new(FixedClock::new(at("2024-06-15T00:00:00Z"))))
        .build()
        .unwrap();

    let (shutdown, receiver) = watch::channel(false);
    let looping = scheduler.clone();
    let task = tokio::spawn(async move { looping.run(receiver).await });

    fn month_versions(store: &RollupStore) -> Vec<u64> {
        store
            .partitions(BY_MONTH)
            .iter()
            .filter_map(|s| s.snapshot().map(|snap| snap.version))
            .collect()
    }
    wait_for("monthly partitions", || month_versions(&store) == vec![1, 1]).await;
    assert_eq!(store.partitions(BY_STATE)[0].status(), PartitionStatus::Building);

    // The loop must pick this up while byState is still blocked.
    scheduler.force_refresh(BY_MONTH).unwrap();
    wait_for("monthly rebuild", || month_versions(&store) == vec![2, 2]).await;
    assert_eq!(store.partitions(BY_STATE)[0].status(), PartitionStatus::Building);

    gated.gate.add_permits(1);
    wait_for("byState build", || {
        store.partitions(BY_STATE)[0].status() == PartitionStatus::Fresh
    })
    .await;

    shutdown.send(true).unwrap();
    task.await.unwrap();
}
