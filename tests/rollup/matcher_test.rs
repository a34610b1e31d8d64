// tests/rollup/matcher_test.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, NaiveDateTime, Utc};
use prism::config::QuerySettings;
use prism::model::{parse_definitions, Granularity};
use prism::rollup::{
    Freshness, PartitionKey, PartitionStatus, PartitionWindow, RollupMatch, RollupMatcher,
    RollupStore, Snapshot,
};
use prism::semantic::{DateRange, Filter, FilterOperator, QueryRequest, SchemaRegistry, SqlCompiler};
use prism::sql::Dialect;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::Instant;

const ENERGY: &str = include_str!("../fixtures/energy_schema.json");
const BY_STATE_YEAR: &str = "ProjectTrackerMaster.capacityByStateYear";
const BY_MONTH: &str = "ProjectTrackerMaster.capacityByMonth";

fn compiler() -> SqlCompiler {
    let registry = SchemaRegistry::register(parse_definitions(ENERGY).unwrap()).unwrap();
    SqlCompiler::new(Arc::new(registry), QuerySettings::default())
}

fn snapshot(table: &str) -> Arc<Snapshot> {
    Arc::new(Snapshot {
        schema: None,
        table: table.to_string(),
        version: 1,
        built_at: Utc::now(),
        refresh_key: None,
    })
}

fn build(store: &RollupStore, key: PartitionKey, window: Option<PartitionWindow>, table: &str) {
    let (slot, _) = store.ensure(key, window);
    slot.swap(snapshot(table), Instant::now(), false);
}

fn year_window(year: i32) -> PartitionWindow {
    let start = |y: i32| -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    };
    PartitionWindow {
        start: start(year),
        end: start(year + 1),
    }
}

fn find(compiler: &SqlCompiler, request: &QueryRequest, store: &RollupStore) -> Option<RollupMatch> {
    let resolved = compiler.resolve(request).unwrap();
    RollupMatcher::new(compiler.registry()).find_match(&resolved, store)
}

fn by_state_year_store() -> RollupStore {
    let store = RollupStore::new();
    build(
        &store,
        PartitionKey::unpartitioned(BY_STATE_YEAR),
        None,
        "project_tracker_master_capacity_by_state_year_all_v1",
    );
    store
}

fn monthly_store() -> RollupStore {
    let store = RollupStore::new();
    for year in [2023, 2024] {
        build(
            &store,
            PartitionKey::new(BY_MONTH, year.to_string()),
            Some(year_window(year)),
            &format!("project_tracker_master_capacity_by_month_{}_v1", year),
        );
    }
    store
}

#[test]
fn test_superset_rollup_answers_coarser_request() {
    let c = compiler();
    let store = by_state_year_store();
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state");

    let m = find(&c, &request, &store).unwrap();
    assert_eq!(m.source.rollup, BY_STATE_YEAR);
    assert!(m.source.reaggregate);
    assert_eq!(m.freshness, Freshness::Fresh);
    assert_eq!(m.snapshots.len(), 1);

    let resolved = c.resolve(&request).unwrap();
    let compiled = c.compile_from_rollup(&resolved, &m.source, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;
    assert!(sql.contains(
        "FROM \"project_tracker_master_capacity_by_state_year_all_v1\" AS \"rollup\""
    ));
    assert!(sql.contains(
        "SUM(\"rollup\".\"ProjectTrackerMaster.totalCapacity\") AS \"ProjectTrackerMaster.totalCapacity\""
    ));
    assert!(sql.contains("GROUP BY \"rollup\".\"ProjectTrackerMaster.state\""));
    assert!(!sql.contains("project_tracker_master\".capacity"));
}

#[test]
fn test_exact_grouping_reads_rows_directly() {
    let c = compiler();
    let store = by_state_year_store();
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state")
        .dimension("ProjectTrackerMaster.year")
        .filter(Filter::member(
            "ProjectTrackerMaster.totalCapacity",
            FilterOperator::Gte,
            vec![json!(100)],
        ));

    let m = find(&c, &request, &store).unwrap();
    assert!(!m.source.reaggregate);

    let resolved = c.resolve(&request).unwrap();
    let compiled = c.compile_from_rollup(&resolved, &m.source, Dialect::Postgres).unwrap();
    assert!(compiled.sql.contains(
        "\"rollup\".\"ProjectTrackerMaster.totalCapacity\" AS \"ProjectTrackerMaster.totalCapacity\""
    ));
    assert!(compiled
        .sql
        .contains("WHERE \"rollup\".\"ProjectTrackerMaster.totalCapacity\" >= 100"));
    assert!(!compiled.sql.contains("GROUP BY"));
    assert!(!compiled.sql.contains("HAVING"));
}

#[test]
fn test_uncovered_members_do_not_match() {
    let c = compiler();
    let store = by_state_year_store();

    let missing_measure = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .dimension("ProjectTrackerMaster.state");
    assert!(find(&c, &missing_measure, &store).is_none());

    let missing_dimension = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("Status.name");
    assert!(find(&c, &missing_dimension, &store).is_none());

    let filter_outside = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state")
        .filter(Filter::member(
            "ProjectTrackerMaster.status",
            FilterOperator::Equals,
            vec![json!("Operational")],
        ));
    assert!(find(&c, &filter_outside, &store).is_none());

    let segmented = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .segment("ProjectTrackerMaster.large");
    assert!(find(&c, &segmented, &store).is_none());
}

#[test]
fn test_non_additive_measure_needs_exact_grouping() {
    let text = ENERGY.replace(
        "\"measures\": [\"totalCapacity\"],",
        "\"measures\": [\"totalCapacity\", \"averageCapacity\"],",
    );
    assert_ne!(text, ENERGY);
    let c = SqlCompiler::new(
        Arc::new(SchemaRegistry::register(parse_definitions(&text).unwrap()).unwrap()),
        QuerySettings::default(),
    );
    let store = by_state_year_store();

    let coarser = QueryRequest::new()
        .measure("ProjectTrackerMaster.averageCapacity")
        .dimension("ProjectTrackerMaster.state");
    assert!(find(&c, &coarser, &store).is_none());

    let exact = QueryRequest::new()
        .measure("ProjectTrackerMaster.averageCapacity")
        .dimension("ProjectTrackerMaster.state")
        .dimension("ProjectTrackerMaster.year");
    assert!(!find(&c, &exact, &store).unwrap().source.reaggregate);
}

#[test]
fn test_stale_partition_is_served_with_warning() {
    let c = compiler();
    let store = by_state_year_store();
    store
        .slot(&PartitionKey::unpartitioned(BY_STATE_YEAR))
        .unwrap()
        .update(|s| s.status = PartitionStatus::Failed);

    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state");
    let m = find(&c, &request, &store).unwrap();
    match m.freshness {
        Freshness::Stale { warning } => {
            assert_eq!(warning.rollup, BY_STATE_YEAR);
            assert_eq!(warning.partitions, vec!["all".to_string()]);
        }
        Freshness::Fresh => panic!("expected a stale match"),
    }
}

#[test]
fn test_unbuilt_rollup_requests_a_build() {
    let c = compiler();
    let store = RollupStore::new();
    let (tx, mut rx) = mpsc::unbounded_channel();

    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state");
    let resolved = c.resolve(&request).unwrap();
    let found = RollupMatcher::new(c.registry())
        .with_build_requests(&tx)
        .find_match(&resolved, &store);

    assert!(found.is_none());
    // Both rollups cover the request; each is asked for.
    assert_eq!(rx.try_recv().unwrap(), BY_STATE_YEAR);
    assert_eq!(rx.try_recv().unwrap(), BY_MONTH);
    assert!(rx.try_recv().is_err());
}

#[test]
fn test_date_range_prunes_partitions() {
    let c = compiler();
    let store = monthly_store();
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .time_dimension(
            "ProjectTrackerMaster.commissionedAt",
            Some(Granularity::Month),
            Some(DateRange::new(
                NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 6, 30).unwrap(),
            )),
        );

    let m = find(&c, &request, &store).unwrap();
    assert_eq!(m.source.rollup, BY_MONTH);
    assert_eq!(
        m.source.tables,
        vec![(None, "project_tracker_master_capacity_by_month_2024_v1".to_string())]
    );
    // state is stored but not requested.
    assert!(m.source.reaggregate);

    let resolved = c.resolve(&request).unwrap();
    let compiled = c.compile_from_rollup(&resolved, &m.source, Dialect::Postgres).unwrap();
    assert!(compiled.sql.contains(
        "\"rollup\".\"ProjectTrackerMaster.commissionedAt.month\" AS \"ProjectTrackerMaster.commissionedAt.month\""
    ));
    assert!(compiled.sql.contains(
        "\"rollup\".\"ProjectTrackerMaster.commissionedAt.month\" >= DATE '2024-01-01'"
    ));
}

#[test]
fn test_unaligned_range_or_finer_granularity_falls_back() {
    let c = compiler();
    let store = monthly_store();

    let mid_month = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Month),
        Some(DateRange::new(
            NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 31).unwrap(),
        )),
    );
    assert!(find(&c, &mid_month, &store).is_none());

    let daily = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Day),
        None,
    );
    assert!(find(&c, &daily, &store).is_none());
}

#[test]
fn test_coarser_granularity_unions_partitions() {
    let c = compiler();
    let store = monthly_store();
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .time_dimension(
            "ProjectTrackerMaster.commissionedAt",
            Some(Granularity::Quarter),
            None,
        );

    let m = find(&c, &request, &store).unwrap();
    assert!(m.source.reaggregate);
    assert_eq!(m.source.tables.len(), 2);

    let resolved = c.resolve(&request).unwrap();
    let compiled = c.compile_from_rollup(&resolved, &m.source, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;
    assert!(sql.contains("UNION ALL"));
    assert!(sql.contains("\"project_tracker_master_capacity_by_month_2023_v1\""));
    assert!(sql.contains("\"project_tracker_master_capacity_by_month_2024_v1\""));
    assert!(sql.contains(
        "DATE_TRUNC('quarter', \"rollup\".\"ProjectTrackerMaster.commissionedAt.month\") AS \"ProjectTrackerMaster.commissionedAt.quarter\""
    ));
}

#[test]
fn test_partition_without_snapshot_blocks_the_match() {
    let c = compiler();
    let store = monthly_store();
    store.ensure(PartitionKey::new(BY_MONTH, "2025"), Some(year_window(2025)));

    let everything = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Year),
        None,
    );
    assert!(find(&c, &everything, &store).is_none());

    let built_years = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Year),
        Some(DateRange::new(
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 12, 31).unwrap(),
        )),
    );
    assert_eq!(find(&c, &built_years, &store).unwrap().source.tables.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_expired_snapshot_is_served_stale() {
    let c = compiler();
    let store = by_state_year_store();
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state");
    assert_eq!(find(&c, &request, &store).unwrap().freshness, Freshness::Fresh);

    // Declared `every: 1 hour`; no tick has marked the partition stale.
    tokio::time::advance(Duration::from_secs(3600)).await;
    let slot = store.slot(&PartitionKey::unpartitioned(BY_STATE_YEAR)).unwrap();
    assert_eq!(slot.status(), PartitionStatus::Fresh);
    match find(&c, &request, &store).unwrap().freshness {
        Freshness::Stale { warning } => {
            assert_eq!(warning.rollup, BY_STATE_YEAR);
            assert_eq!(warning.partitions, vec!["all".to_string()]);
        }
        Freshness::Fresh => panic!("expired snapshot served as fresh"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_default_refresh_applies_without_declared_interval() {
    let c = compiler();
    let store = monthly_store();
    // 2024 was built while its window was still open; 2023 after it closed.
    store
        .slot(&PartitionKey::new(BY_MONTH, "2024"))
        .unwrap()
        .update(|s| s.built_while_open = true);
    let request = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Year),
        None,
    );
    let resolved = c.resolve(&request).unwrap();
    let matcher = RollupMatcher::new(c.registry()).with_default_refresh(Duration::from_secs(600));

    tokio::time::advance(Duration::from_secs(600)).await;
    // Without a default only declared intervals expire.
    let undeclared = RollupMatcher::new(c.registry()).find_match(&resolved, &store).unwrap();
    assert_eq!(undeclared.freshness, Freshness::Fresh);

    match matcher.find_match(&resolved, &store).unwrap().freshness {
        Freshness::Stale { warning } => {
            assert_eq!(warning.rollup, BY_MONTH);
            assert_eq!(warning.partitions, vec!["2024".to_string()]);
        }
        Freshness::Fresh => panic!("expected the open partition to expire"),
    }
}
