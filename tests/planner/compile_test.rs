// tests/planner/compile_test.rs
use std::sync::Arc;

use chrono::NaiveDate;
use prism::config::QuerySettings;
use prism::executor::{Executor, ScalarValue, SqliteExecutor};
use prism::model::{parse_definitions, Granularity};
use prism::semantic::{
    DateRange, Filter, FilterOperator, QueryError, QueryRequest, SchemaRegistry, SqlCompiler,
};
use prism::sql::Dialect;
use serde_json::json;
use sqlparser::dialect::{GenericDialect, MsSqlDialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::parser::Parser;

const ENERGY: &str = include_str!("../fixtures/energy_schema.json");

fn compiler() -> SqlCompiler {
    compiler_for(ENERGY)
}

fn compiler_for(text: &str) -> SqlCompiler {
    let registry = SchemaRegistry::register(parse_definitions(text).unwrap()).unwrap();
    SqlCompiler::new(Arc::new(registry), QuerySettings::default())
}

fn assert_parses(sql: &str, dialect: &dyn sqlparser::dialect::Dialect) {
    if let Err(e) = Parser::parse_sql(dialect, sql) {
        panic!("generated SQL does not parse: {}\n{}", e, sql);
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

const STATUS_SUBQUERY: &str = "(SELECT s.name FROM public.statuses s WHERE s.id = \"project_tracker_master\".status_id AND s.filter_flag = true)";

#[test]
fn test_count_by_status_groups_on_reference_lookup() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .dimension("ProjectTrackerMaster.status");
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert_eq!(
        compiled.columns,
        vec!["ProjectTrackerMaster.status", "ProjectTrackerMaster.count"]
    );
    assert!(compiled.sql.contains("COUNT(*) AS \"ProjectTrackerMaster.count\""));
    assert!(compiled
        .sql
        .contains(&format!("{} AS \"ProjectTrackerMaster.status\"", STATUS_SUBQUERY)));
    assert!(compiled.sql.contains(&format!("GROUP BY {}", STATUS_SUBQUERY)));
    assert!(!compiled.sql.contains("JOIN"));
    assert!(compiled.sql.ends_with("ORDER BY \"ProjectTrackerMaster.count\" DESC\nLIMIT 10000"));
    assert_parses(&compiled.sql, &PostgreSqlDialect {});
}

#[test]
fn test_filtered_measures_share_one_query() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.operationalCapacity")
        .measure("ProjectTrackerMaster.underConstructionCapacity");
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;

    assert_eq!(sql.matches("SELECT").count(), 1);
    assert_eq!(sql.matches("CASE WHEN").count(), 2);
    assert!(sql.contains(
        "SUM(CASE WHEN \"project_tracker_master\".status_name = 'Operational' THEN \"project_tracker_master\".capacity ELSE NULL END) AS \"ProjectTrackerMaster.operationalCapacity\""
    ));
    assert!(sql.contains(
        "SUM(CASE WHEN \"project_tracker_master\".status_name = 'Under Construction' THEN \"project_tracker_master\".capacity ELSE NULL END) AS \"ProjectTrackerMaster.underConstructionCapacity\""
    ));
    assert!(!sql.contains("GROUP BY"));
    assert!(!sql.contains("WHERE"));
    assert_parses(sql, &PostgreSqlDialect {});
}

/// Per-state values of `measure` when run on SQLite alongside `others`.
async fn capacity_by_state(executor: &SqliteExecutor, measure: &str, others: &[&str]) -> Vec<(String, ScalarValue)> {
    let mut request = QueryRequest::new()
        .dimension("ProjectTrackerMaster.state")
        .measure(measure);
    for other in others {
        request = request.measure(*other);
    }
    let compiled = compiler().compile(&request, Dialect::Sqlite).unwrap();
    let mut values: Vec<(String, ScalarValue)> = executor
        .execute(&compiled.sql)
        .await
        .unwrap()
        .into_records()
        .into_iter()
        .map(|mut record| {
            let state = record["ProjectTrackerMaster.state"].as_str().unwrap().to_string();
            (state, record.remove(measure).unwrap())
        })
        .collect();
    values.sort_by(|a, b| a.0.cmp(&b.0));
    values
}

#[tokio::test]
async fn test_filtered_measure_values_do_not_depend_on_neighbours() {
    let executor = SqliteExecutor::open_in_memory().unwrap();
    executor
        .execute_batch(
            "ATTACH DATABASE ':memory:' AS public;
             CREATE TABLE public.project_tracker_master (id INTEGER, state TEXT, status_name TEXT, capacity INTEGER);
             INSERT INTO public.project_tracker_master VALUES
                (1, 'NSW', 'Operational', 100),
                (2, 'NSW', 'Under Construction', 200),
                (3, 'VIC', 'Operational', 50),
                (4, 'QLD', 'Under Construction', 300),
                (5, 'VIC', 'Decommissioned', 70);",
        )
        .unwrap();

    let operational = "ProjectTrackerMaster.operationalCapacity";
    let alone = capacity_by_state(&executor, operational, &[]).await;
    assert_eq!(
        alone,
        vec![
            ("NSW".to_string(), ScalarValue::Int(100)),
            ("QLD".to_string(), ScalarValue::Null),
            ("VIC".to_string(), ScalarValue::Int(50)),
        ]
    );

    let together = capacity_by_state(
        &executor,
        operational,
        &["ProjectTrackerMaster.underConstructionCapacity"],
    )
    .await;
    assert_eq!(together, alone);

    let under_construction = capacity_by_state(
        &executor,
        "ProjectTrackerMaster.underConstructionCapacity",
        &[operational, "ProjectTrackerMaster.totalCapacity"],
    )
    .await;
    assert_eq!(
        under_construction,
        vec![
            ("NSW".to_string(), ScalarValue::Int(200)),
            ("QLD".to_string(), ScalarValue::Int(300)),
            ("VIC".to_string(), ScalarValue::Null),
        ]
    );
}

#[test]
fn test_filter_on_unjoinable_entity_is_disconnected() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .filter(Filter::member(
            "Forecasts.region",
            FilterOperator::Equals,
            vec![json!("NSW")],
        ));
    let err = compiler().compile(&request, Dialect::Postgres).unwrap_err();
    match err {
        QueryError::DisconnectedGraph(e) => {
            assert_eq!(e.root, "ProjectTrackerMaster");
            assert_eq!(e.entity, "Forecasts");
        }
        other => panic!("expected a disconnected graph error, got {:?}", other),
    }
}

#[test]
fn test_simple_grouped_query() {
    let request = QueryRequest::new()
        .measure("States.count")
        .dimension("States.name")
        .filter(Filter::member("States.name", FilterOperator::Equals, vec![json!("NSW")]))
        .limit(5);
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    insta::assert_snapshot!(compiled.sql, @r#"
    SELECT
      "states".name AS "States.name",
      COUNT(*) AS "States.count"
    FROM "public"."states" AS "states"
    WHERE "states".name = 'NSW'
    GROUP BY "states".name
    ORDER BY "States.count" DESC
    LIMIT 5
    "#);
}

#[test]
fn test_dimension_from_joined_entity() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("Status.name");
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;

    assert!(sql.contains("FROM \"public\".\"project_tracker_master\" AS \"project_tracker_master\""));
    assert!(sql.contains(
        "LEFT JOIN \"public\".\"statuses\" AS \"status\" ON \"project_tracker_master\".status_id = \"status\".id"
    ));
    assert!(!sql.contains("\"states\""));
    assert!(sql.contains("GROUP BY \"status\".name"));
    assert_parses(sql, &PostgreSqlDialect {});
}

#[test]
fn test_segment_on_joined_entity_pulls_in_the_join() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .segment("Status.reportable");
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert!(compiled.sql.contains("LEFT JOIN \"public\".\"statuses\" AS \"status\""));
    assert!(compiled.sql.contains("WHERE \"status\".filter_flag = true"));
}

#[test]
fn test_time_dimension_bucket_and_range() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .time_dimension(
            "ProjectTrackerMaster.commissionedAt",
            Some(Granularity::Month),
            Some(DateRange::new(date(2024, 1, 1), date(2024, 12, 31))),
        );
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;

    assert_eq!(
        compiled.columns,
        vec![
            "ProjectTrackerMaster.commissionedAt.month",
            "ProjectTrackerMaster.totalCapacity"
        ]
    );
    assert!(sql.contains(
        "DATE_TRUNC('month', \"project_tracker_master\".commissioned_at) AS \"ProjectTrackerMaster.commissionedAt.month\""
    ));
    assert!(sql.contains(
        "\"project_tracker_master\".commissioned_at >= DATE '2024-01-01' AND \"project_tracker_master\".commissioned_at < DATE '2025-01-01'"
    ));
    assert!(sql.contains("ORDER BY \"ProjectTrackerMaster.commissionedAt.month\" ASC"));
    assert_parses(sql, &PostgreSqlDialect {});
}

#[test]
fn test_time_range_without_granularity_only_filters() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .time_dimension(
            "ProjectTrackerMaster.commissionedAt",
            None,
            Some(DateRange::new(date(2024, 3, 1), date(2024, 3, 31))),
        );
    let compiled = compiler().compile(&request, Dialect::Sqlite).unwrap();

    assert_eq!(compiled.columns, vec!["ProjectTrackerMaster.count"]);
    assert!(compiled.sql.contains(">= '2024-03-01'"));
    assert!(compiled.sql.contains("< '2024-04-01'"));
    assert_parses(&compiled.sql, &SQLiteDialect {});
}

#[test]
fn test_measure_filter_becomes_having() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("ProjectTrackerMaster.state")
        .filter(Filter::member(
            "ProjectTrackerMaster.totalCapacity",
            FilterOperator::Gt,
            vec![json!(500)],
        ));
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert!(compiled
        .sql
        .contains("HAVING SUM(\"project_tracker_master\".capacity) > 500"));
    assert!(!compiled.sql.contains("WHERE"));
}

#[test]
fn test_or_filter_group() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .filter(Filter::Or {
            or: vec![
                Filter::member("ProjectTrackerMaster.state", FilterOperator::Equals, vec![json!("NSW")]),
                Filter::member("ProjectTrackerMaster.year", FilterOperator::Gte, vec![json!("2020")]),
            ],
        });
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert!(compiled.sql.contains("\"project_tracker_master\".state = 'NSW'"));
    assert!(compiled.sql.contains(" OR "));
    assert!(compiled.sql.contains("\"project_tracker_master\".year >= 2020"));
    assert_parses(&compiled.sql, &PostgreSqlDialect {});
}

#[test]
fn test_contains_filter_escapes_pattern() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .filter(Filter::member(
            "ProjectTrackerMaster.state",
            FilterOperator::Contains,
            vec![json!("50%_off")],
        ));
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    assert!(compiled.sql.contains("LIKE '%50!%!_off%' ESCAPE '!'"));
}

#[test]
fn test_dimension_only_request_is_distinct() {
    let request = QueryRequest::new().dimension("ProjectTrackerMaster.state");
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert!(compiled.sql.starts_with("SELECT DISTINCT\n"));
    assert!(!compiled.sql.contains("GROUP BY"));
    assert!(compiled.sql.contains("ORDER BY \"ProjectTrackerMaster.state\" ASC"));
}

#[test]
fn test_limit_is_capped_and_offset_applied() {
    let request = QueryRequest::new()
        .measure("States.count")
        .limit(1_000_000)
        .offset(20);
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    assert!(compiled.sql.ends_with("LIMIT 50000 OFFSET 20"));

    let sqlite = compiler()
        .compile(&QueryRequest::new().measure("States.count").offset(20), Dialect::Sqlite)
        .unwrap();
    assert!(sqlite.sql.ends_with("LIMIT 10000 OFFSET 20"));
}

#[test]
fn test_explicit_order() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .dimension("ProjectTrackerMaster.state")
        .order_by("ProjectTrackerMaster.state", false)
        .order_by("ProjectTrackerMaster.count", true);
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();
    assert!(compiled.sql.contains(
        "ORDER BY \"ProjectTrackerMaster.state\" ASC, \"ProjectTrackerMaster.count\" DESC"
    ));

    let unselected = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .order_by("ProjectTrackerMaster.year", false);
    assert!(matches!(
        compiler().compile(&unselected, Dialect::Postgres),
        Err(QueryError::InvalidOrder { .. })
    ));
}

#[test]
fn test_request_errors() {
    let c = compiler();

    assert!(matches!(
        c.compile(&QueryRequest::new(), Dialect::Postgres),
        Err(QueryError::InvalidRequest(_))
    ));
    assert!(matches!(
        c.compile(&QueryRequest::new().measure("ProjectTrackerMaster.nope"), Dialect::Postgres),
        Err(QueryError::UnknownField(_))
    ));
    assert!(matches!(
        c.compile(&QueryRequest::new().measure("ProjectTrackerMaster.state"), Dialect::Postgres),
        Err(QueryError::InvalidRequest(_))
    ));

    let bad_value = QueryRequest::new()
        .measure("ProjectTrackerMaster.count")
        .filter(Filter::member("ProjectTrackerMaster.year", FilterOperator::Gt, vec![json!("soon")]));
    assert!(matches!(
        c.compile(&bad_value, Dialect::Postgres),
        Err(QueryError::InvalidFilter { .. })
    ));

    let reversed = QueryRequest::new().measure("ProjectTrackerMaster.count").time_dimension(
        "ProjectTrackerMaster.commissionedAt",
        Some(Granularity::Day),
        Some(DateRange::new(date(2024, 2, 1), date(2024, 1, 1))),
    );
    assert!(c.compile(&reversed, Dialect::Postgres).is_err());
}

#[test]
fn test_request_from_json() {
    let request: QueryRequest = serde_json::from_value(json!({
        "measures": ["ProjectTrackerMaster.totalCapacity"],
        "dimensions": ["ProjectTrackerMaster.state"],
        "filters": [
            {"member": "ProjectTrackerMaster.year", "operator": "equals", "values": ["2023", "2024"]}
        ],
        "limit": 10
    }))
    .unwrap();
    let compiled = compiler().compile(&request, Dialect::Postgres).unwrap();

    assert!(compiled.sql.contains("\"project_tracker_master\".year IN (2023, 2024)"));
    assert!(compiled.sql.ends_with("LIMIT 10"));
}

#[test]
fn test_every_dialect_compiles() {
    let request = QueryRequest::new()
        .measure("ProjectTrackerMaster.totalCapacity")
        .dimension("States.name")
        .limit(10);
    let c = compiler();

    let postgres = c.compile(&request, Dialect::Postgres).unwrap();
    assert_parses(&postgres.sql, &PostgreSqlDialect {});

    let tsql = c.compile(&request, Dialect::TSql).unwrap();
    assert!(tsql.sql.contains("[States.name]"));
    assert!(tsql.sql.contains("FROM [public].[project_tracker_master] AS [project_tracker_master]"));
    assert!(tsql.sql.ends_with("OFFSET 0 ROWS FETCH NEXT 10 ROWS ONLY"));
    assert_parses(&tsql.sql, &MsSqlDialect {});

    let mysql = c.compile(&request, Dialect::MySql).unwrap();
    assert!(mysql.sql.contains("`States.name`"));
    assert_parses(&mysql.sql, &MySqlDialect {});

    let sqlite = c.compile(&request, Dialect::Sqlite).unwrap();
    assert_parses(&sqlite.sql, &SQLiteDialect {});

    for dialect in [Dialect::DuckDb, Dialect::Snowflake] {
        let compiled = c.compile(&request, dialect).unwrap();
        assert_eq!(compiled.columns, postgres.columns);
        assert_parses(&compiled.sql, &GenericDialect {});
    }
}

const WINDOWED: &str = r#"[
    {"name": "Generation", "sql_table": "generation",
     "dimensions": [
        {"name": "unit", "sql": "unit", "type": "string"},
        {"name": "readAt", "sql": "read_at", "type": "time"}
     ],
     "measures": [
        {"name": "output", "sql": "mwh", "type": "sum"},
        {"name": "runningOutput", "sql": "SUM(${output}) OVER (ORDER BY ${readAt})", "type": "number"}
     ]}
]"#;

#[test]
fn test_windowed_measure_runs_over_grouped_base() {
    let request = QueryRequest::new()
        .measure("Generation.runningOutput")
        .time_dimension("Generation.readAt", Some(Granularity::Day), None);
    let compiled = compiler_for(WINDOWED).compile(&request, Dialect::Postgres).unwrap();
    let sql = &compiled.sql;

    assert_eq!(
        compiled.columns,
        vec!["Generation.readAt.day", "Generation.runningOutput"]
    );
    assert!(sql.contains(") AS \"base\""));
    assert!(sql.contains("SUM(\"generation\".mwh) AS \"Generation.output\""));
    assert!(sql.contains(
        "SUM(\"base\".\"Generation.output\") OVER (ORDER BY \"base\".\"Generation.readAt.day\") AS \"Generation.runningOutput\""
    ));
    assert!(sql.ends_with("ORDER BY \"Generation.readAt.day\" ASC\nLIMIT 10000"));
    assert_parses(sql, &PostgreSqlDialect {});
}

#[test]
fn test_windowed_measure_without_grouping_is_unresolvable() {
    let request = QueryRequest::new().measure("Generation.runningOutput");
    let err = compiler_for(WINDOWED)
        .compile(&request, Dialect::Postgres)
        .unwrap_err();
    assert_eq!(
        err,
        QueryError::UnresolvableMeasure {
            measure: "Generation.runningOutput".into()
        }
    );
}

#[test]
fn test_rollup_build_query_for_partition_window() {
    let c = compiler();
    let rollup = c
        .registry()
        .pre_aggregation("ProjectTrackerMaster.capacityByMonth")
        .unwrap()
        .clone();
    let start = date(2024, 1, 1).and_hms_opt(0, 0, 0).unwrap();
    let end = date(2025, 1, 1).and_hms_opt(0, 0, 0).unwrap();

    let build = c
        .compile_rollup_build(&rollup, Some((start, end)), Dialect::Sqlite)
        .unwrap();
    assert_eq!(
        build.columns,
        vec![
            "ProjectTrackerMaster.state",
            "ProjectTrackerMaster.commissionedAt.month",
            "ProjectTrackerMaster.totalCapacity",
            "ProjectTrackerMaster.count"
        ]
    );
    assert!(build.sql.contains(">= '2024-01-01'"));
    assert!(build.sql.contains("< '2025-01-01'"));
    assert!(!build.sql.contains("ORDER BY"));
    assert!(!build.sql.contains("LIMIT"));
    assert_parses(&build.sql, &SQLiteDialect {});

    let bounds = c.compile_time_bounds(&rollup, Dialect::Postgres).unwrap();
    assert!(bounds.contains("MIN(\"project_tracker_master\".commissioned_at) AS \"min_time\""));
    assert!(bounds.contains("MAX(\"project_tracker_master\".commissioned_at) AS \"max_time\""));
}
