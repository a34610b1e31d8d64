// tests/model/registry_test.rs
use prism::model::{parse_definitions, DimensionType, Granularity, MeasureType, Relationship};
use prism::semantic::{EntitySource, Member, SchemaError, SchemaRegistry};

const ENERGY: &str = include_str!("../fixtures/energy_schema.json");

fn register(text: &str) -> Result<SchemaRegistry, SchemaError> {
    SchemaRegistry::register(parse_definitions(text).unwrap())
}

#[test]
fn test_energy_fixture_loads() {
    let registry = register(ENERGY).unwrap();

    let names: Vec<&str> = registry.entities().iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["ProjectTrackerMaster", "Status", "States", "Forecasts"]);
    assert_eq!(registry.joins().count(), 2);
    assert_eq!(registry.pre_aggregations().count(), 2);

    let tracker = registry.entity("ProjectTrackerMaster").unwrap();
    assert_eq!(tracker.alias, "project_tracker_master");
    assert_eq!(tracker.primary_key().map(|d| d.name.as_str()), Some("id"));
    assert_eq!(
        tracker.source,
        EntitySource::Table {
            schema: Some("public".into()),
            table: "project_tracker_master".into()
        }
    );
}

#[test]
fn test_resolve_member_kinds() {
    let registry = register(ENERGY).unwrap();

    match registry.resolve_member("ProjectTrackerMaster.commissionedAt").unwrap() {
        Member::Dimension(d) => assert_eq!(d.dimension_type, DimensionType::Time),
        other => panic!("expected dimension, got {}", other.kind()),
    }
    match registry.resolve_member("ProjectTrackerMaster.operationalCapacity").unwrap() {
        Member::Measure(m) => {
            assert_eq!(m.measure_type, MeasureType::Sum);
            assert_eq!(m.filters.len(), 1);
        }
        other => panic!("expected measure, got {}", other.kind()),
    }
    assert!(matches!(
        registry.resolve_member("Status.reportable").unwrap(),
        Member::Segment(_)
    ));

    let err = registry.resolve_member("ProjectTrackerMaster.nope").unwrap_err();
    assert_eq!(err.field, "nope");
    assert_eq!(err.entity.as_deref(), Some("ProjectTrackerMaster"));
    assert!(registry.resolve_member("nodot").is_err());
}

#[test]
fn test_pre_aggregations_resolve_relative_members() {
    let registry = register(ENERGY).unwrap();

    let by_year = registry
        .pre_aggregation("ProjectTrackerMaster.capacityByStateYear")
        .unwrap();
    assert_eq!(by_year.qualified_name(), "ProjectTrackerMaster.capacityByStateYear");
    let dims: Vec<String> = by_year.dimensions.iter().map(|p| p.to_string()).collect();
    assert_eq!(
        dims,
        vec!["ProjectTrackerMaster.state", "ProjectTrackerMaster.year"]
    );
    assert_eq!(by_year.refresh_every, Some(std::time::Duration::from_secs(3600)));
    assert!(by_year.partition_granularity.is_none());

    let monthly = registry
        .pre_aggregation("ProjectTrackerMaster.capacityByMonth")
        .unwrap();
    assert_eq!(monthly.granularity, Some(Granularity::Month));
    assert_eq!(monthly.partition_granularity, Some(Granularity::Year));
    assert!(registry.pre_aggregation("ProjectTrackerMaster.missing").is_none());
}

#[test]
fn test_toml_definitions() {
    let registry = register(
        r#"
[[cubes]]
name = "Orders"
sql_table = "orders"

[[cubes.joins]]
name = "Customers"
relationship = "belongs_to"
sql = "${CUBE}.customer_id = ${Customers}.id"

[[cubes.dimensions]]
name = "status"
sql = "status"
type = "string"

[[cubes.measures]]
name = "count"
type = "count"

[[cubes]]
name = "Customers"
sql_table = "customers"

[[cubes.dimensions]]
name = "id"
sql = "id"
type = "number"
primary_key = true
"#,
    )
    .unwrap();

    assert_eq!(registry.entities().len(), 2);
    let join = registry.joins().next().unwrap();
    assert_eq!(join.relationship, Relationship::BelongsTo);
    assert_eq!(join.source, "Orders");
    assert_eq!(join.target, "Customers");
}

#[test]
fn test_extends_derived_members_win() {
    let registry = register(
        r#"[
            {"name": "Base", "sql_table": "projects",
             "dimensions": [
                {"name": "state", "sql": "state", "type": "string"},
                {"name": "year", "sql": "year", "type": "number"}
             ],
             "measures": [{"name": "count", "type": "count"}]},
            {"name": "Wind", "extends": "Base",
             "dimensions": [{"name": "state", "sql": "UPPER(state)", "type": "string"}],
             "segments": [{"name": "onshore", "sql": "${CUBE}.offshore = false"}]}
        ]"#,
    )
    .unwrap();

    let wind = registry.entity("Wind").unwrap();
    assert_eq!(
        wind.source,
        EntitySource::Table {
            schema: None,
            table: "projects".into()
        }
    );
    assert_eq!(wind.dimensions.len(), 2);
    assert_eq!(wind.dimension("state").unwrap().template.source(), "UPPER(state)");
    assert_eq!(wind.dimension("year").unwrap().entity, "Wind");
    assert!(wind.measure("count").is_some());
    assert!(wind.segment("onshore").is_some());
    assert!(registry.entity("Base").unwrap().segment("onshore").is_none());
}

#[test]
fn test_load_errors() {
    let duplicate = register(
        r#"[{"name": "A", "sql_table": "a"}, {"name": "A", "sql_table": "b"}]"#,
    );
    assert_eq!(duplicate.unwrap_err(), SchemaError::DuplicateEntity("A".into()));

    let cycle = register(
        r#"[{"name": "A", "extends": "B", "sql_table": "a"},
            {"name": "B", "extends": "A", "sql_table": "b"}]"#,
    );
    assert!(matches!(cycle.unwrap_err(), SchemaError::ExtendsCycle(_)));

    let undefined = register(
        r#"[{"name": "A", "sql_table": "a",
             "joins": [{"name": "Missing", "relationship": "belongsTo", "sql": "${CUBE}.id = ${Missing}.id"}]}]"#,
    );
    assert!(matches!(
        undefined.unwrap_err(),
        SchemaError::UndefinedEntity { entity, .. } if entity == "Missing"
    ));

    let bad_sql = register(
        r#"[{"name": "A", "sql_table": "a",
             "dimensions": [{"name": "x", "sql": "SUM(", "type": "number"}]}]"#,
    );
    assert!(matches!(bad_sql.unwrap_err(), SchemaError::InvalidExpression { .. }));

    let two_keys = register(
        r#"[{"name": "A", "sql_table": "a",
             "dimensions": [
                {"name": "x", "sql": "x", "type": "number", "primary_key": true},
                {"name": "y", "sql": "y", "type": "number", "primary_key": true}
             ]}]"#,
    );
    assert!(matches!(two_keys.unwrap_err(), SchemaError::MultiplePrimaryKeys { .. }));

    let no_sql = register(
        r#"[{"name": "A", "sql_table": "a", "measures": [{"name": "total", "type": "sum"}]}]"#,
    );
    assert!(matches!(no_sql.unwrap_err(), SchemaError::MissingExpression { .. }));
}

#[test]
fn test_cross_entity_dimension_rejected() {
    let err = register(
        r#"[{"name": "A", "sql_table": "a",
             "joins": [{"name": "B", "relationship": "belongsTo", "sql": "${CUBE}.b_id = ${B}.id"}],
             "dimensions": [{"name": "label", "sql": "${B.name}", "type": "string"}]},
            {"name": "B", "sql_table": "b",
             "dimensions": [{"name": "name", "sql": "name", "type": "string"}]}]"#,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        SchemaError::CrossEntityDimension { referenced, .. } if referenced == "B"
    ));
}

#[test]
fn test_measure_referencing_unreachable_entity() {
    let err = register(
        r#"[{"name": "A", "sql_table": "a",
             "measures": [{"name": "total", "sql": "${B.amount}", "type": "sum"}]},
            {"name": "B", "sql_table": "b",
             "dimensions": [{"name": "amount", "sql": "amount", "type": "number"}]}]"#,
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::UnreachableReference { .. }));
}

#[test]
fn test_member_cycle_rejected() {
    let err = register(
        r#"[{"name": "A", "sql_table": "a",
             "dimensions": [
                {"name": "x", "sql": "${y} + 1", "type": "number"},
                {"name": "y", "sql": "${x} + 1", "type": "number"}
             ]}]"#,
    )
    .unwrap_err();
    assert!(matches!(err, SchemaError::MemberCycle(_)));
}

#[test]
fn test_invalid_pre_aggregations() {
    let no_granularity = register(
        r#"[{"name": "A", "sql_table": "a",
             "dimensions": [{"name": "at", "sql": "at", "type": "time"}],
             "measures": [{"name": "count", "type": "count"}],
             "pre_aggregations": [{"name": "r", "measures": ["count"], "time_dimension": "at"}]}]"#,
    );
    assert!(matches!(
        no_granularity.unwrap_err(),
        SchemaError::InvalidPreAggregation { name, .. } if name == "r"
    ));

    let finer_partition = register(
        r#"[{"name": "A", "sql_table": "a",
             "dimensions": [{"name": "at", "sql": "at", "type": "time"}],
             "measures": [{"name": "count", "type": "count"}],
             "pre_aggregations": [{"name": "r", "measures": ["count"], "time_dimension": "at",
                                   "granularity": "month", "partition_granularity": "day"}]}]"#,
    );
    assert!(matches!(
        finer_partition.unwrap_err(),
        SchemaError::InvalidPreAggregation { .. }
    ));

    let unreachable = register(
        r#"[{"name": "A", "sql_table": "a",
             "measures": [{"name": "count", "type": "count"}],
             "pre_aggregations": [{"name": "r", "measures": ["count"], "dimensions": ["B.name"]}]},
            {"name": "B", "sql_table": "b",
             "dimensions": [{"name": "name", "sql": "name", "type": "string"}]}]"#,
    );
    assert!(matches!(
        unreachable.unwrap_err(),
        SchemaError::InvalidPreAggregation { .. }
    ));
}

#[test]
fn test_schema_hash_tracks_definitions() {
    let a = register(ENERGY).unwrap();
    let b = register(ENERGY).unwrap();
    assert_eq!(a.schema_hash(), b.schema_hash());
    assert_eq!(a.schema_hash().len(), 64);

    let edited = ENERGY.replace("\"sql\": \"capacity\", \"type\": \"avg\"", "\"sql\": \"capacity\", \"type\": \"max\"");
    assert_ne!(edited, ENERGY);
    let c = register(&edited).unwrap();
    assert_ne!(a.schema_hash(), c.schema_hash());
}
