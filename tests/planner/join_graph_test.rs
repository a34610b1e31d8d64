// tests/planner/join_graph_test.rs
use std::collections::HashMap;

use prism::model::parse_definitions;
use prism::semantic::{JoinGraph, SchemaRegistry};

const ENERGY: &str = include_str!("../fixtures/energy_schema.json");

fn graph(text: &str) -> JoinGraph {
    let registry = SchemaRegistry::register(parse_definitions(text).unwrap()).unwrap();
    JoinGraph::build(&registry)
}

fn names(required: &[&str]) -> Vec<String> {
    required.iter().map(|s| s.to_string()).collect()
}

#[test]
fn test_graph_has_node_per_entity_and_edge_per_join() {
    let g = graph(ENERGY);
    assert_eq!(g.node_count(), 4);
    assert_eq!(g.edge_count(), 2);
}

#[test]
fn test_fact_to_reference_joins_do_not_fan_out() {
    let g = graph(ENERGY);
    let counts = HashMap::from([("ProjectTrackerMaster".to_string(), 2)]);
    let tree = g
        .resolve(&names(&["ProjectTrackerMaster", "Status", "States"]), &counts)
        .unwrap();

    assert_eq!(tree.root, "ProjectTrackerMaster");
    let joined: Vec<_> = tree.entities().collect();
    assert_eq!(joined, vec!["ProjectTrackerMaster", "Status", "States"]);
    assert!(tree.steps.iter().all(|s| s.forward));
    assert!(!tree.has_fan_out());
}

#[test]
fn test_path_between_references_goes_through_fact() {
    let g = graph(ENERGY);
    let tree = g
        .resolve(&names(&["States", "Status"]), &HashMap::new())
        .unwrap();

    // Status is declared first, so it roots the tree on a tie.
    assert_eq!(tree.root, "Status");
    let joined: Vec<_> = tree.entities().collect();
    assert_eq!(joined, vec!["Status", "ProjectTrackerMaster", "States"]);

    // Status <- ProjectTrackerMaster walks a belongsTo backwards.
    assert!(!tree.steps[0].forward);
    assert!(tree.steps[0].fan_out);
    assert!(tree.steps[1].forward);
    assert!(!tree.steps[1].fan_out);
}

#[test]
fn test_single_entity_needs_no_joins() {
    let g = graph(ENERGY);
    let tree = g.resolve(&names(&["States"]), &HashMap::new()).unwrap();
    assert_eq!(tree.root, "States");
    assert!(tree.steps.is_empty());
    assert!(tree.contains("States"));
    assert!(!tree.contains("Status"));
}

#[test]
fn test_unreachable_entity_is_an_error() {
    let g = graph(ENERGY);
    let counts = HashMap::from([("ProjectTrackerMaster".to_string(), 1)]);
    let err = g
        .resolve(&names(&["ProjectTrackerMaster", "Forecasts"]), &counts)
        .unwrap_err();
    assert_eq!(err.root, "ProjectTrackerMaster");
    assert_eq!(err.entity, "Forecasts");
    assert!(err.to_string().contains("not reachable"));
}

#[test]
fn test_cyclic_joins_take_the_shortest_path() {
    let g = graph(
        r#"[
            {"name": "Projects", "sql_table": "projects",
             "joins": [{"name": "Owners", "relationship": "belongsTo", "sql": "${CUBE}.owner_id = ${Owners}.id"}]},
            {"name": "Owners", "sql_table": "owners",
             "joins": [{"name": "Regions", "relationship": "belongsTo", "sql": "${CUBE}.region_id = ${Regions}.id"}]},
            {"name": "Regions", "sql_table": "regions",
             "joins": [{"name": "Projects", "relationship": "hasMany", "sql": "${CUBE}.id = ${Projects}.region_id"}]}
        ]"#,
    );
    assert_eq!(g.edge_count(), 3);

    let counts = HashMap::from([("Projects".to_string(), 1)]);
    let tree = g.resolve(&names(&["Projects", "Regions"]), &counts).unwrap();
    assert_eq!(tree.root, "Projects");
    assert_eq!(tree.steps.len(), 1);
    assert_eq!(tree.steps[0].to, "Regions");
    // Regions hasMany Projects, walked from the many side.
    assert!(!tree.steps[0].forward);
    assert!(!tree.steps[0].fan_out);
}

#[test]
fn test_has_many_forward_fans_out() {
    let g = graph(
        r#"[
            {"name": "Sites", "sql_table": "sites",
             "joins": [{"name": "Turbines", "relationship": "hasMany", "sql": "${CUBE}.id = ${Turbines}.site_id"}]},
            {"name": "Turbines", "sql_table": "turbines"}
        ]"#,
    );
    let counts = HashMap::from([("Sites".to_string(), 1)]);
    let tree = g.resolve(&names(&["Sites", "Turbines"]), &counts).unwrap();
    assert!(tree.steps[0].forward);
    assert!(tree.has_fan_out());
}

#[test]
fn test_self_join_is_ignored_for_paths() {
    let g = graph(
        r#"[
            {"name": "Employees", "sql_table": "employees",
             "joins": [{"name": "Employees", "relationship": "belongsTo", "sql": "${CUBE}.manager_id = ${Employees}.id"}]}
        ]"#,
    );
    assert_eq!(g.edge_count(), 1);
    let tree = g.resolve(&names(&["Employees"]), &HashMap::new()).unwrap();
    assert!(tree.steps.is_empty());
}

#[test]
fn test_nothing_required_yields_empty_tree() {
    let g = graph(ENERGY);
    let tree = g.resolve(&[], &HashMap::new()).unwrap();
    assert!(tree.root.is_empty());
    assert!(tree.steps.is_empty());
}
