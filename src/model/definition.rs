//! Cube definitions as loaded from JSON or TOML.
//!
//! These are the raw, unvalidated inputs. `SchemaRegistry::register` turns a
//! list of them into a validated, flattened registry.

use serde::{Deserialize, Serialize};

use super::types::{DimensionType, Granularity, MeasureFormat, MeasureType, Relationship};

/// An entity (cube): a relational source plus the members declared on it.
///
/// ```json
/// {
///   "name": "ProjectTrackerMaster",
///   "sql_table": "public.project_tracker_master",
///   "joins": [{ "name": "Status", "relationship": "belongsTo",
///               "sql": "${CUBE}.status_id = ${Status}.id" }],
///   "dimensions": [{ "name": "state", "sql": "state", "type": "string" }],
///   "measures": [{ "name": "count", "type": "count" }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CubeDef {
    pub name: String,

    /// Physical table, optionally schema-qualified (`public.statuses`).
    #[serde(default, alias = "sqlTable", skip_serializing_if = "Option::is_none")]
    pub sql_table: Option<String>,

    /// Subquery source, used instead of `sql_table`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Base entity whose members are inherited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extends: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Label of the store this entity lives in; informational.
    #[serde(default, alias = "dataSource", skip_serializing_if = "Option::is_none")]
    pub data_source: Option<String>,

    #[serde(default)]
    pub joins: Vec<JoinDef>,

    #[serde(default)]
    pub dimensions: Vec<DimensionDef>,

    #[serde(default)]
    pub measures: Vec<MeasureDef>,

    #[serde(default)]
    pub segments: Vec<SegmentDef>,

    #[serde(default, alias = "preAggregations")]
    pub pre_aggregations: Vec<PreAggregationDef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionDef {
    pub name: String,
    pub sql: String,
    #[serde(rename = "type")]
    pub dimension_type: DimensionType,
    #[serde(default, alias = "primaryKey")]
    pub primary_key: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureDef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
    #[serde(rename = "type")]
    pub measure_type: MeasureType,
    /// Row-level predicates applied by conditional aggregation.
    #[serde(default)]
    pub filters: Vec<MeasureFilterDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<MeasureFormat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeasureFilterDef {
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDef {
    pub name: String,
    pub sql: String,
}

/// A join declared on the owning entity towards `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinDef {
    /// Target entity.
    pub name: String,
    pub relationship: Relationship,
    /// ON template referencing `${CUBE}` and `${Target}`.
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreAggregationDef {
    pub name: String,

    /// Measure references: `member` on the owning entity or `Entity.member`.
    #[serde(default)]
    pub measures: Vec<String>,

    #[serde(default)]
    pub dimensions: Vec<String>,

    #[serde(default, alias = "timeDimension", skip_serializing_if = "Option::is_none")]
    pub time_dimension: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub granularity: Option<Granularity>,

    #[serde(
        default,
        alias = "partitionGranularity",
        skip_serializing_if = "Option::is_none"
    )]
    pub partition_granularity: Option<Granularity>,

    #[serde(default)]
    pub segments: Vec<String>,

    #[serde(default, alias = "refreshKey", skip_serializing_if = "Option::is_none")]
    pub refresh_key: Option<RefreshKeyDef>,
}

/// When a built rollup goes stale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshKeyDef {
    /// Interval such as `"1 hour"` or `"30s"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub every: Option<String>,
    /// Query whose scalar result invalidates the rollup when it changes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Parse a schema file: a JSON array of cubes, or a TOML document with `[[cubes]]`.
pub fn parse_definitions(text: &str) -> Result<Vec<CubeDef>, DefinitionParseError> {
    let trimmed = text.trim_start();
    let is_json = trimmed.starts_with('{')
        || (trimmed.starts_with('[') && !trimmed.starts_with("[["));
    if is_json {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum JsonSchema {
            List(Vec<CubeDef>),
            Wrapped { cubes: Vec<CubeDef> },
        }
        return Ok(match serde_json::from_str::<JsonSchema>(text)? {
            JsonSchema::List(cubes) | JsonSchema::Wrapped { cubes } => cubes,
        });
    }

    #[derive(Deserialize)]
    struct TomlSchema {
        #[serde(default)]
        cubes: Vec<CubeDef>,
    }
    Ok(toml::from_str::<TomlSchema>(text)?.cubes)
}

#[derive(Debug, thiserror::Error)]
pub enum DefinitionParseError {
    #[error("invalid JSON schema: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid TOML schema: {0}")]
    Toml(#[from] toml::de::Error),
}
