//! Semantic schema model: declared cubes, their members and SQL templates.

pub mod definition;
pub mod template;
pub mod types;

pub use definition::{
    parse_definitions, CubeDef, DefinitionParseError, DimensionDef, JoinDef, MeasureDef,
    MeasureFilterDef, PreAggregationDef, RefreshKeyDef, SegmentDef,
};
pub use template::{Template, TemplatePart, TemplateRef};
pub use types::{DimensionType, Granularity, MeasureFormat, MeasureType, Relationship};
