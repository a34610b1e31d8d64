//! Schema registry - validated, flattened entity definitions.
//!
//! The registry is built once from `Vec<CubeDef>` and is immutable afterwards;
//! share it as `Arc<SchemaRegistry>`. Registration runs every load-time check:
//! duplicate names, `extends` flattening, SQL template syntax, placeholder
//! resolution, cross-entity reachability, member inlining cycles and
//! pre-aggregation declarations.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::time::Duration;

use inflector::Inflector;

use super::error::{SchemaError, SchemaResult, UnknownFieldError};
use crate::cache::definitions_hash;
use crate::config::parse_duration;
use crate::model::{
    CubeDef, DimensionType, Granularity, MeasureFormat, MeasureType, PreAggregationDef,
    Relationship, Template, TemplateRef,
};

// =============================================================================
// Registered Types
// =============================================================================

/// `Entity.member`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MemberPath {
    pub entity: String,
    pub member: String,
}

impl MemberPath {
    pub fn new(entity: &str, member: &str) -> Self {
        Self {
            entity: entity.to_string(),
            member: member.to_string(),
        }
    }

    /// Parse `Entity.member`, or a bare `member` of `default_entity`.
    pub fn parse(reference: &str, default_entity: Option<&str>) -> Option<Self> {
        match reference.split_once('.') {
            Some((entity, member)) if !entity.is_empty() && !member.is_empty() => {
                Some(Self::new(entity, member))
            }
            Some(_) => None,
            None => default_entity.map(|e| Self::new(e, reference)),
        }
    }
}

impl fmt::Display for MemberPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.member)
    }
}

/// Where an entity's rows come from.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitySource {
    Table {
        schema: Option<String>,
        table: String,
    },
    Sql(Template),
}

#[derive(Debug, Clone)]
pub struct Dimension {
    pub name: String,
    pub entity: String,
    pub template: Template,
    pub dimension_type: DimensionType,
    pub primary_key: bool,
    pub title: Option<String>,
    pub format: Option<String>,
}

impl Dimension {
    pub fn path(&self) -> MemberPath {
        MemberPath::new(&self.entity, &self.name)
    }

    pub fn is_windowed(&self) -> bool {
        self.template.is_windowed()
    }
}

#[derive(Debug, Clone)]
pub struct Measure {
    pub name: String,
    pub entity: String,
    /// Absent only for `count`.
    pub template: Option<Template>,
    pub measure_type: MeasureType,
    pub filters: Vec<Template>,
    pub title: Option<String>,
    pub format: Option<MeasureFormat>,
}

impl Measure {
    pub fn path(&self) -> MemberPath {
        MemberPath::new(&self.entity, &self.name)
    }

    pub fn is_windowed(&self) -> bool {
        self.template.as_ref().is_some_and(Template::is_windowed)
    }
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub name: String,
    pub entity: String,
    pub template: Template,
}

impl Segment {
    pub fn path(&self) -> MemberPath {
        MemberPath::new(&self.entity, &self.name)
    }
}

#[derive(Debug, Clone)]
pub struct JoinDecl {
    /// Declaring entity.
    pub source: String,
    pub target: String,
    pub relationship: Relationship,
    pub template: Template,
    /// Position among all joins of the schema, in declaration order.
    pub declaration_index: usize,
}

#[derive(Debug, Clone)]
pub struct PreAggregation {
    pub name: String,
    pub entity: String,
    pub measures: Vec<MemberPath>,
    pub dimensions: Vec<MemberPath>,
    pub time_dimension: Option<MemberPath>,
    pub granularity: Option<Granularity>,
    pub partition_granularity: Option<Granularity>,
    pub segments: Vec<MemberPath>,
    pub refresh_every: Option<Duration>,
    pub refresh_sql: Option<String>,
}

impl PreAggregation {
    /// `Entity.rollup`
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.entity, self.name)
    }

    /// How long a build stays fresh. A rollup refreshed only by its key
    /// query has no interval; one with neither uses `default`.
    pub fn refresh_interval(&self, default: Option<Duration>) -> Option<Duration> {
        match (self.refresh_every, &self.refresh_sql) {
            (Some(every), _) => Some(every),
            (None, Some(_)) => None,
            (None, None) => default,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberKind {
    Dimension,
    Measure,
    Segment,
}

/// A resolved member of any kind.
#[derive(Debug, Clone, Copy)]
pub enum Member<'a> {
    Dimension(&'a Dimension),
    Measure(&'a Measure),
    Segment(&'a Segment),
}

impl<'a> Member<'a> {
    pub fn name(&self) -> &'a str {
        match self {
            Member::Dimension(d) => &d.name,
            Member::Measure(m) => &m.name,
            Member::Segment(s) => &s.name,
        }
    }

    pub fn entity(&self) -> &'a str {
        match self {
            Member::Dimension(d) => &d.entity,
            Member::Measure(m) => &m.entity,
            Member::Segment(s) => &s.entity,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Member::Dimension(_) => "dimension",
            Member::Measure(_) => "measure",
            Member::Segment(_) => "segment",
        }
    }

    /// Every template this member compiles from.
    pub fn templates(&self) -> Vec<&'a Template> {
        match self {
            Member::Dimension(d) => vec![&d.template],
            Member::Measure(m) => m.template.iter().chain(m.filters.iter()).collect(),
            Member::Segment(s) => vec![&s.template],
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entity {
    pub name: String,
    /// Compiled table alias: snake_case of the name.
    pub alias: String,
    pub source: EntitySource,
    pub title: Option<String>,
    pub description: Option<String>,
    pub data_source: Option<String>,
    pub dimensions: Vec<Dimension>,
    pub measures: Vec<Measure>,
    pub segments: Vec<Segment>,
    pub joins: Vec<JoinDecl>,
    pub pre_aggregations: Vec<PreAggregation>,
    members: HashMap<String, (MemberKind, usize)>,
}

impl Entity {
    pub fn member(&self, name: &str) -> Option<Member<'_>> {
        let &(kind, idx) = self.members.get(name)?;
        Some(match kind {
            MemberKind::Dimension => Member::Dimension(&self.dimensions[idx]),
            MemberKind::Measure => Member::Measure(&self.measures[idx]),
            MemberKind::Segment => Member::Segment(&self.segments[idx]),
        })
    }

    pub fn dimension(&self, name: &str) -> Option<&Dimension> {
        match self.member(name)? {
            Member::Dimension(d) => Some(d),
            _ => None,
        }
    }

    pub fn measure(&self, name: &str) -> Option<&Measure> {
        match self.member(name)? {
            Member::Measure(m) => Some(m),
            _ => None,
        }
    }

    pub fn segment(&self, name: &str) -> Option<&Segment> {
        match self.member(name)? {
            Member::Segment(s) => Some(s),
            _ => None,
        }
    }

    pub fn primary_key(&self) -> Option<&Dimension> {
        self.dimensions.iter().find(|d| d.primary_key)
    }

    /// Display metadata: the entity's title and description, then one
    /// indented line per member with a title or format.
    pub fn outline(&self) -> Vec<String> {
        let mut head = self.name.clone();
        if let Some(title) = &self.title {
            head.push_str(&format!(" \"{}\"", title));
        }
        if let Some(description) = &self.description {
            head.push_str(&format!(": {}", description));
        }

        let dimensions = self
            .dimensions
            .iter()
            .filter_map(|d| outline_member(&d.name, d.title.as_deref(), d.format.as_deref()));
        let measures = self.measures.iter().filter_map(|m| {
            outline_member(&m.name, m.title.as_deref(), m.format.map(|f| f.as_str()))
        });
        std::iter::once(head).chain(dimensions).chain(measures).collect()
    }
}

fn outline_member(name: &str, title: Option<&str>, format: Option<&str>) -> Option<String> {
    if title.is_none() && format.is_none() {
        return None;
    }
    let mut line = format!("  {}", name);
    if let Some(title) = title {
        line.push_str(&format!(" \"{}\"", title));
    }
    if let Some(format) = format {
        line.push_str(&format!(" [{}]", format));
    }
    Some(line)
}

/// What a template placeholder points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// An entity alias.
    Entity(String),
    /// A member to inline.
    Member(MemberPath),
}

// =============================================================================
// Registry
// =============================================================================

/// Validated entity definitions, indexed by name, in declaration order.
#[derive(Debug, Clone)]
pub struct SchemaRegistry {
    entities: Vec<Entity>,
    by_name: HashMap<String, usize>,
    schema_hash: String,
}

impl SchemaRegistry {
    /// Validate and index a list of definitions.
    pub fn register(defs: Vec<CubeDef>) -> SchemaResult<Self> {
        let schema_hash = definitions_hash(&defs).map_err(|e| SchemaError::Hash(e.to_string()))?;

        let mut by_name = HashMap::with_capacity(defs.len());
        let mut aliases = HashSet::with_capacity(defs.len());
        for (idx, def) in defs.iter().enumerate() {
            if by_name.insert(def.name.clone(), idx).is_some()
                || !aliases.insert(def.name.to_snake_case())
            {
                return Err(SchemaError::DuplicateEntity(def.name.clone()));
            }
            check_declared_names(def)?;
        }

        let flattened = flatten_extends(&defs, &by_name)?;

        let mut join_counter = 0;
        let entities = flattened
            .iter()
            .map(|def| build_entity(def, &by_name, &mut join_counter))
            .collect::<SchemaResult<Vec<_>>>()?;

        let mut registry = Self {
            entities,
            by_name,
            schema_hash,
        };

        registry.validate_references()?;
        registry.validate_member_cycles()?;

        let pre_aggregations = flattened
            .iter()
            .map(|def| {
                def.pre_aggregations
                    .iter()
                    .map(|p| registry.resolve_pre_aggregation(&def.name, p))
                    .collect::<SchemaResult<Vec<_>>>()
            })
            .collect::<SchemaResult<Vec<_>>>()?;
        for (entity, rollups) in registry.entities.iter_mut().zip(pre_aggregations) {
            entity.pre_aggregations = rollups;
        }

        Ok(registry)
    }

    /// Entities in declaration order.
    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn entity(&self, name: &str) -> Option<&Entity> {
        self.by_name.get(name).map(|&idx| &self.entities[idx])
    }

    /// Declaration position of an entity.
    pub fn entity_index(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn alias_of(&self, name: &str) -> Option<&str> {
        self.entity(name).map(|e| e.alias.as_str())
    }

    /// Content hash of the definitions this registry was built from.
    pub fn schema_hash(&self) -> &str {
        &self.schema_hash
    }

    /// Look up a dimension, measure or segment by entity and name.
    pub fn resolve_field(&self, entity: &str, field: &str) -> Result<Member<'_>, UnknownFieldError> {
        let unknown = || UnknownFieldError {
            entity: Some(entity.to_string()),
            field: field.to_string(),
        };
        self.entity(entity).ok_or_else(unknown)?.member(field).ok_or_else(unknown)
    }

    /// Look up a member by its `Entity.member` path.
    pub fn resolve_member(&self, path: &str) -> Result<Member<'_>, UnknownFieldError> {
        let parsed = MemberPath::parse(path, None).ok_or_else(|| UnknownFieldError {
            entity: None,
            field: path.to_string(),
        })?;
        self.resolve_field(&parsed.entity, &parsed.member)
    }

    /// Rollups in declaration order: entity order, then rollup order.
    pub fn pre_aggregations(&self) -> impl Iterator<Item = &PreAggregation> {
        self.entities.iter().flat_map(|e| e.pre_aggregations.iter())
    }

    /// Find a rollup by `Entity.rollup`.
    pub fn pre_aggregation(&self, qualified: &str) -> Option<&PreAggregation> {
        let (entity, name) = qualified.split_once('.')?;
        self.entity(entity)?
            .pre_aggregations
            .iter()
            .find(|p| p.name == name)
    }

    /// All joins in declaration order.
    pub fn joins(&self) -> impl Iterator<Item = &JoinDecl> {
        self.entities.iter().flat_map(|e| e.joins.iter())
    }

    /// Classify a placeholder inside a template owned by `owner`.
    pub fn resolve_ref(
        &self,
        owner: &str,
        reference: &TemplateRef,
        location: &str,
    ) -> SchemaResult<RefTarget> {
        let owner_entity = self.entity(owner).ok_or_else(|| SchemaError::UndefinedEntity {
            referenced_by: location.to_string(),
            entity: owner.to_string(),
        })?;

        match reference {
            TemplateRef::Cube => Ok(RefTarget::Entity(owner.to_string())),
            TemplateRef::Name(name) => {
                if self.by_name.contains_key(name) {
                    Ok(RefTarget::Entity(name.clone()))
                } else if owner_entity.member(name).is_some() {
                    Ok(RefTarget::Member(MemberPath::new(owner, name)))
                } else if name.starts_with(|c: char| c.is_ascii_uppercase()) {
                    Err(SchemaError::UndefinedEntity {
                        referenced_by: location.to_string(),
                        entity: name.clone(),
                    })
                } else {
                    Err(SchemaError::UnknownMember {
                        location: location.to_string(),
                        member: name.clone(),
                    })
                }
            }
            TemplateRef::Qualified { entity, member } => {
                let entity_name = entity.as_deref().unwrap_or(owner);
                let target = self.entity(entity_name).ok_or_else(|| SchemaError::UndefinedEntity {
                    referenced_by: location.to_string(),
                    entity: entity_name.to_string(),
                })?;
                if target.member(member).is_none() {
                    return Err(SchemaError::UnknownMember {
                        location: location.to_string(),
                        member: format!("{}.{}", entity_name, member),
                    });
                }
                Ok(RefTarget::Member(MemberPath::new(entity_name, member)))
            }
        }
    }

    /// Entity names reachable from `from` through declared joins, in either direction.
    pub fn reachable_from(&self, from: &str) -> HashSet<String> {
        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for join in self.joins() {
            adjacency.entry(&join.source).or_default().push(&join.target);
            adjacency.entry(&join.target).or_default().push(&join.source);
        }

        let mut seen = HashSet::from([from.to_string()]);
        let mut queue = VecDeque::from([from]);
        while let Some(current) = queue.pop_front() {
            for &next in adjacency.get(current).into_iter().flatten() {
                if seen.insert(next.to_string()) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    // =========================================================================
    // Validation passes
    // =========================================================================

    fn validate_references(&self) -> SchemaResult<()> {
        for entity in &self.entities {
            let reachable = self.reachable_from(&entity.name);

            for dim in &entity.dimensions {
                let location = format!("dimension {}.{}", entity.name, dim.name);
                for r in dim.template.references() {
                    let referenced = match self.resolve_ref(&entity.name, r, &location)? {
                        RefTarget::Entity(name) => name,
                        RefTarget::Member(path) => path.entity,
                    };
                    if referenced != entity.name {
                        return Err(SchemaError::CrossEntityDimension {
                            entity: entity.name.clone(),
                            dimension: dim.name.clone(),
                            referenced,
                        });
                    }
                }
            }

            let scoped = entity
                .measures
                .iter()
                .map(|m| (format!("measure {}.{}", entity.name, m.name), Member::Measure(m)))
                .chain(entity.segments.iter().map(|s| {
                    (format!("segment {}.{}", entity.name, s.name), Member::Segment(s))
                }));
            for (location, member) in scoped {
                for template in member.templates() {
                    for r in template.references() {
                        let referenced = match self.resolve_ref(&entity.name, r, &location)? {
                            RefTarget::Entity(name) => name,
                            RefTarget::Member(path) => path.entity,
                        };
                        if !reachable.contains(&referenced) {
                            return Err(SchemaError::UnreachableReference {
                                location,
                                entity: referenced,
                            });
                        }
                    }
                }
            }

            for join in &entity.joins {
                let location = format!("join {} -> {}", join.source, join.target);
                for r in join.template.references() {
                    self.resolve_ref(&entity.name, r, &location)?;
                }
            }
        }
        Ok(())
    }

    /// Member inlining must be acyclic.
    fn validate_member_cycles(&self) -> SchemaResult<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        fn visit(
            registry: &SchemaRegistry,
            path: MemberPath,
            marks: &mut HashMap<MemberPath, Mark>,
            stack: &mut Vec<MemberPath>,
        ) -> SchemaResult<()> {
            match marks.get(&path) {
                Some(Mark::Done) => return Ok(()),
                Some(Mark::Visiting) => {
                    let start = stack.iter().position(|p| *p == path).unwrap_or(0);
                    let mut cycle: Vec<String> = stack[start..].iter().map(|p| p.to_string()).collect();
                    cycle.push(path.to_string());
                    return Err(SchemaError::MemberCycle(cycle));
                }
                None => {}
            }

            marks.insert(path.clone(), Mark::Visiting);
            stack.push(path.clone());

            if let Ok(member) = registry.resolve_field(&path.entity, &path.member) {
                let location = path.to_string();
                for template in member.templates() {
                    for r in template.references() {
                        if let RefTarget::Member(next) =
                            registry.resolve_ref(&path.entity, r, &location)?
                        {
                            visit(registry, next, marks, stack)?;
                        }
                    }
                }
            }

            stack.pop();
            marks.insert(path, Mark::Done);
            Ok(())
        }

        let mut marks = HashMap::new();
        for entity in &self.entities {
            let paths = entity
                .dimensions
                .iter()
                .map(Dimension::path)
                .chain(entity.measures.iter().map(Measure::path))
                .chain(entity.segments.iter().map(Segment::path));
            for path in paths {
                visit(self, path, &mut marks, &mut Vec::new())?;
            }
        }
        Ok(())
    }

    fn resolve_pre_aggregation(
        &self,
        entity: &str,
        def: &PreAggregationDef,
    ) -> SchemaResult<PreAggregation> {
        let invalid = |message: String| SchemaError::InvalidPreAggregation {
            entity: entity.to_string(),
            name: def.name.clone(),
            message,
        };
        let reachable = self.reachable_from(entity);

        let resolve = |reference: &str, expected: MemberKind| -> SchemaResult<MemberPath> {
            let path = MemberPath::parse(reference, Some(entity))
                .ok_or_else(|| invalid(format!("malformed member reference '{}'", reference)))?;
            if !reachable.contains(&path.entity) {
                return Err(invalid(format!(
                    "'{}' is not reachable from {} through declared joins",
                    path, entity
                )));
            }
            let member = self
                .resolve_field(&path.entity, &path.member)
                .map_err(|_| invalid(format!("unknown member '{}'", path)))?;
            let (kind, windowed) = match member {
                Member::Dimension(d) => (MemberKind::Dimension, d.is_windowed()),
                Member::Measure(m) => (MemberKind::Measure, m.is_windowed()),
                Member::Segment(_) => (MemberKind::Segment, false),
            };
            if kind != expected {
                return Err(invalid(format!("'{}' is a {}", path, member.kind())));
            }
            if windowed {
                return Err(invalid(format!("windowed member '{}' cannot be pre-aggregated", path)));
            }
            Ok(path)
        };

        let measures = def
            .measures
            .iter()
            .map(|m| resolve(m, MemberKind::Measure))
            .collect::<SchemaResult<Vec<_>>>()?;
        let dimensions = def
            .dimensions
            .iter()
            .map(|d| resolve(d, MemberKind::Dimension))
            .collect::<SchemaResult<Vec<_>>>()?;
        let segments = def
            .segments
            .iter()
            .map(|s| resolve(s, MemberKind::Segment))
            .collect::<SchemaResult<Vec<_>>>()?;

        let time_dimension = def
            .time_dimension
            .as_deref()
            .map(|t| resolve(t, MemberKind::Dimension))
            .transpose()?;
        if let Some(path) = &time_dimension {
            let is_time = self
                .entity(&path.entity)
                .and_then(|e| e.dimension(&path.member))
                .is_some_and(|d| d.dimension_type == DimensionType::Time);
            if !is_time {
                return Err(invalid(format!("time dimension '{}' is not of type time", path)));
            }
        }

        match (&time_dimension, def.granularity) {
            (Some(_), None) => return Err(invalid("time dimension without granularity".into())),
            (None, Some(_)) => return Err(invalid("granularity without time dimension".into())),
            _ => {}
        }

        if let Some(partition) = def.partition_granularity {
            let Some(granularity) = def.granularity else {
                return Err(invalid(
                    "partition granularity requires a time dimension".into(),
                ));
            };
            if partition < granularity {
                return Err(invalid(format!(
                    "partition granularity '{}' is finer than granularity '{}'",
                    partition, granularity
                )));
            }
            if partition == Granularity::Hour {
                return Err(invalid("partitions must be at least a day wide".into()));
            }
        }

        let refresh_every = def
            .refresh_key
            .as_ref()
            .and_then(|k| k.every.as_deref())
            .map(|every| {
                parse_duration(every)
                    .map_err(|_| invalid(format!("unparseable refresh interval '{}'", every)))
            })
            .transpose()?;
        let refresh_sql = def.refresh_key.as_ref().and_then(|k| k.sql.clone());
        if let Some(sql) = &refresh_sql {
            Template::parse(sql)
                .validate_query()
                .map_err(|e| invalid(format!("refresh key sql: {}", e)))?;
        }

        Ok(PreAggregation {
            name: def.name.clone(),
            entity: entity.to_string(),
            measures,
            dimensions,
            time_dimension,
            granularity: def.granularity,
            partition_granularity: def.partition_granularity,
            segments,
            refresh_every,
            refresh_sql,
        })
    }
}

// =============================================================================
// Registration helpers
// =============================================================================

/// Member and rollup names must be unique within one declaration.
fn check_declared_names(def: &CubeDef) -> SchemaResult<()> {
    let mut seen = HashSet::new();
    let names = def
        .dimensions
        .iter()
        .map(|d| &d.name)
        .chain(def.measures.iter().map(|m| &m.name))
        .chain(def.segments.iter().map(|s| &s.name));
    for name in names {
        if !seen.insert(name.as_str()) {
            return Err(SchemaError::DuplicateMember {
                entity: def.name.clone(),
                member: name.clone(),
            });
        }
    }

    let mut rollups = HashSet::new();
    for rollup in &def.pre_aggregations {
        if !rollups.insert(rollup.name.as_str()) {
            return Err(SchemaError::InvalidPreAggregation {
                entity: def.name.clone(),
                name: rollup.name.clone(),
                message: "declared more than once".into(),
            });
        }
    }
    Ok(())
}

/// Resolve `extends` chains, base first, so derived members override by name.
fn flatten_extends(
    defs: &[CubeDef],
    by_name: &HashMap<String, usize>,
) -> SchemaResult<Vec<CubeDef>> {
    fn flatten_one(
        idx: usize,
        defs: &[CubeDef],
        by_name: &HashMap<String, usize>,
        resolved: &mut [Option<CubeDef>],
        stack: &mut Vec<usize>,
    ) -> SchemaResult<()> {
        if resolved[idx].is_some() {
            return Ok(());
        }
        if let Some(pos) = stack.iter().position(|&s| s == idx) {
            let mut cycle: Vec<String> = stack[pos..].iter().map(|&s| defs[s].name.clone()).collect();
            cycle.push(defs[idx].name.clone());
            return Err(SchemaError::ExtendsCycle(cycle));
        }

        let def = &defs[idx];
        let merged = match &def.extends {
            None => def.clone(),
            Some(base) => {
                let &base_idx = by_name.get(base).ok_or_else(|| SchemaError::UndefinedEntity {
                    referenced_by: format!("entity '{}' (extends)", def.name),
                    entity: base.clone(),
                })?;
                stack.push(idx);
                flatten_one(base_idx, defs, by_name, resolved, stack)?;
                stack.pop();
                let base_def = resolved[base_idx].as_ref().ok_or_else(|| {
                    SchemaError::ExtendsCycle(vec![def.name.clone(), base.clone()])
                })?;
                merge_extends(base_def, def)
            }
        };
        resolved[idx] = Some(merged);
        Ok(())
    }

    let mut resolved = vec![None; defs.len()];
    for idx in 0..defs.len() {
        flatten_one(idx, defs, by_name, &mut resolved, &mut Vec::new())?;
    }
    Ok(resolved.into_iter().flatten().collect())
}

fn merge_by_name<T: Clone>(base: &[T], own: &[T], key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut merged = base.to_vec();
    for item in own {
        match merged.iter().position(|b| key(b) == key(item)) {
            Some(pos) => merged[pos] = item.clone(),
            None => merged.push(item.clone()),
        }
    }
    merged
}

fn merge_extends(base: &CubeDef, derived: &CubeDef) -> CubeDef {
    let own_source = derived.sql_table.is_some() || derived.sql.is_some();
    CubeDef {
        name: derived.name.clone(),
        sql_table: if own_source {
            derived.sql_table.clone()
        } else {
            base.sql_table.clone()
        },
        sql: if own_source {
            derived.sql.clone()
        } else {
            base.sql.clone()
        },
        extends: derived.extends.clone(),
        title: derived.title.clone().or_else(|| base.title.clone()),
        description: derived.description.clone().or_else(|| base.description.clone()),
        data_source: derived.data_source.clone().or_else(|| base.data_source.clone()),
        joins: merge_by_name(&base.joins, &derived.joins, |j| &j.name),
        dimensions: merge_by_name(&base.dimensions, &derived.dimensions, |d| &d.name),
        measures: merge_by_name(&base.measures, &derived.measures, |m| &m.name),
        segments: merge_by_name(&base.segments, &derived.segments, |s| &s.name),
        pre_aggregations: merge_by_name(&base.pre_aggregations, &derived.pre_aggregations, |p| {
            &p.name
        }),
    }
}

fn parse_expression(text: &str, location: impl FnOnce() -> String) -> SchemaResult<Template> {
    let template = Template::parse(text);
    template
        .validate_expression()
        .map_err(|message| SchemaError::InvalidExpression {
            location: location(),
            message,
        })?;
    Ok(template)
}

fn build_entity(
    def: &CubeDef,
    by_name: &HashMap<String, usize>,
    join_counter: &mut usize,
) -> SchemaResult<Entity> {
    let invalid_source = |message: &str| SchemaError::InvalidSource {
        entity: def.name.clone(),
        message: message.to_string(),
    };
    let source = match (&def.sql_table, &def.sql) {
        (Some(table), None) => {
            let parts: Vec<&str> = table.split('.').collect();
            match parts.as_slice() {
                [table] if !table.is_empty() => EntitySource::Table {
                    schema: None,
                    table: table.to_string(),
                },
                [schema, table] if !schema.is_empty() && !table.is_empty() => {
                    EntitySource::Table {
                        schema: Some(schema.to_string()),
                        table: table.to_string(),
                    }
                }
                _ => return Err(invalid_source("sql_table must be 'table' or 'schema.table'")),
            }
        }
        (None, Some(sql)) => {
            let template = Template::parse(sql);
            template.validate_query().map_err(|message| SchemaError::InvalidExpression {
                location: format!("source of entity {}", def.name),
                message,
            })?;
            EntitySource::Sql(template)
        }
        (Some(_), Some(_)) => return Err(invalid_source("declares both sql_table and sql")),
        (None, None) => return Err(invalid_source("declares neither sql_table nor sql")),
    };

    let mut members = HashMap::new();
    let mut register_member = |name: &str, kind: MemberKind, idx: usize| {
        if members.insert(name.to_string(), (kind, idx)).is_some() {
            return Err(SchemaError::DuplicateMember {
                entity: def.name.clone(),
                member: name.to_string(),
            });
        }
        Ok(())
    };

    let mut dimensions = Vec::with_capacity(def.dimensions.len());
    for (idx, d) in def.dimensions.iter().enumerate() {
        register_member(&d.name, MemberKind::Dimension, idx)?;
        let template = parse_expression(&d.sql, || format!("dimension {}.{}", def.name, d.name))?;
        dimensions.push(Dimension {
            name: d.name.clone(),
            entity: def.name.clone(),
            template,
            dimension_type: d.dimension_type,
            primary_key: d.primary_key,
            title: d.title.clone(),
            format: d.format.clone(),
        });
    }

    let mut measures = Vec::with_capacity(def.measures.len());
    for (idx, m) in def.measures.iter().enumerate() {
        register_member(&m.name, MemberKind::Measure, idx)?;
        if m.sql.is_none() && m.measure_type != MeasureType::Count {
            return Err(SchemaError::MissingExpression {
                entity: def.name.clone(),
                measure: m.name.clone(),
            });
        }
        if m.measure_type == MeasureType::Number && !m.filters.is_empty() {
            return Err(SchemaError::FilterOnRawMeasure {
                entity: def.name.clone(),
                measure: m.name.clone(),
            });
        }
        let template = m
            .sql
            .as_deref()
            .map(|sql| parse_expression(sql, || format!("measure {}.{}", def.name, m.name)))
            .transpose()?;
        let filters = m
            .filters
            .iter()
            .map(|f| parse_expression(&f.sql, || format!("filter of measure {}.{}", def.name, m.name)))
            .collect::<SchemaResult<Vec<_>>>()?;
        measures.push(Measure {
            name: m.name.clone(),
            entity: def.name.clone(),
            template,
            measure_type: m.measure_type,
            filters,
            title: m.title.clone(),
            format: m.format,
        });
    }

    let mut segments = Vec::with_capacity(def.segments.len());
    for (idx, s) in def.segments.iter().enumerate() {
        register_member(&s.name, MemberKind::Segment, idx)?;
        let template = parse_expression(&s.sql, || format!("segment {}.{}", def.name, s.name))?;
        segments.push(Segment {
            name: s.name.clone(),
            entity: def.name.clone(),
            template,
        });
    }

    let primary_keys: Vec<String> = dimensions
        .iter()
        .filter(|d| d.primary_key)
        .map(|d| d.name.clone())
        .collect();
    if primary_keys.len() > 1 {
        return Err(SchemaError::MultiplePrimaryKeys {
            entity: def.name.clone(),
            members: primary_keys,
        });
    }

    let mut joins = Vec::with_capacity(def.joins.len());
    for j in &def.joins {
        if !by_name.contains_key(&j.name) {
            return Err(SchemaError::UndefinedEntity {
                referenced_by: format!("join on entity '{}'", def.name),
                entity: j.name.clone(),
            });
        }
        let template = parse_expression(&j.sql, || format!("join {} -> {}", def.name, j.name))?;
        joins.push(JoinDecl {
            source: def.name.clone(),
            target: j.name.clone(),
            relationship: j.relationship,
            template,
            declaration_index: *join_counter,
        });
        *join_counter += 1;
    }

    Ok(Entity {
        name: def.name.clone(),
        alias: def.name.to_snake_case(),
        source,
        title: def.title.clone(),
        description: def.description.clone(),
        data_source: def.data_source.clone(),
        dimensions,
        measures,
        segments,
        joins,
        pre_aggregations: Vec::new(),
        members,
    })
}
