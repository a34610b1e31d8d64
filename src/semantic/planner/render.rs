//! Template rendering.
//!
//! Turns declared templates into token streams: `${CUBE}` and `${Name}`
//! become quoted aliases, member references are inlined in parentheses, and
//! raw template text passes through untouched. Measures are wrapped in their
//! aggregate here, including conditional aggregation for measure filters.

use crate::model::{Granularity, MeasureType, Template, TemplatePart};
use crate::semantic::error::{QueryError, QueryResult, SchemaError};
use crate::semantic::registry::{
    Dimension, Entity, EntitySource, Measure, Member, MemberPath, RefTarget, SchemaRegistry, Segment,
};
use crate::sql::{
    case_when_else_null, conjunction, count, count_distinct, count_star, func, lit_int, table_col,
    Expr, TableRef, Token, TokenStream,
};

use super::{member_column, time_column};

/// Alias of the grouped result in the windowed pass.
pub const BASE_ALIAS: &str = "base";

pub struct Renderer<'r> {
    registry: &'r SchemaRegistry,
}

impl<'r> Renderer<'r> {
    pub fn new(registry: &'r SchemaRegistry) -> Self {
        Self { registry }
    }

    pub fn alias(&self, entity: &str) -> QueryResult<&'r str> {
        self.registry.alias_of(entity).ok_or_else(|| {
            QueryError::Schema(SchemaError::UndefinedEntity {
                referenced_by: "query".into(),
                entity: entity.to_string(),
            })
        })
    }

    /// FROM/JOIN item for an entity, aliased.
    pub fn source(&self, entity: &Entity) -> QueryResult<TableRef> {
        let table = match &entity.source {
            EntitySource::Table { schema, table } => TableRef::table(schema.as_deref(), table),
            EntitySource::Sql(template) => TableRef::derived(self.template(&entity.name, template)?),
        };
        Ok(table.with_alias(&entity.alias))
    }

    pub fn template(&self, owner: &str, template: &Template) -> QueryResult<TokenStream> {
        self.render(owner, template, &mut Vec::new())
    }

    fn render(
        &self,
        owner: &str,
        template: &Template,
        stack: &mut Vec<MemberPath>,
    ) -> QueryResult<TokenStream> {
        let mut ts = TokenStream::new();

        if let Some(column) = template.bare_column() {
            ts.push(Token::Ident(self.alias(owner)?.to_string()))
                .push(Token::Raw(format!(".{}", column)));
            return Ok(ts);
        }

        let location = format!("template on {}", owner);
        for part in template.parts() {
            match part {
                TemplatePart::Text(text) => {
                    ts.push(Token::Raw(text.clone()));
                }
                TemplatePart::Ref(r) => match self.registry.resolve_ref(owner, r, &location)? {
                    RefTarget::Entity(entity) => {
                        ts.push(Token::Ident(self.alias(&entity)?.to_string()));
                    }
                    RefTarget::Member(path) => {
                        let inlined = self.inline(&path, stack)?;
                        ts.lparen().append(&inlined).rparen();
                    }
                },
            }
        }
        Ok(ts)
    }

    fn inline(&self, path: &MemberPath, stack: &mut Vec<MemberPath>) -> QueryResult<TokenStream> {
        if stack.contains(path) {
            let mut cycle: Vec<String> = stack.iter().map(|p| p.to_string()).collect();
            cycle.push(path.to_string());
            return Err(SchemaError::MemberCycle(cycle).into());
        }
        stack.push(path.clone());
        let tokens = match self.registry.resolve_field(&path.entity, &path.member)? {
            Member::Dimension(d) => self.render(&d.entity, &d.template, stack)?,
            Member::Segment(s) => self.render(&s.entity, &s.template, stack)?,
            Member::Measure(m) => self.measure(m, stack)?.to_tokens(),
        };
        stack.pop();
        Ok(tokens)
    }

    pub fn dimension_expr(&self, dimension: &Dimension) -> QueryResult<Expr> {
        Ok(Expr::Fragment(self.template(&dimension.entity, &dimension.template)?))
    }

    pub fn segment_expr(&self, segment: &Segment) -> QueryResult<Expr> {
        Ok(Expr::Fragment(self.template(&segment.entity, &segment.template)?))
    }

    /// The aggregated expression of a measure.
    pub fn measure_expr(&self, measure: &Measure) -> QueryResult<Expr> {
        self.measure(measure, &mut vec![measure.path()])
    }

    fn measure(&self, measure: &Measure, stack: &mut Vec<MemberPath>) -> QueryResult<Expr> {
        let inner = measure
            .template
            .as_ref()
            .map(|t| self.render(&measure.entity, t, stack).map(Expr::Fragment))
            .transpose()?;

        let filters = measure
            .filters
            .iter()
            .map(|f| self.render(&measure.entity, f, stack).map(Expr::Fragment))
            .collect::<QueryResult<Vec<_>>>()?;
        let condition = conjunction(filters);

        let argument = |value: Expr| match &condition {
            Some(cond) => case_when_else_null(cond.clone(), value),
            None => value,
        };

        Ok(match measure.measure_type {
            MeasureType::Count => match (inner, &condition) {
                (None, None) => count_star(),
                (None, Some(_)) => count(argument(lit_int(1))),
                (Some(expr), _) => count(argument(expr)),
            },
            MeasureType::CountDistinct => count_distinct(argument(required(measure, inner)?)),
            MeasureType::Sum => func("SUM", vec![argument(required(measure, inner)?)]),
            MeasureType::Avg => func("AVG", vec![argument(required(measure, inner)?)]),
            MeasureType::Min => func("MIN", vec![argument(required(measure, inner)?)]),
            MeasureType::Max => func("MAX", vec![argument(required(measure, inner)?)]),
            MeasureType::Number => required(measure, inner)?,
        })
    }

    /// A windowed template evaluated over the grouped result `base`.
    ///
    /// Member references become `base` columns; the selected time dimension
    /// resolves to its bucket column.
    pub fn windowed_expr(
        &self,
        owner: &str,
        template: &Template,
        time: Option<(&MemberPath, Granularity)>,
    ) -> QueryResult<Expr> {
        let location = format!("windowed template on {}", owner);
        let mut ts = TokenStream::new();
        for part in template.parts() {
            match part {
                TemplatePart::Text(text) => {
                    ts.push(Token::Raw(text.clone()));
                }
                TemplatePart::Ref(r) => match self.registry.resolve_ref(owner, r, &location)? {
                    RefTarget::Entity(_) => {
                        ts.push(Token::Ident(BASE_ALIAS.into()));
                    }
                    RefTarget::Member(path) => {
                        let column = match time {
                            Some((time_path, granularity)) if *time_path == path => {
                                time_column(&path, granularity)
                            }
                            _ => member_column(&path),
                        };
                        ts.append(&table_col(BASE_ALIAS, &column).to_tokens());
                    }
                },
            }
        }
        Ok(Expr::Fragment(ts))
    }

    /// The owning entity plus every entity a member's templates reach,
    /// following inlined members.
    pub fn member_entities(&self, member: Member<'_>) -> QueryResult<Vec<String>> {
        let mut out = vec![member.entity().to_string()];
        let mut stack = vec![MemberPath::new(member.entity(), member.name())];
        for template in member.templates() {
            self.collect_entities(member.entity(), template, &mut out, &mut stack)?;
        }
        Ok(out)
    }

    fn collect_entities(
        &self,
        owner: &str,
        template: &Template,
        out: &mut Vec<String>,
        stack: &mut Vec<MemberPath>,
    ) -> QueryResult<()> {
        let location = format!("template on {}", owner);
        for r in template.references() {
            match self.registry.resolve_ref(owner, r, &location)? {
                RefTarget::Entity(entity) => {
                    if !out.contains(&entity) {
                        out.push(entity);
                    }
                }
                RefTarget::Member(path) => {
                    if stack.contains(&path) {
                        continue;
                    }
                    if !out.contains(&path.entity) {
                        out.push(path.entity.clone());
                    }
                    stack.push(path.clone());
                    let member = self.registry.resolve_field(&path.entity, &path.member)?;
                    for t in member.templates() {
                        self.collect_entities(&path.entity, t, out, stack)?;
                    }
                    stack.pop();
                }
            }
        }
        Ok(())
    }
}

fn required(measure: &Measure, inner: Option<Expr>) -> QueryResult<Expr> {
    inner.ok_or_else(|| {
        SchemaError::MissingExpression {
            entity: measure.entity.clone(),
            measure: measure.name.clone(),
        }
        .into()
    })
}
