//! SQL templates with `${...}` placeholders.
//!
//! A template is declared expression text. Placeholders are split out at load
//! time so the compiler can substitute dialect-quoted aliases and inline other
//! members without re-scanning strings.

use std::sync::LazyLock;

use regex::Regex;
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;

static PLACEHOLDER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?:\.([A-Za-z_][A-Za-z0-9_]*))?\}|\{CUBE\}").unwrap()
});

static BARE_IDENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

static WINDOW_CALL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bOVER\s*\(").unwrap());

/// The self-reference keyword.
pub const CUBE: &str = "CUBE";

/// A placeholder reference inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplateRef {
    /// `${CUBE}` or `{CUBE}`
    Cube,
    /// `${Name}`: an entity alias when `Name` is a registered entity,
    /// otherwise a member of the owning entity.
    Name(String),
    /// `${CUBE.member}` (entity `None`) or `${Name.member}`
    Qualified {
        entity: Option<String>,
        member: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    Text(String),
    Ref(TemplateRef),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    parts: Vec<TemplatePart>,
}

impl Template {
    pub fn parse(text: &str) -> Self {
        let mut parts = Vec::new();
        let mut last = 0;

        for caps in PLACEHOLDER.captures_iter(text) {
            let Some(whole) = caps.get(0) else { continue };
            if whole.start() > last {
                parts.push(TemplatePart::Text(text[last..whole.start()].to_string()));
            }
            let reference = match (caps.get(1), caps.get(2)) {
                (None, _) => TemplateRef::Cube,
                (Some(head), None) if head.as_str() == CUBE => TemplateRef::Cube,
                (Some(head), None) => TemplateRef::Name(head.as_str().to_string()),
                (Some(head), Some(member)) => TemplateRef::Qualified {
                    entity: (head.as_str() != CUBE).then(|| head.as_str().to_string()),
                    member: member.as_str().to_string(),
                },
            };
            parts.push(TemplatePart::Ref(reference));
            last = whole.end();
        }
        if last < text.len() {
            parts.push(TemplatePart::Text(text[last..].to_string()));
        }

        Self {
            source: text.to_string(),
            parts,
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn parts(&self) -> &[TemplatePart] {
        &self.parts
    }

    pub fn references(&self) -> impl Iterator<Item = &TemplateRef> {
        self.parts.iter().filter_map(|p| match p {
            TemplatePart::Ref(r) => Some(r),
            TemplatePart::Text(_) => None,
        })
    }

    /// The column name when the whole template is a single bare identifier.
    pub fn bare_column(&self) -> Option<&str> {
        let text = self.source.trim();
        let keyword = matches!(
            text.to_ascii_lowercase().as_str(),
            "null" | "true" | "false" | "current_date" | "current_timestamp"
        );
        (BARE_IDENT.is_match(text) && !keyword).then_some(text)
    }

    /// Whether the template calls a window function.
    pub fn is_windowed(&self) -> bool {
        WINDOW_CALL.is_match(&self.source)
    }

    /// Text with every placeholder replaced by a plain identifier.
    fn substituted(&self) -> String {
        self.parts
            .iter()
            .map(|p| match p {
                TemplatePart::Text(t) => t.as_str(),
                TemplatePart::Ref(TemplateRef::Cube) => "__cube",
                TemplatePart::Ref(_) => "__ref",
            })
            .collect()
    }

    /// Check the template parses as one complete SQL expression.
    pub fn validate_expression(&self) -> Result<(), String> {
        let text = self.substituted();
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(&text)
            .map_err(|e| e.to_string())?;
        parser.parse_expr().map_err(|e| e.to_string())?;
        let next = parser.peek_token().token;
        if next != Token::EOF {
            return Err(format!("unexpected trailing input at '{}'", next));
        }
        Ok(())
    }

    /// Check the template parses as exactly one SELECT statement.
    pub fn validate_query(&self) -> Result<(), String> {
        let text = self.substituted();
        let statements =
            Parser::parse_sql(&GenericDialect {}, &text).map_err(|e| e.to_string())?;
        match statements.as_slice() {
            [sqlparser::ast::Statement::Query(_)] => Ok(()),
            [_] => Err("expected a SELECT statement".to_string()),
            _ => Err(format!("expected one statement, found {}", statements.len())),
        }
    }
}
