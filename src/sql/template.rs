// ABOUTME: Contextual substitution for manually supplied SQL
// ABOUTME: Resolves {{ namespace.key }} references against db, table, and run values

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// A scalar value supplied in a `data` table of the configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum TemplateValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for TemplateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TemplateValue::Bool(b) => write!(f, "{}", b),
            TemplateValue::Integer(i) => write!(f, "{}", i),
            TemplateValue::Float(x) => write!(f, "{}", x),
            TemplateValue::Text(s) => f.write_str(s),
        }
    }
}

/// A reference that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unresolved template reference '{reference}'")]
pub struct TemplateError {
    pub reference: String,
}

impl TemplateError {
    fn new(reference: &str) -> Self {
        Self {
            reference: reference.trim().to_string(),
        }
    }
}

/// Values visible to a template, split into the `db`, `table` and `run` namespaces.
///
/// `run` values may be present but null (e.g. `old_index_value` on a first run); a null
/// value only resolves through a `| default:` clause.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    db: BTreeMap<String, String>,
    table: BTreeMap<String, String>,
    run: BTreeMap<String, Option<String>>,
}

impl TemplateContext {
    pub fn new(
        db: &BTreeMap<String, TemplateValue>,
        table: &BTreeMap<String, TemplateValue>,
    ) -> Self {
        Self {
            db: db.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
            table: table.iter().map(|(k, v)| (k.clone(), v.to_string())).collect(),
            run: BTreeMap::new(),
        }
    }

    /// Set a `run.<key>` value. `None` marks it as known but null.
    pub fn set_run(&mut self, key: &str, value: Option<String>) {
        self.run.insert(key.to_string(), value);
    }

    fn lookup(&self, namespace: &str, key: &str) -> Option<Option<&str>> {
        match namespace {
            "db" => self.db.get(key).map(|v| Some(v.as_str())),
            "table" => self.table.get(key).map(|v| Some(v.as_str())),
            "run" => self.run.get(key).map(|v| v.as_deref()),
            _ => None,
        }
    }
}

/// Substitute every `{{ ns.key }}` / `{{ ns.key | default: literal }}` in `sql`.
///
/// Values are inserted verbatim. Unknown namespaces, undefined keys, null run values
/// without a default, and unterminated `{{` are all errors.
///
/// ```
/// # use std::collections::BTreeMap;
/// # use warehouse_replicator::sql::template::{render, TemplateContext};
/// let mut ctx = TemplateContext::default();
/// ctx.set_run("old_index_value", None);
/// let sql = render("SELECT * FROM t WHERE id > {{ run.old_index_value | default: 0 }}", &ctx);
/// assert_eq!(sql.unwrap(), "SELECT * FROM t WHERE id > 0");
/// ```
pub fn render(sql: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(sql.len());
    let mut rest = sql;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(TemplateError::new(after_open));
        };
        let expression = &after_open[..end];
        out.push_str(&resolve(expression, context)?);
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);

    Ok(out)
}

fn resolve(expression: &str, context: &TemplateContext) -> Result<String, TemplateError> {
    let (reference, filter) = match expression.split_once('|') {
        Some((reference, filter)) => (reference.trim(), Some(filter.trim())),
        None => (expression.trim(), None),
    };

    let default = match filter {
        None => None,
        Some(filter) => match filter.strip_prefix("default:") {
            Some(literal) => Some(literal.trim()),
            None => return Err(TemplateError::new(expression)),
        },
    };

    let Some((namespace, key)) = reference.split_once('.') else {
        return Err(TemplateError::new(reference));
    };

    match (context.lookup(namespace.trim(), key.trim()), default) {
        (Some(Some(value)), _) => Ok(value.to_string()),
        (_, Some(default)) => Ok(default.to_string()),
        _ => Err(TemplateError::new(reference)),
    }
}
