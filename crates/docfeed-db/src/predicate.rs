//! Composable predicates over document rows.
//!
//! A [`Predicate`] is a boolean expression over a row's `id` and its JSON
//! `data`. Callers build one with the constructor helpers (or deserialize
//! one from JSON), and the store renders it into a parameterised SQL
//! fragment. Field paths are validated and emitted as literals so
//! expression indexes on `json_extract(data, '$.path')` can be used;
//! every value is a bound parameter.
//!
//! Nothing outside this module inspects a predicate's shape.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors raised while rendering a predicate to SQL.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PredicateError {
    /// A field path was empty or contained characters outside
    /// `[A-Za-z0-9_]` between dots.
    #[error("invalid document path: '{0}'")]
    InvalidPath(String),

    /// An ordering comparison was given a value that is neither a number
    /// nor a string.
    #[error("operator '{op}' cannot compare against {value}")]
    UnsupportedComparison {
        /// The comparison operator.
        op: &'static str,
        /// The offending value, as JSON.
        value: String,
    },

    /// A containment document had a shape that cannot be expressed, such as
    /// a top-level scalar or a nested container inside an array.
    #[error("unsupported containment value: {0}")]
    UnsupportedContainment(String),
}

/// A boolean expression over a document row.
///
/// The JSON form is externally tagged in `snake_case`, e.g.
/// `{"gte": {"path": "v", "value": 2}}` or `{"and": [...]}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    /// Matches every row.
    #[default]
    All,
    /// `id = n`
    IdEq(i64),
    /// `id > n`
    IdGt(i64),
    /// `id >= n`
    IdGte(i64),
    /// `id < n`
    IdLt(i64),
    /// `id <= n`
    IdLte(i64),
    /// Field equals value.
    Eq { path: String, value: Value },
    /// Field is present and not equal to value.
    Ne { path: String, value: Value },
    /// Field is greater than a number or string of the same kind.
    Gt { path: String, value: Value },
    /// Field is greater than or equal to a number or string of the same kind.
    Gte { path: String, value: Value },
    /// Field is less than a number or string of the same kind.
    Lt { path: String, value: Value },
    /// Field is less than or equal to a number or string of the same kind.
    Lte { path: String, value: Value },
    /// Field is present (including explicit `null`).
    Exists { path: String },
    /// Field is present and `null`.
    IsNull { path: String },
    /// The document contains the given object or array, leaf by leaf.
    Contains(Value),
    /// All sub-predicates hold. An empty list is true.
    And(Vec<Predicate>),
    /// Any sub-predicate holds. An empty list is false.
    Or(Vec<Predicate>),
    /// The sub-predicate does not hold.
    Not(Box<Predicate>),
    /// Raw SQL using anonymous `?` placeholders, bound to `params` in order.
    ///
    /// Never accepted from untrusted input.
    #[serde(skip)]
    Raw { sql: String, params: Vec<Value> },
}

impl Predicate {
    /// Field equals value.
    pub fn eq(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Field is present and not equal to value.
    pub fn ne(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Field is greater than value.
    pub fn gt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Field is greater than or equal to value.
    pub fn gte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Field is less than value.
    pub fn lt(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Field is less than or equal to value.
    pub fn lte(path: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte {
            path: path.into(),
            value: value.into(),
        }
    }

    /// The document contains `doc`.
    pub fn contains(doc: impl Into<Value>) -> Self {
        Self::Contains(doc.into())
    }

    /// Conjunction of `self` and `other`, flattening nested `And`s.
    pub fn and(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::All, p) | (p, Self::All) => p,
            (Self::And(mut left), Self::And(right)) => {
                left.extend(right);
                Self::And(left)
            }
            (Self::And(mut left), p) => {
                left.push(p);
                Self::And(left)
            }
            (p, q) => Self::And(vec![p, q]),
        }
    }

    /// Disjunction of `self` and `other`.
    pub fn or(self, other: Predicate) -> Self {
        match (self, other) {
            (Self::Or(mut left), p) => {
                left.push(p);
                Self::Or(left)
            }
            (p, q) => Self::Or(vec![p, q]),
        }
    }

    /// Negation of `self`.
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Renders the predicate into a SQL boolean expression and its bound
    /// parameters.
    ///
    /// # Errors
    ///
    /// Returns `PredicateError` if a path is invalid or a value cannot be
    /// compared or contained.
    pub fn to_sql(&self) -> Result<SqlFragment, PredicateError> {
        let mut out = SqlFragment::default();
        self.render(&mut out)?;
        Ok(out)
    }

    fn render(&self, out: &mut SqlFragment) -> Result<(), PredicateError> {
        match self {
            Self::All => out.sql.push_str("1 = 1"),
            Self::IdEq(id) => out.push_bound("id = ?", SqlValue::Integer(*id)),
            Self::IdGt(id) => out.push_bound("id > ?", SqlValue::Integer(*id)),
            Self::IdGte(id) => out.push_bound("id >= ?", SqlValue::Integer(*id)),
            Self::IdLt(id) => out.push_bound("id < ?", SqlValue::Integer(*id)),
            Self::IdLte(id) => out.push_bound("id <= ?", SqlValue::Integer(*id)),
            Self::Eq { path, value } => render_equals(&json_path(path)?, value, out),
            Self::Ne { path, value } => {
                let p = json_path(path)?;
                out.sql
                    .push_str(&format!("(json_type(data, '{p}') IS NOT NULL AND NOT ("));
                render_equals(&p, value, out);
                out.sql.push_str("))");
            }
            Self::Gt { path, value } => render_ordering(path, ">", value, out)?,
            Self::Gte { path, value } => render_ordering(path, ">=", value, out)?,
            Self::Lt { path, value } => render_ordering(path, "<", value, out)?,
            Self::Lte { path, value } => render_ordering(path, "<=", value, out)?,
            Self::Exists { path } => {
                let p = json_path(path)?;
                out.sql
                    .push_str(&format!("json_type(data, '{p}') IS NOT NULL"));
            }
            Self::IsNull { path } => {
                let p = json_path(path)?;
                out.sql.push_str(&format!("json_type(data, '{p}') = 'null'"));
            }
            Self::Contains(doc) => match doc {
                Value::Object(_) | Value::Array(_) => render_contains("$", doc, out)?,
                other => {
                    return Err(PredicateError::UnsupportedContainment(other.to_string()))
                }
            },
            Self::And(parts) => render_joined(parts, " AND ", "1 = 1", out)?,
            Self::Or(parts) => render_joined(parts, " OR ", "1 = 0", out)?,
            Self::Not(inner) => {
                out.sql.push_str("NOT (");
                inner.render(out)?;
                out.sql.push(')');
            }
            Self::Raw { sql, params } => {
                out.sql.push('(');
                out.sql.push_str(sql);
                out.sql.push(')');
                out.params.extend(params.iter().map(to_sql_value));
            }
        }
        Ok(())
    }
}

/// A rendered SQL boolean expression with anonymous `?` placeholders.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlFragment {
    /// The SQL text.
    pub sql: String,
    /// Parameters bound to the placeholders, in order.
    pub params: Vec<SqlValue>,
}

impl SqlFragment {
    fn push_bound(&mut self, sql: &str, value: SqlValue) {
        self.sql.push_str(sql);
        self.params.push(value);
    }
}

fn render_joined(
    parts: &[Predicate],
    separator: &str,
    empty: &str,
    out: &mut SqlFragment,
) -> Result<(), PredicateError> {
    if parts.is_empty() {
        out.sql.push_str(empty);
        return Ok(());
    }
    out.sql.push('(');
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            out.sql.push_str(separator);
        }
        out.sql.push('(');
        part.render(out)?;
        out.sql.push(')');
    }
    out.sql.push(')');
    Ok(())
}

/// Converts a dotted field path into a SQLite JSON path such as `$.a.b[0]`.
///
/// Index DDL uses the same rendering so the planner can match expressions.
pub(crate) fn json_path(path: &str) -> Result<String, PredicateError> {
    if path.is_empty() {
        return Err(PredicateError::InvalidPath(path.to_string()));
    }
    let mut out = String::from("$");
    for segment in path.split('.') {
        append_segment(&mut out, segment).map_err(|_| PredicateError::InvalidPath(path.to_string()))?;
    }
    Ok(out)
}

fn append_segment(out: &mut String, segment: &str) -> Result<(), PredicateError> {
    if segment.is_empty() || !segment.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(PredicateError::InvalidPath(segment.to_string()));
    }
    if segment.chars().all(|c| c.is_ascii_digit()) {
        out.push('[');
        out.push_str(segment);
        out.push(']');
    } else {
        out.push('.');
        out.push_str(segment);
    }
    Ok(())
}

fn render_equals(path: &str, value: &Value, out: &mut SqlFragment) {
    match value {
        Value::Null => out.sql.push_str(&format!("json_type(data, '{path}') = 'null'")),
        Value::Bool(true) => out.sql.push_str(&format!("json_type(data, '{path}') = 'true'")),
        Value::Bool(false) => out.sql.push_str(&format!("json_type(data, '{path}') = 'false'")),
        Value::Number(_) => out.push_bound(
            &format!("(json_type(data, '{path}') IN ('integer', 'real') AND json_extract(data, '{path}') = ?)"),
            to_sql_value(value),
        ),
        Value::String(_) => out.push_bound(
            &format!("(json_type(data, '{path}') = 'text' AND json_extract(data, '{path}') = ?)"),
            to_sql_value(value),
        ),
        Value::Array(_) | Value::Object(_) => out.push_bound(
            &format!("json_extract(data, '{path}') = json(?)"),
            to_sql_value(value),
        ),
    }
}

fn render_ordering(
    path: &str,
    op: &'static str,
    value: &Value,
    out: &mut SqlFragment,
) -> Result<(), PredicateError> {
    let p = json_path(path)?;
    let types = match value {
        Value::Number(_) => "('integer', 'real')",
        Value::String(_) => "('text')",
        other => {
            return Err(PredicateError::UnsupportedComparison {
                op,
                value: other.to_string(),
            })
        }
    };
    out.push_bound(
        &format!("(json_type(data, '{p}') IN {types} AND json_extract(data, '{p}') {op} ?)"),
        to_sql_value(value),
    );
    Ok(())
}

fn render_contains(path: &str, doc: &Value, out: &mut SqlFragment) -> Result<(), PredicateError> {
    match doc {
        Value::Object(fields) => {
            if fields.is_empty() {
                out.sql.push_str(&format!("json_type(data, '{path}') = 'object'"));
                return Ok(());
            }
            out.sql.push('(');
            for (i, (key, child)) in fields.iter().enumerate() {
                if i > 0 {
                    out.sql.push_str(" AND ");
                }
                let mut child_path = path.to_string();
                append_segment(&mut child_path, key)?;
                render_contains(&child_path, child, out)?;
            }
            out.sql.push(')');
        }
        Value::Array(items) => {
            out.sql.push_str(&format!("(json_type(data, '{path}') = 'array'"));
            for item in items {
                out.sql.push_str(&format!(
                    " AND EXISTS (SELECT 1 FROM json_each(data, '{path}') AS je WHERE "
                ));
                match item {
                    Value::Null => out.sql.push_str("je.type = 'null'"),
                    Value::Bool(true) => out.sql.push_str("je.type = 'true'"),
                    Value::Bool(false) => out.sql.push_str("je.type = 'false'"),
                    Value::Number(_) => {
                        out.push_bound("je.type IN ('integer', 'real') AND je.atom = ?", to_sql_value(item))
                    }
                    Value::String(_) => out.push_bound("je.type = 'text' AND je.atom = ?", to_sql_value(item)),
                    Value::Array(_) | Value::Object(_) => {
                        return Err(PredicateError::UnsupportedContainment(item.to_string()))
                    }
                }
                out.sql.push(')');
            }
            out.sql.push(')');
        }
        scalar => render_equals(path, scalar, out),
    }
    Ok(())
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}
