//! SQL construction for the model-level operations.
//!
//! Rows travel as JSON objects: reads project each row with `to_jsonb`, writes go through
//! `jsonb_populate_record` so PostgreSQL performs the column type conversions. Filters are
//! per-column jsonb equality tests on the row's JSON form (`to_jsonb(t) -> 'col'`).

use serde_json::{Map, Value};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::fmt;

use crate::error::WardenError;

/// One row, keyed by column name.
pub type Record = Map<String, Value>;

/// PostgreSQL's NAMEDATALEN - 1.
const MAX_IDENT_LEN: usize = 63;

/// A validated, always-quoted SQL identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident<'a>(&'a str);

impl<'a> Ident<'a> {
    pub fn parse(name: &'a str) -> Result<Self, WardenError> {
        let mut chars = name.chars();
        let valid_head = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let valid_tail = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid_head || !valid_tail || name.len() > MAX_IDENT_LEN {
            return Err(WardenError::InvalidIdentifier(name.to_string()));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &'a str {
        self.0
    }
}

impl fmt::Display for Ident<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\"", self.0)
    }
}

/// Row restriction applied on top of a caller's filter.
///
/// Every group in `any_of` must be satisfied by at least one of its filters; an empty group
/// matches nothing. Rows matching any `deny` filter are always excluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowScope {
    pub any_of: Vec<Vec<Record>>,
    pub deny: Vec<Record>,
}

impl RowScope {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn is_unrestricted(&self) -> bool {
        self.any_of.is_empty() && self.deny.is_empty()
    }

    /// Add one more group of alternatives the row must satisfy.
    pub fn restrict(&mut self, group: Vec<Record>) {
        self.any_of.push(group);
    }

    /// In-memory counterpart of the SQL predicate built by [`push_where`].
    pub fn admits(&self, record: &Record) -> bool {
        let allowed = self
            .any_of
            .iter()
            .all(|group| group.iter().any(|f| record_matches(record, f)));
        allowed && !self.deny.iter().any(|f| record_matches(record, f))
    }
}

/// Every filter column is present in `record` with an equal value.
/// Same test as the SQL predicate built by `push_match`.
pub fn record_matches(record: &Record, filter: &Record) -> bool {
    filter
        .iter()
        .all(|(k, v)| record.get(k).is_some_and(|actual| json_eq(actual, v)))
}

/// jsonb equality: exact for arrays and objects, numeric for numbers (`1` equals `1.0`).
pub fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => match (x.as_u64(), y.as_u64()) {
                (Some(x), Some(y)) => x == y,
                _ => x.as_f64() == y.as_f64(),
            },
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, a)| y.get(k).is_some_and(|b| json_eq(a, b)))
        }
        _ => a == b,
    }
}

fn columns(data: &Record) -> Result<Vec<Ident<'_>>, WardenError> {
    data.keys().map(|k| Ident::parse(k)).collect()
}

fn join_idents(idents: &[Ident<'_>]) -> String {
    idents
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// `(to_jsonb(t) -> 'a' IS NOT DISTINCT FROM $1 AND ...)`, or `TRUE` for an empty filter.
/// A column the row lacks yields false rather than NULL, so `NOT` behaves like the
/// in-memory check.
fn push_match(
    qb: &mut QueryBuilder<'static, Postgres>,
    filter: &Record,
) -> Result<(), WardenError> {
    if filter.is_empty() {
        qb.push("TRUE");
        return Ok(());
    }
    qb.push("(");
    for (i, (column, value)) in filter.iter().enumerate() {
        // Validated identifiers contain no quotes, so the key can sit in a literal.
        let column = Ident::parse(column)?;
        if i > 0 {
            qb.push(" AND ");
        }
        qb.push(format!(
            "to_jsonb(t) -> '{}' IS NOT DISTINCT FROM ",
            column.as_str()
        ));
        qb.push_bind(Json(value.clone()));
    }
    qb.push(")");
    Ok(())
}

fn push_where(
    qb: &mut QueryBuilder<'static, Postgres>,
    filter: &Record,
    scope: &RowScope,
) -> Result<(), WardenError> {
    qb.push(" WHERE ");
    push_match(qb, filter)?;

    for group in &scope.any_of {
        if group.is_empty() {
            qb.push(" AND FALSE");
            continue;
        }
        qb.push(" AND (");
        for (i, f) in group.iter().enumerate() {
            if i > 0 {
                qb.push(" OR ");
            }
            push_match(qb, f)?;
        }
        qb.push(")");
    }

    for f in &scope.deny {
        qb.push(" AND NOT ");
        push_match(qb, f)?;
    }
    Ok(())
}

pub fn select(
    model: &str,
    filter: &Record,
    scope: &RowScope,
    limit: Option<i64>,
) -> Result<QueryBuilder<'static, Postgres>, WardenError> {
    let table = Ident::parse(model)?;
    let mut qb = QueryBuilder::new(format!("SELECT to_jsonb(t) AS row FROM {table} AS t"));
    push_where(&mut qb, filter, scope)?;
    if let Some(n) = limit {
        qb.push(" LIMIT ");
        qb.push_bind(n);
    }
    Ok(qb)
}

pub fn count(
    model: &str,
    filter: &Record,
    scope: &RowScope,
) -> Result<QueryBuilder<'static, Postgres>, WardenError> {
    let table = Ident::parse(model)?;
    let mut qb = QueryBuilder::new(format!("SELECT COUNT(*) FROM {table} AS t"));
    push_where(&mut qb, filter, scope)?;
    Ok(qb)
}

pub fn insert(model: &str, data: &Record) -> Result<QueryBuilder<'static, Postgres>, WardenError> {
    let table = Ident::parse(model)?;
    let cols = columns(data)?;
    if cols.is_empty() {
        return Ok(QueryBuilder::new(format!(
            "INSERT INTO {table} AS t DEFAULT VALUES RETURNING to_jsonb(t) AS row"
        )));
    }
    let list = join_idents(&cols);
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {table} AS t ({list}) SELECT {list} FROM jsonb_populate_record(NULL::{table}, "
    ));
    qb.push_bind(Json(Value::Object(data.clone())));
    qb.push(") RETURNING to_jsonb(t) AS row");
    Ok(qb)
}

pub fn update(
    model: &str,
    filter: &Record,
    scope: &RowScope,
    data: &Record,
) -> Result<QueryBuilder<'static, Postgres>, WardenError> {
    let table = Ident::parse(model)?;
    let cols = columns(data)?;
    if cols.is_empty() {
        return Err(WardenError::InvalidData(format!(
            "update on `{model}` sets no columns"
        )));
    }
    let list = join_idents(&cols);
    let mut qb = QueryBuilder::new(format!(
        "UPDATE {table} AS t SET ({list}) = (SELECT {list} FROM jsonb_populate_record(NULL::{table}, "
    ));
    qb.push_bind(Json(Value::Object(data.clone())));
    qb.push("))");
    push_where(&mut qb, filter, scope)?;
    qb.push(" RETURNING to_jsonb(t) AS row");
    Ok(qb)
}

pub fn delete(
    model: &str,
    filter: &Record,
    scope: &RowScope,
) -> Result<QueryBuilder<'static, Postgres>, WardenError> {
    let table = Ident::parse(model)?;
    let mut qb = QueryBuilder::new(format!("DELETE FROM {table} AS t"));
    push_where(&mut qb, filter, scope)?;
    qb.push(" RETURNING to_jsonb(t) AS row");
    Ok(qb)
}
