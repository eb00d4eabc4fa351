use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

use crate::error::{CtxDriftError, Result};

/// A single cell value in a materialized relation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Date(NaiveDate),
}

impl Value {
    /// Ordering within the same variant; mixed variants do not compare.
    pub fn partial_cmp_same(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Int(b)) => a.partial_cmp(b),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Str(a), Value::Str(b)) => a.partial_cmp(b),
            (Value::Date(a), Value::Date(b)) => a.partial_cmp(b),
            _ => None,
        }
    }

    /// SQL-literal rendering, used when a value is embedded into query text.
    pub fn sql_literal(&self) -> String {
        match self {
            Value::Null => "NULL".to_string(),
            Value::Bool(b) => b.to_string().to_uppercase(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Str(s) => format!("'{}'", s.replace('\'', "''")),
            Value::Date(d) => format!("DATE '{}'", d),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::Str(s) => write!(f, "{}", s),
            Value::Date(d) => write!(f, "{}", d),
        }
    }
}

pub type Row = Vec<Value>;

/// The persisted output of one unit under one context: ordered rows plus an
/// order-significant column list.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Relation {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
}

impl Relation {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    pub fn with_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| CtxDriftError::Store(format!("unknown column '{}'", name)))
    }

    /// Max value of `column` across all rows, ignoring nulls. This is the
    /// watermark the incremental strategy uses to bound its next delta read.
    pub fn watermark(&self, column: &str) -> Result<Option<Value>> {
        let idx = self.column_index(column)?;
        let mut max: Option<Value> = None;
        for row in &self.rows {
            let v = match row.get(idx) {
                Some(Value::Null) | None => continue,
                Some(v) => v,
            };
            match &max {
                None => max = Some(v.clone()),
                Some(m) => {
                    if v.partial_cmp_same(m) == Some(Ordering::Greater) {
                        max = Some(v.clone());
                    }
                }
            }
        }
        Ok(max)
    }

    /// Stable key string for a row projected onto `key_indexes`. Used by the
    /// reconciler and the delete+insert merge to address rows by unique key.
    pub fn key_of(row: &Row, key_indexes: &[usize]) -> String {
        let mut out = String::new();
        for (i, idx) in key_indexes.iter().enumerate() {
            if i > 0 {
                out.push('\u{1}');
            }
            match row.get(*idx) {
                Some(v) => out.push_str(&v.to_string()),
                None => out.push_str("\u{0}"),
            }
        }
        out
    }
}
