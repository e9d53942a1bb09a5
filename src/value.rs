//! Row values shared by the query backends, the connection resolver and the loaders

use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// A plain record: column name to raw value
pub type Record = Map<String, Value>;

/// Anything the persistence layer returns as a row
pub trait Row: Clone + Send + Sync + 'static {
    /// Raw value of a column, `None` when the row has no such column
    fn column(&self, name: &str) -> Option<Value>;
}

impl Row for Record {
    fn column(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Hashable form of a non-null column value, used as a loader key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyValue {
    Bool(bool),
    Int(i64),
    /// Numbers outside `i64`, kept in their JSON text form
    Decimal(String),
    Text(String),
}

impl KeyValue {
    /// `None` for JSON `null`
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => Some(match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Decimal(n.to_string()),
            }),
            Value::String(s) => Some(Self::Text(s.clone())),
            other => Some(Self::Text(other.to_string())),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Bool(b) => Value::Bool(*b),
            Self::Int(i) => Value::from(*i),
            Self::Decimal(text) => text
                .parse::<Number>()
                .map(Value::Number)
                .unwrap_or_else(|_| Value::String(text.clone())),
            Self::Text(s) => Value::String(s.clone()),
        }
    }
}

/// Bare string form of a value, as embedded in single-column cursors.
/// Strings are used verbatim, everything else in its JSON text form.
pub fn cursor_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL-like comparison of two raw values.
///
/// `NULL` is incomparable. A numeric string compared with a number is compared
/// numerically, the way bound text parameters are cast against numeric columns.
pub fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::Number(a), Value::Number(b)) => compare_numbers(a, b),
        (Value::Number(a), Value::String(b)) => match b.trim().parse::<f64>() {
            Ok(b) => a.as_f64()?.partial_cmp(&b),
            Err(_) => Some(a.to_string().cmp(b)),
        },
        (Value::String(a), Value::Number(b)) => {
            compare_values(&Value::Number(b.clone()), &Value::String(a.clone())).map(Ordering::reverse)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (a, b) => Some(a.to_string().cmp(&b.to_string())),
    }
}

fn compare_numbers(a: &Number, b: &Number) -> Option<Ordering> {
    match (a.as_i64(), b.as_i64()) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}
