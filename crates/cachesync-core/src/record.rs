//! Row payloads as they travel through the engine.
//!
//! A record is the full field set of one database row, kept as an untyped
//! JSON object so the engine stays schema-agnostic. Only identity and
//! relationship columns are ever interpreted.

use serde_json::{Map, Value};

/// One row's field set.
pub type Record = Map<String, Value>;

/// Render a scalar column value as an identity string.
///
/// Strings are taken verbatim, integers are formatted in decimal. Nulls,
/// empty strings, floats, booleans and structured values never identify a
/// row.
pub fn scalar_id(value: &Value) -> Option<String> {
  match value {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) if n.is_i64() || n.is_u64() => Some(n.to_string()),
    _ => None,
  }
}

/// Read `column` from `record` as an identity string.
pub fn column_id(record: &Record, column: &str) -> Option<String> {
  record.get(column).and_then(scalar_id)
}

/// Whether `record` carries `column` at all, set or not.
pub fn has_column(record: &Record, column: &str) -> bool {
  record.contains_key(column)
}

/// Whether the marker `column` is present and non-null.
pub fn is_marked(record: &Record, column: &str) -> bool {
  matches!(record.get(column), Some(v) if !v.is_null())
}
