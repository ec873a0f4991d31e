//! Cell-value helpers.
//!
//! Cells are `serde_json::Value`s: `Null` is the null marker, temporal cells
//! are ISO-8601 strings, opaque cells are JSON-serialized strings. Rollup
//! super-aggregates surface as nulls in grouping columns and are promoted to
//! total markers before the user sees them.

use std::cmp::Ordering;

use serde_json::Value;

/// Sentinel shown in place of a null grouping cell produced by ROLLUP.
pub const TOTAL: &str = "Total";
/// Sentinel for the row aggregating over every grouping column.
pub const GRAND_TOTAL: &str = "Grand Total";

pub fn total_marker(grand: bool) -> Value {
    if grand {
        Value::String(GRAND_TOTAL.to_string())
    } else {
        Value::String(TOTAL.to_string())
    }
}

pub fn is_total_marker(value: &Value) -> bool {
    matches!(value.as_str(), Some(TOTAL) | Some(GRAND_TOTAL))
}

pub fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

/// Whether the value is integral (so arithmetic can stay in i64).
pub fn as_i64(value: &Value) -> Option<i64> {
    value.as_i64()
}

pub fn number(value: f64) -> Value {
    serde_json::Number::from_f64(value).map_or(Value::Null, Value::Number)
}

/// Ordering used by the lexicographic sort fallback: numbers numerically,
/// strings lexicographically, booleans before strings, nulls first. Total
/// markers are handled by the caller (they usually sort last).
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => format!("{a}").cmp(&format!("{b}")),
    }
}
