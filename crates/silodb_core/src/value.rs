//! Ordering and equality over dynamic JSON values.
//!
//! Rows carry [`serde_json::Value`] columns. Sorting needs a total order
//! and the relational operators need a partial one:
//!
//! - booleans and numbers compare numerically (`false` = 0, `true` = 1);
//! - text compares lexicographically;
//! - lists and maps compare structurally via their canonical JSON rendering;
//! - across kinds, the rank is null < numeric < text < list < map.
//!
//! Relational operators (`<`, `between`, …) only accept operands of the
//! same comparable class; a mixed-kind comparison is simply not a match.

use serde_json::Value;
use std::cmp::Ordering;

/// Rank of a value kind in the total order.
fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) | Value::Number(_) => 1,
        Value::String(_) => 2,
        Value::Array(_) => 3,
        Value::Object(_) => 4,
    }
}

fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

/// Total order over values, used by `sort`.
///
/// Within the numeric rank the comparison is by `f64::total_cmp`; within
/// collections it falls back to canonical JSON text, which is deterministic
/// because `serde_json` maps are key-sorted.
pub(crate) fn total_cmp(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (rank(a), rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if ra == 1 => {
            let (x, y) = (as_f64(a).unwrap_or(f64::NAN), as_f64(b).unwrap_or(f64::NAN));
            x.total_cmp(&y)
        }
        _ => canonical(a).cmp(&canonical(b)),
    }
}

/// Partial order used by the relational operators.
///
/// Comparable classes are "numeric" (bool, int, float) and "text"; anything
/// else, or a mix of the two, returns `None`.
pub(crate) fn partial_cmp(a: &Value, b: &Value) -> Option<Ordering> {
    match (rank(a), rank(b)) {
        (1, 1) => Some(as_f64(a)?.total_cmp(&as_f64(b)?)),
        (2, 2) => Some(a.as_str()?.cmp(b.as_str()?)),
        _ => None,
    }
}

/// Equality with numeric widening: `1` equals `1.0`, but `true` does not
/// equal `1` and `"1"` does not equal `1`.
pub(crate) fn eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => a == b,
        },
        _ => a == b,
    }
}

/// Canonical text rendering, used for distinct keys and structural
/// comparison.
pub(crate) fn canonical(value: &Value) -> String {
    value.to_string()
}
