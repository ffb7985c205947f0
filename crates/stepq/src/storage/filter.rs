//! Structural JSON filter
//!
//! A filter matches an event input iff, for every node of the filter:
//! - an object requires an object at the same path (contents checked
//!   per-key, extra event keys ignored),
//! - an array requires an array at the same path (checked per-index),
//! - `null` matches anything,
//! - any other leaf requires strict equality.
//!
//! The SQLite backend expresses the same walk with `json_tree(filter)`
//! against `json_extract(event.input, fullkey)`; this module is the
//! in-memory twin and the reference for both.

use serde_json::Value;

/// Does `input` satisfy `filter`?
pub fn matches_filter(filter: &Value, input: &Value) -> bool {
    matches_at(filter, Some(input))
}

fn matches_at(filter: &Value, node: Option<&Value>) -> bool {
    match filter {
        Value::Null => true,
        Value::Object(fields) => match node {
            Some(Value::Object(actual)) => fields
                .iter()
                .all(|(key, expected)| matches_at(expected, actual.get(key))),
            _ => false,
        },
        Value::Array(items) => match node {
            Some(Value::Array(actual)) => items
                .iter()
                .enumerate()
                .all(|(i, expected)| matches_at(expected, actual.get(i))),
            _ => false,
        },
        leaf => node == Some(leaf),
    }
}
