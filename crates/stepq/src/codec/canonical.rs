//! Canonical JSON form
//!
//! Task keys and wait filters compare by text, so the same logical value
//! must always serialize to the same bytes: object keys sorted lexically,
//! arrays in order, compact separators, standard JSON scalars. Non-finite
//! numbers are unrepresentable in `serde_json::Value` and therefore cannot
//! reach this layer.

use serde_json::Value;

/// Serialize a value to its canonical string form.
pub fn to_canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(value, &mut out);
    out
}

fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_value(&map[key], out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json handles all escaping rules; a bare string cannot fail.
    out.push_str(&serde_json::to_string(s).expect("string serialization is infallible"));
}
