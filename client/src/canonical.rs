//! Canonical JSON encoding used for signing payloads.
//!
//! Both the signing and the verifying side must serialize a payload to
//! the exact same bytes, so the encoding is fully deterministic: object
//! keys sorted lexicographically, no insignificant whitespace, minimal
//! string escapes.

use serde_json::{Map, Value};

/// Serialize a JSON value to its canonical form.
#[must_use]
pub fn to_canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Serialize a JSON object to its canonical form.
#[must_use]
pub fn map_to_canonical_json(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(&mut out, map);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => write_object(out, map),
    }
}

fn write_object(out: &mut String, map: &Map<String, Value>) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(out, key);
        out.push(':');
        // Key came from the map, so the lookup cannot miss.
        if let Some(value) = map.get(*key) {
            write_value(out, value);
        }
    }
    out.push('}');
}

fn write_string(out: &mut String, s: &str) {
    use std::fmt::Write;

    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c < '\u{20}' => {
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_sorts_keys_recursively() {
        let value = json!({
            "b": 1,
            "a": {"z": true, "m": null},
        });
        assert_eq!(
            to_canonical_json(&value),
            r#"{"a":{"m":null,"z":true},"b":1}"#
        );
    }

    #[test]
    fn test_insertion_order_is_irrelevant() {
        let first = json!({"one": 1, "two": 2});
        let second = json!({"two": 2, "one": 1});
        assert_eq!(to_canonical_json(&first), to_canonical_json(&second));
    }

    #[test]
    fn test_arrays_keep_order() {
        let value = json!({"keys": ["b", "a"], "n": [3, 1, 2]});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"keys":["b","a"],"n":[3,1,2]}"#
        );
    }

    #[test]
    fn test_string_escapes() {
        let value = json!({"text": "line\nbreak \"quoted\" \\ \u{01}"});
        assert_eq!(
            to_canonical_json(&value),
            r#"{"text":"line\nbreak \"quoted\" \\ \u0001"}"#
        );
    }

    #[test]
    fn test_unicode_passes_through() {
        let value = json!({"emoji": "日本語 ü"});
        assert_eq!(to_canonical_json(&value), r#"{"emoji":"日本語 ü"}"#);
    }

    #[test]
    fn test_map_entry_point_matches_value() {
        let value = json!({"k": [1, {"b": 2, "a": 3}]});
        let Value::Object(map) = &value else {
            panic!("expected an object");
        };
        assert_eq!(map_to_canonical_json(map), to_canonical_json(&value));
    }
}
