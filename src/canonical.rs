//! Canonical encoding (version 1) for hashing and signing.
//!
//! Maps any structured document to a unique byte string: two structurally
//! equal values produce identical bytes regardless of insertion order.
//! Version 1 rules: UTF-8, object keys sorted lexicographically, `:` and
//! `,` separators with no insignificant whitespace, JSON-compatible minimal
//! string escaping, numbers in shortest round-trip form.
//!
//! Everything that is hashed or signed in this crate goes through this
//! module; nothing else is allowed to define a byte form for a document.

use serde_json::Value;

/// Canonical encoding version tag carried by events as
/// `hash_algorithm_version`.
pub const CANONICAL_VERSION: u8 = 1;

/// Encode a document to its canonical byte string.
pub fn canonical_bytes(value: &Value) -> Vec<u8> {
    canonical_string(value).into_bytes()
}

/// Encode a document to its canonical string form.
pub fn canonical_string(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        // serde_json renders integers via itoa and floats via ryu, which is
        // the shortest round-trip form required by version 1.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_escaped(out, s),
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
        Value::Object(map) => {
            // Keys sorted byte-lexicographically. UTF-8 byte order equals
            // codepoint order, so this is stable across implementations.
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_escaped(out, key);
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

// Minimal JSON escaping: only control characters, quote and backslash are
// escaped; everything else is emitted as raw UTF-8.
fn write_escaped(out: &mut String, s: &str) {
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
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted() {
        let a = json!({"b": 1, "a": 2, "c": {"z": 1, "y": 2}});
        assert_eq!(
            canonical_string(&a),
            r#"{"a":2,"b":1,"c":{"y":2,"z":1}}"#
        );
    }

    #[test]
    fn no_insignificant_whitespace() {
        let v = json!({"k": [1, 2, {"n": null}], "t": true});
        assert_eq!(canonical_string(&v), r#"{"k":[1,2,{"n":null}],"t":true}"#);
    }

    #[test]
    fn structurally_equal_values_encode_identically() {
        let a: Value = serde_json::from_str(r#"{"x":1,"y":[true,"s"]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{ "y": [true, "s"], "x": 1 }"#).unwrap();
        assert_eq!(canonical_bytes(&a), canonical_bytes(&b));
    }

    #[test]
    fn strings_use_minimal_escaping() {
        let v = json!({"s": "a\"b\\c\nd"});
        assert_eq!(canonical_string(&v), "{\"s\":\"a\\\"b\\\\c\\nd\"}");
        // Non-ASCII stays raw UTF-8.
        let v = json!("héllo");
        assert_eq!(canonical_string(&v), "\"héllo\"");
    }

    #[test]
    fn numbers_round_trip_shortest_form() {
        let v = json!({"i": 42, "f": 1.5, "neg": -7});
        assert_eq!(canonical_string(&v), r#"{"f":1.5,"i":42,"neg":-7}"#);
    }
}
