//! Canonical JSON used as the content fingerprint of archived envelopes.
//!
//! Keys are sorted by code point, separators carry no whitespace, and every
//! character outside printable ASCII is written as a `\uXXXX` escape (with
//! surrogate pairs above the BMP), so the byte stream only depends on the
//! document's content.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt::Write;

fn canonical_map_string(map: &Map<String, Value>) -> String {
    let mut out = String::new();
    write_object(map, &mut out);
    out
}

/// Lowercase hex SHA-256 of the canonical form of `map`.
pub fn canonical_map_hash(map: &Map<String, Value>) -> String {
    sha256_hex(canonical_map_string(map).as_bytes())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
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
        Value::Object(map) => write_object(map, out),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut String) {
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();

    out.push('{');
    for (i, key) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(key, out);
        out.push(':');
        if let Some(val) = map.get(*key) {
            write_value(val, out);
        }
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    out.push('"');
    for ch in s.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if (' '..='~').contains(&c) => out.push(c),
            c => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn canonical(value: Value) -> String {
        let Value::Object(map) = value else {
            panic!("expected object");
        };
        canonical_map_string(&map)
    }

    #[test]
    fn sorts_keys_and_drops_whitespace() {
        let v = json!({"tenant": "acme", "date": "2025-01-15", "nested": {"b": 1, "a": [true, null]}});
        assert_eq!(
            canonical(v),
            r#"{"date":"2025-01-15","nested":{"a":[true,null],"b":1},"tenant":"acme"}"#
        );
    }

    #[test]
    fn escapes_non_ascii_and_control_characters() {
        let v = json!({"k": "caf\u{e9} \u{1f600}\u{1}\"q\""});
        let text = canonical(v);
        assert_eq!(text, r#"{"k":"caf\u00e9 \ud83d\ude00\u0001\"q\""}"#);
        assert!(text.is_ascii());
    }

    #[test]
    fn hash_ignores_insertion_order_but_not_values() {
        let mut first = Map::new();
        first.insert("b".into(), json!(2));
        first.insert("a".into(), json!("x"));
        let mut second = Map::new();
        second.insert("a".into(), json!("x"));
        second.insert("b".into(), json!(2));
        assert_eq!(canonical_map_hash(&first), canonical_map_hash(&second));

        second.insert("b".into(), json!(3));
        assert_ne!(canonical_map_hash(&first), canonical_map_hash(&second));
    }

    #[test]
    fn hash_is_sha256_of_the_canonical_text() {
        let mut map = Map::new();
        map.insert("z".into(), json!(1));
        map.insert("a".into(), json!({"y": "w"}));
        let hash = canonical_map_hash(&map);
        assert_eq!(hash, sha256_hex(br#"{"a":{"y":"w"},"z":1}"#));
        assert_eq!(hash.len(), 64);
    }
}
