// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Canonical JSON for hashing and signing.
//!
//! Rules: object keys sorted lexicographically, no insignificant
//! whitespace, UTF-8, numbers in their shortest round-trippable decimal
//! form. The same value always canonicalizes to the same byte string.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Serialize a JSON value canonically.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        // serde_json renders numbers via itoa/ryu: shortest round-trip form.
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("string serialization is total"))
        }
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
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("string serialization is total"));
                out.push(':');
                write_value(out, &map[key.as_str()]);
            }
            out.push('}');
        }
    }
}

/// Hex-encoded SHA-256 digest.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn keys_are_sorted_and_output_is_compact() {
        let value = json!({"b": 1, "a": {"z": true, "m": [1, 2]}, "c": "x"});
        assert_eq!(canonical_json(&value), r#"{"a":{"m":[1,2],"z":true},"b":1,"c":"x"}"#);
    }

    #[test]
    fn identical_values_canonicalize_identically() {
        let a = json!({"x": 1, "y": [null, "é"]});
        let b: Value = serde_json::from_str(r#"{ "y": [null, "é"], "x": 1 }"#).unwrap();
        assert_eq!(canonical_json(&a), canonical_json(&b));
    }

    #[test]
    fn numbers_keep_shortest_form() {
        let value = json!({"i": 42, "f": 0.25, "neg": -7});
        assert_eq!(canonical_json(&value), r#"{"f":0.25,"i":42,"neg":-7}"#);
    }

    #[test]
    fn sha256_hex_is_stable() {
        assert_eq!(
            sha256_hex(b"aether"),
            sha256_hex(b"aether"),
        );
        assert_eq!(sha256_hex(b"").len(), 64);
    }
}
