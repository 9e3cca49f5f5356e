//! Canonical JSON serialization and SHA-256 digests.
//!
//! Canonical JSON has:
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No insignificant whitespace
//! - UTF-8 output
//!
//! Persisted files (receipts, dispatch snapshots, log lines) use the
//! *line* form, which appends a single `\n`. Hashes are always taken over
//! the exact bytes that land on disk.
//!
//! Floats are permitted: durations and costs are fractional. Non-finite
//! floats never reach the writer because `serde_json` maps them to `null`.

use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::error::HarnessResult;
use crate::ids::ContentHash;

/// Serialize `value` into canonical JSON bytes (no trailing newline).
pub fn to_canonical_bytes<T: Serialize + ?Sized>(value: &T) -> HarnessResult<Vec<u8>> {
    let v = serde_json::to_value(value)?;
    Ok(value_to_canonical_bytes(&v))
}

/// Canonical bytes plus trailing newline, the on-disk form.
pub fn to_canonical_line<T: Serialize + ?Sized>(value: &T) -> HarnessResult<Vec<u8>> {
    let mut out = to_canonical_bytes(value)?;
    out.push(b'\n');
    Ok(out)
}

/// Same as [`to_canonical_bytes`], returning a `String`.
pub fn to_canonical_string<T: Serialize + ?Sized>(value: &T) -> HarnessResult<String> {
    let v = serde_json::to_value(value)?;
    let mut out = String::new();
    write_value(&v, &mut out);
    Ok(out)
}

/// Canonical bytes of an already-parsed JSON value.
pub fn value_to_canonical_bytes(value: &Value) -> Vec<u8> {
    let mut out = String::new();
    write_value(value, &mut out);
    out.into_bytes()
}

/// True when both values render to the same canonical bytes.
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    value_to_canonical_bytes(a) == value_to_canonical_bytes(b)
}

/// Hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Content address of `bytes`.
pub fn digest(bytes: &[u8]) -> ContentHash {
    ContentHash::from_hex(sha256_hex(bytes))
}

/// Human-readable form used for mutable documents (dispatch file,
/// aggregates): two-space indent, sorted keys, trailing newline.
pub fn to_pretty_sorted<T: Serialize + ?Sized>(value: &T) -> HarnessResult<String> {
    let v = sort_keys(serde_json::to_value(value)?);
    let mut out = serde_json::to_string_pretty(&v)?;
    out.push('\n');
    Ok(out)
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut sorted = Map::new();
            for (k, v) in entries {
                sorted.insert(k, sort_keys(v));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn write_value(v: &Value, out: &mut String) {
    match v {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(arr) => {
            out.push('[');
            for (i, item) in arr.iter().enumerate() {
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
    out.push('{');
    let mut keys: Vec<&String> = map.keys().collect();
    keys.sort();
    for (i, k) in keys.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_string(k, out);
        out.push(':');
        if let Some(val) = map.get(*k) {
            write_value(val, out);
        }
    }
    out.push('}');
}

fn write_string(s: &str, out: &mut String) {
    // Value::String's Display is the escaped, quoted JSON form.
    out.push_str(&Value::String(s.to_owned()).to_string());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sorts_keys_recursively_without_whitespace() {
        let value = json!({"b": 1, "a": {"z": true, "y": [3, {"d": null, "c": "x"}]}});
        let out = to_canonical_string(&value).unwrap();
        assert_eq!(out, r#"{"a":{"y":[3,{"c":"x","d":null}],"z":true},"b":1}"#);
    }

    #[test]
    fn keeps_floats_and_integers_distinct() {
        let value = json!({"ms": 12.5, "count": 3, "zero": 0.0});
        let out = to_canonical_string(&value).unwrap();
        assert_eq!(out, r#"{"count":3,"ms":12.5,"zero":0.0}"#);
    }

    #[test]
    fn escapes_strings() {
        let value = json!({"q": "a\"b\nc"});
        let out = to_canonical_string(&value).unwrap();
        assert_eq!(out, r#"{"q":"a\"b\nc"}"#);
    }

    #[test]
    fn line_form_appends_single_newline() {
        let line = to_canonical_line(&json!({"a": 1})).unwrap();
        assert_eq!(line, b"{\"a\":1}\n");
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_eq_ignores_formatting() {
        let a: Value = serde_json::from_str("{\n  \"b\": [1, 2],\n  \"a\": 1.5\n}").unwrap();
        let b: Value = serde_json::from_str(r#"{"a":1.5,"b":[1,2]}"#).unwrap();
        assert!(canonical_eq(&a, &b));
        let c: Value = serde_json::from_str(r#"{"a":1.5,"b":[2,1]}"#).unwrap();
        assert!(!canonical_eq(&a, &c));
    }

    #[test]
    fn pretty_sorted_has_trailing_newline_and_sorted_keys() {
        let out = to_pretty_sorted(&json!({"b": 1, "a": 2})).unwrap();
        assert_eq!(out, "{\n  \"a\": 2,\n  \"b\": 1\n}\n");
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;
        use std::collections::{BTreeMap, HashMap};

        proptest! {
            #[test]
            fn insertion_order_does_not_affect_canonical_output(
                pairs in prop::collection::vec(("[a-z]{1,8}", "[a-z0-9]{1,16}"), 1..10)
            ) {
                let hashmap: HashMap<String, String> = pairs.iter().cloned().collect();
                let btreemap: BTreeMap<String, String> = pairs.iter().cloned().collect();
                prop_assert_eq!(
                    to_canonical_bytes(&hashmap).unwrap(),
                    to_canonical_bytes(&btreemap).unwrap()
                );
            }

            #[test]
            fn canonical_bytes_survive_reparse(
                pairs in prop::collection::vec(("[a-z]{1,6}", -1.0e6f64..1.0e6), 0..8)
            ) {
                let map: BTreeMap<String, f64> = pairs.into_iter().collect();
                let bytes = to_canonical_bytes(&map).unwrap();
                let reparsed: Value = serde_json::from_slice(&bytes).unwrap();
                prop_assert_eq!(value_to_canonical_bytes(&reparsed), bytes);
            }
        }
    }
}
