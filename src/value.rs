use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A JSON-representable scalar or composite value stored in a record field.
///
/// `Object` is backed by a `BTreeMap` rather than a `HashMap` so canonical
/// (lexically sorted) key ordering falls out of the container itself instead
/// of a separate sort pass every time we hash or serialize a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int64(i64),
    Float64(f64),
    String(String),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Timestamp(i64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    /// Canonical encoding used as hashing input: sorted object keys (free, via
    /// `BTreeMap`) and fixed numeric formatting so hashing is platform-independent.
    pub fn canonical_json(&self) -> String {
        let mut out = String::new();
        self.write_canonical(&mut out);
        out
    }

    fn write_canonical(&self, out: &mut String) {
        match self {
            Value::Null => out.push_str("null"),
            Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
            Value::Int64(n) => out.push_str(&n.to_string()),
            Value::Float64(f) => out.push_str(&format_canonical_f64(*f)),
            Value::Timestamp(t) => out.push_str(&t.to_string()),
            Value::String(s) => write_json_string(s, out),
            Value::Bytes(b) => write_json_string(&BASE64.encode(b), out),
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    item.write_canonical(out);
                }
                out.push(']');
            }
            Value::Object(map) => {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_json_string(k, out);
                    out.push(':');
                    v.write_canonical(out);
                }
                out.push('}');
            }
        }
    }

    /// SHA-256 of the canonical encoding; used as a Merkle leaf hash.
    pub fn content_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.canonical_json().as_bytes());
        hasher.finalize().into()
    }
}

fn format_canonical_f64(f: f64) -> String {
    if f.fract() == 0.0 && f.is_finite() && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{}", f)
    }
}

fn write_json_string(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int64(i)
                } else {
                    Value::Float64(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(arr) => Value::Array(arr.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(obj) => {
                Value::Object(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int64(i) => serde_json::Value::Number(i.into()),
            Value::Timestamp(t) => serde_json::Value::Number(t.into()),
            Value::Float64(f) => serde_json::Number::from_f64(f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s),
            Value::Bytes(b) => serde_json::Value::String(BASE64.encode(b)),
            Value::Array(arr) => serde_json::Value::Array(arr.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                serde_json::Value::Object(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_json_sorts_object_keys() {
        let mut map = BTreeMap::new();
        map.insert("b".to_string(), Value::Int64(2));
        map.insert("a".to_string(), Value::Int64(1));
        let v = Value::Object(map);
        assert_eq!(v.canonical_json(), r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn canonical_json_is_deterministic() {
        let mut map = BTreeMap::new();
        map.insert("name".to_string(), Value::String("Alice".to_string()));
        map.insert("age".to_string(), Value::Int64(30));
        let v = Value::Object(map);
        assert_eq!(v.canonical_json(), v.clone().canonical_json());
        assert_eq!(v.content_hash(), v.content_hash());
    }

    #[test]
    fn content_hash_changes_on_value_change() {
        let a = Value::String("alice".to_string());
        let b = Value::String("bob".to_string());
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn json_round_trip() {
        let original = serde_json::json!({"a": 1, "b": [1, 2, "x"], "c": null});
        let v: Value = original.clone().into();
        let back: serde_json::Value = v.into();
        assert_eq!(original, back);
    }
}
