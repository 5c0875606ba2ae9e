//! Canonical binary document encoding used inside shard files (spec'd on-disk
//! format, §6.2): a self-describing, BSON-equivalent encoding with typed
//! key/value pairs, little-endian lengths, and null-terminated strings.

use std::collections::BTreeMap;

use crate::error::{DbError, DbResult};
use crate::record::{MetaNode, Record};
use crate::value::Value;

pub const DOC_FORMAT_VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT64: u8 = 0x02;
const TAG_FLOAT64: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_ARRAY: u8 = 0x06;
const TAG_OBJECT: u8 = 0x07;
const TAG_TIMESTAMP: u8 = 0x08;

fn write_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
    buf.extend_from_slice(bytes);
    buf.push(0); // null terminator, matching the spec's string framing
}

fn read_len_prefixed<'a>(bytes: &'a [u8], pos: &mut usize) -> DbResult<&'a [u8]> {
    if *pos + 4 > bytes.len() {
        return Err(DbError::CorruptShard(
            String::new(),
            "truncated length prefix".to_string(),
        ));
    }
    let len = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap()) as usize;
    *pos += 4;
    if *pos + len + 1 > bytes.len() {
        return Err(DbError::CorruptShard(
            String::new(),
            "truncated field payload".to_string(),
        ));
    }
    let slice = &bytes[*pos..*pos + len];
    *pos += len + 1; // skip payload plus null terminator
    Ok(slice)
}

fn encode_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.push(TAG_NULL),
        Value::Bool(b) => {
            buf.push(TAG_BOOL);
            buf.push(if *b { 1 } else { 0 });
        }
        Value::Int64(n) => {
            buf.push(TAG_INT64);
            buf.extend_from_slice(&n.to_le_bytes());
        }
        Value::Float64(f) => {
            buf.push(TAG_FLOAT64);
            buf.extend_from_slice(&f.to_le_bytes());
        }
        Value::Timestamp(t) => {
            buf.push(TAG_TIMESTAMP);
            buf.extend_from_slice(&t.to_le_bytes());
        }
        Value::String(s) => {
            buf.push(TAG_STRING);
            write_len_prefixed(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.push(TAG_BYTES);
            write_len_prefixed(buf, b);
        }
        Value::Array(items) => {
            buf.push(TAG_ARRAY);
            buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                encode_value(buf, item);
            }
        }
        Value::Object(map) => {
            buf.push(TAG_OBJECT);
            buf.extend_from_slice(&(map.len() as u32).to_le_bytes());
            for (key, val) in map {
                write_len_prefixed(buf, key.as_bytes());
                encode_value(buf, val);
            }
        }
    }
}

fn decode_value(bytes: &[u8], pos: &mut usize) -> DbResult<Value> {
    if *pos >= bytes.len() {
        return Err(DbError::CorruptShard(
            String::new(),
            "truncated value tag".to_string(),
        ));
    }
    let tag = bytes[*pos];
    *pos += 1;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => {
            let b = *bytes.get(*pos).ok_or_else(|| {
                DbError::CorruptShard(String::new(), "truncated bool".to_string())
            })?;
            *pos += 1;
            Ok(Value::Bool(b != 0))
        }
        TAG_INT64 => {
            let n = read_i64(bytes, pos)?;
            Ok(Value::Int64(n))
        }
        TAG_TIMESTAMP => {
            let t = read_i64(bytes, pos)?;
            Ok(Value::Timestamp(t))
        }
        TAG_FLOAT64 => {
            if *pos + 8 > bytes.len() {
                return Err(DbError::CorruptShard(
                    String::new(),
                    "truncated float".to_string(),
                ));
            }
            let f = f64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
            *pos += 8;
            Ok(Value::Float64(f))
        }
        TAG_STRING => {
            let raw = read_len_prefixed(bytes, pos)?;
            let s = String::from_utf8(raw.to_vec())
                .map_err(|e| DbError::CorruptShard(String::new(), e.to_string()))?;
            Ok(Value::String(s))
        }
        TAG_BYTES => {
            let raw = read_len_prefixed(bytes, pos)?;
            Ok(Value::Bytes(raw.to_vec()))
        }
        TAG_ARRAY => {
            let count = read_u32(bytes, pos)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode_value(bytes, pos)?);
            }
            Ok(Value::Array(items))
        }
        TAG_OBJECT => {
            let count = read_u32(bytes, pos)?;
            let mut map = BTreeMap::new();
            for _ in 0..count {
                let key_raw = read_len_prefixed(bytes, pos)?;
                let key = String::from_utf8(key_raw.to_vec())
                    .map_err(|e| DbError::CorruptShard(String::new(), e.to_string()))?;
                let val = decode_value(bytes, pos)?;
                map.insert(key, val);
            }
            Ok(Value::Object(map))
        }
        other => Err(DbError::UnsupportedVersion(other as u32, DOC_FORMAT_VERSION as u32)),
    }
}

fn read_u32(bytes: &[u8], pos: &mut usize) -> DbResult<u32> {
    if *pos + 4 > bytes.len() {
        return Err(DbError::CorruptShard(String::new(), "truncated u32".to_string()));
    }
    let v = u32::from_le_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
    *pos += 4;
    Ok(v)
}

fn read_i64(bytes: &[u8], pos: &mut usize) -> DbResult<i64> {
    if *pos + 8 > bytes.len() {
        return Err(DbError::CorruptShard(String::new(), "truncated i64".to_string()));
    }
    let v = i64::from_le_bytes(bytes[*pos..*pos + 8].try_into().unwrap());
    *pos += 8;
    Ok(v)
}

fn meta_to_value(meta: &MetaNode) -> Value {
    let mut map = BTreeMap::new();
    map.insert(
        "timestamp".to_string(),
        match meta.timestamp {
            Some(t) => Value::Int64(t),
            None => Value::Null,
        },
    );
    let mut fields = BTreeMap::new();
    for (k, v) in &meta.fields {
        fields.insert(k.clone(), meta_to_value(v));
    }
    map.insert("fields".to_string(), Value::Object(fields));
    Value::Object(map)
}

fn value_to_meta(value: &Value) -> MetaNode {
    let obj = match value.as_object() {
        Some(o) => o,
        None => return MetaNode::default(),
    };
    let timestamp = match obj.get("timestamp") {
        Some(Value::Int64(t)) => Some(*t),
        _ => None,
    };
    let mut fields = BTreeMap::new();
    if let Some(Value::Object(raw_fields)) = obj.get("fields") {
        for (k, v) in raw_fields {
            fields.insert(k.clone(), value_to_meta(v));
        }
    }
    MetaNode { timestamp, fields }
}

/// Encode a record as canonical document bytes: version byte, id, field
/// object, metadata tree.
pub fn encode_record(record: &Record) -> Vec<u8> {
    let mut buf = Vec::new();
    buf.push(DOC_FORMAT_VERSION);
    write_len_prefixed(&mut buf, record.id.as_bytes());
    encode_value(&mut buf, &Value::Object(record.fields.clone()));
    encode_value(&mut buf, &meta_to_value(&record.metadata));
    buf
}

pub fn decode_record(bytes: &[u8]) -> DbResult<Record> {
    if bytes.is_empty() {
        return Err(DbError::CorruptShard(String::new(), "empty record bytes".to_string()));
    }
    let version = bytes[0];
    if version != DOC_FORMAT_VERSION {
        return Err(DbError::UnsupportedVersion(
            version as u32,
            DOC_FORMAT_VERSION as u32,
        ));
    }
    let mut pos = 1;
    let id_raw = read_len_prefixed(bytes, &mut pos)?;
    let id = String::from_utf8(id_raw.to_vec())
        .map_err(|e| DbError::CorruptShard(String::new(), e.to_string()))?;
    let fields_value = decode_value(bytes, &mut pos)?;
    let fields = match fields_value {
        Value::Object(map) => map,
        _ => {
            return Err(DbError::CorruptShard(
                id,
                "field payload is not an object".to_string(),
            ))
        }
    };
    let metadata = if pos < bytes.len() {
        value_to_meta(&decode_value(bytes, &mut pos)?)
    } else {
        MetaNode::default()
    };
    Ok(Record {
        id,
        fields,
        metadata,
    })
}
