use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Per-field write timestamps, mirroring a record's field structure so that
/// last-writer-wins merges can be resolved field by field rather than whole-record.
///
/// A leaf `MetaNode` (no nested `fields`) records when that scalar was last
/// written. An internal one additionally tracks nested objects recursively.
/// A timestamp entry with no corresponding record field represents a deletion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetaNode {
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub fields: BTreeMap<String, MetaNode>,
}

impl MetaNode {
    pub fn leaf(timestamp: i64) -> Self {
        MetaNode {
            timestamp: Some(timestamp),
            fields: BTreeMap::new(),
        }
    }

    fn field_timestamp(&self, field: &str) -> Option<i64> {
        self.fields.get(field).and_then(|m| m.timestamp)
    }
}

/// A document: `_id` plus arbitrary user fields plus the parallel metadata
/// tree used to resolve concurrent field-level writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
    #[serde(default)]
    pub metadata: MetaNode,
}

impl Record {
    /// Build a fresh record, stamping every top-level scalar field with
    /// `timestamp` (the operation time of the `insertOne` that created it).
    pub fn new(id: String, mut fields: BTreeMap<String, Value>, timestamp: i64) -> Self {
        fields.remove("_id");
        let mut meta = MetaNode {
            timestamp: Some(timestamp),
            fields: BTreeMap::new(),
        };
        for key in fields.keys() {
            meta.fields.insert(key.clone(), MetaNode::leaf(timestamp));
        }
        Record {
            id,
            fields,
            metadata: meta,
        }
    }

    /// Apply `updates` with last-writer-wins semantics at `timestamp`.
    ///
    /// Each key in `updates` either sets a scalar (deleting the old value if
    /// the new one is `Value::Null`) or recurses into a nested object. A
    /// field only advances if `timestamp` is strictly newer than the field's
    /// existing metadata timestamp (older-loses). Returns whether any field
    /// actually changed.
    pub fn apply_update(&mut self, updates: &BTreeMap<String, Value>, timestamp: i64) -> bool {
        let mut changed = false;
        for (key, new_value) in updates {
            let existing_ts = self.metadata.field_timestamp(key);
            if let Some(ts) = existing_ts {
                if ts >= timestamp {
                    continue;
                }
            }

            match new_value {
                Value::Null => {
                    if self.fields.remove(key).is_some() {
                        changed = true;
                    }
                }
                Value::Object(new_obj) => {
                    let existing_node = self.metadata.fields.entry(key.clone()).or_default();
                    let entry = self
                        .fields
                        .entry(key.clone())
                        .or_insert_with(|| Value::Object(BTreeMap::new()));
                    if let Value::Object(existing_obj) = entry {
                        if merge_object(existing_obj, existing_node, new_obj, timestamp) {
                            changed = true;
                        }
                    } else {
                        *entry = Value::Object(new_obj.clone());
                        changed = true;
                    }
                }
                other => {
                    if self.fields.get(key) != Some(other) {
                        self.fields.insert(key.clone(), other.clone());
                        changed = true;
                    }
                }
            }

            self.metadata
                .fields
                .insert(key.clone(), MetaNode::leaf(timestamp));
        }
        if changed {
            self.metadata.timestamp = Some(timestamp);
        }
        changed
    }
}

fn merge_object(
    existing: &mut BTreeMap<String, Value>,
    meta: &mut MetaNode,
    updates: &BTreeMap<String, Value>,
    timestamp: i64,
) -> bool {
    let mut changed = false;
    for (key, new_value) in updates {
        let existing_ts = meta.field_timestamp(key);
        if let Some(ts) = existing_ts {
            if ts >= timestamp {
                continue;
            }
        }
        match new_value {
            Value::Null => {
                if existing.remove(key).is_some() {
                    changed = true;
                }
            }
            Value::Object(nested) => {
                let nested_meta = meta.fields.entry(key.clone()).or_default();
                let entry = existing
                    .entry(key.clone())
                    .or_insert_with(|| Value::Object(BTreeMap::new()));
                if let Value::Object(existing_nested) = entry {
                    if merge_object(existing_nested, nested_meta, nested, timestamp) {
                        changed = true;
                    }
                } else {
                    *entry = Value::Object(nested.clone());
                    changed = true;
                }
            }
            other => {
                if existing.get(key) != Some(other) {
                    existing.insert(key.clone(), other.clone());
                    changed = true;
                }
            }
        }
        meta.fields.insert(key.clone(), MetaNode::leaf(timestamp));
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(pairs: &[(&str, Value)]) -> BTreeMap<String, Value> {
        pairs.iter().cloned().map(|(k, v)| (k.to_string(), v)).collect()
    }

    #[test]
    fn update_respects_older_loses() {
        let mut record = Record::new("r".to_string(), fields(&[("a", Value::Int64(1))]), 100);
        let changed = record.apply_update(&fields(&[("a", Value::Int64(2))]), 50);
        assert!(!changed);
        assert_eq!(record.fields.get("a"), Some(&Value::Int64(1)));

        let changed = record.apply_update(&fields(&[("a", Value::Int64(3))]), 200);
        assert!(changed);
        assert_eq!(record.fields.get("a"), Some(&Value::Int64(3)));
    }

    #[test]
    fn update_with_null_deletes_field() {
        let mut record = Record::new("r".to_string(), fields(&[("a", Value::Int64(1))]), 100);
        let changed = record.apply_update(&fields(&[("a", Value::Null)]), 200);
        assert!(changed);
        assert!(!record.fields.contains_key("a"));
    }

    #[test]
    fn update_merges_nested_objects() {
        let mut nested = BTreeMap::new();
        nested.insert("x".to_string(), Value::Int64(1));
        let mut record = Record::new(
            "r".to_string(),
            fields(&[("obj", Value::Object(nested))]),
            100,
        );
        let mut patch = BTreeMap::new();
        patch.insert("y".to_string(), Value::Int64(2));
        let changed = record.apply_update(&fields(&[("obj", Value::Object(patch))]), 200);
        assert!(changed);
        let obj = record.fields.get("obj").unwrap().as_object().unwrap();
        assert_eq!(obj.get("x"), Some(&Value::Int64(1)));
        assert_eq!(obj.get("y"), Some(&Value::Int64(2)));
    }
}
