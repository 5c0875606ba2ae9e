//! A shard: the unit of storage that bounds up to `maxRecordsPerShard`
//! records sharing a 4-hex-character `_id` prefix bucket (spec §3, §4.1).

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

use crate::codec::{decode_record, encode_record};
use crate::error::{DbError, DbResult};
use crate::merkle::{Leaf, MerkleTree};
use crate::record::Record;

pub const SHARD_MAGIC: &[u8; 4] = b"BSH1";
pub const SHARD_FORMAT_VERSION: u32 = 1;

/// `shardId = lowercase_hex(sha256(_id))[0:4]` — 4096 possible shards,
/// uniformly distributed for random `_id`s regardless of an attacker's
/// choice of ID (spec §4.1).
pub fn shard_id_for(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.as_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..2])
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// In-memory state of one shard: its records keyed by `_id`, and whether
/// it has unflushed mutations.
#[derive(Debug, Clone, Default)]
pub struct Shard {
    pub id: String,
    records: BTreeMap<String, Record>,
    dirty: bool,
}

impl Shard {
    pub fn new(id: String) -> Self {
        Shard {
            id,
            records: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn get(&self, id: &str) -> Option<&Record> {
        self.records.get(id)
    }

    pub fn insert(&mut self, record: Record) -> DbResult<()> {
        if self.records.contains_key(&record.id) {
            return Err(DbError::DuplicateId(record.id));
        }
        self.records.insert(record.id.clone(), record);
        self.dirty = true;
        Ok(())
    }

    /// Returns `true` if any field changed.
    pub fn update(&mut self, id: &str, updates: &BTreeMap<String, crate::value::Value>, timestamp: i64) -> DbResult<bool> {
        let record = self.records.get_mut(id).ok_or_else(|| DbError::NotFound(id.to_string()))?;
        let changed = record.apply_update(updates, timestamp);
        if changed {
            self.dirty = true;
        }
        Ok(changed)
    }

    pub fn delete(&mut self, id: &str) -> bool {
        let removed = self.records.remove(id).is_some();
        if removed {
            self.dirty = true;
        }
        removed
    }

    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.records.values()
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Build the shard's binary file contents: the `BSH1` header followed by
    /// length-prefixed canonical document records. Built in a buffer and
    /// returned whole — callers issue a single `Storage.write` (spec §4.1:
    /// "the collection never writes partial data by policy").
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(SHARD_MAGIC);
        buf.extend_from_slice(&SHARD_FORMAT_VERSION.to_le_bytes());
        for record in self.records.values() {
            let encoded = encode_record(record);
            buf.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
            buf.extend_from_slice(&encoded);
        }
        buf
    }

    /// Parse a shard file, detecting truncation as `CorruptShard` per spec
    /// §4.1 ("a partial shard write... must be detected on read via a
    /// length check").
    pub fn decode(id: String, bytes: &[u8]) -> DbResult<Self> {
        if bytes.len() < 8 || &bytes[0..4] != SHARD_MAGIC {
            return Err(DbError::CorruptShard(id, "missing or bad magic".to_string()));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != SHARD_FORMAT_VERSION {
            return Err(DbError::UnsupportedVersion(version, SHARD_FORMAT_VERSION));
        }

        let mut records = BTreeMap::new();
        let mut pos = 8;
        while pos < bytes.len() {
            if pos + 4 > bytes.len() {
                return Err(DbError::CorruptShard(id, "truncated record length".to_string()));
            }
            let len = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if pos + len > bytes.len() {
                return Err(DbError::CorruptShard(id, "truncated record payload".to_string()));
            }
            let record = decode_record(&bytes[pos..pos + len])
                .map_err(|_| DbError::CorruptShard(id.clone(), "malformed record".to_string()))?;
            pos += len;
            records.insert(record.id.clone(), record);
        }

        Ok(Shard {
            id,
            records,
            dirty: false,
        })
    }

    /// Rebuild this shard's Merkle tree sibling from its current records.
    /// Leaves are `(name=_id, hash=sha256(canonical-json(fields)), length, lastModified)`.
    pub fn build_merkle_tree(&self) -> MerkleTree {
        let now = now_millis();
        let leaves = self.records.values().map(|record| {
            let content = crate::value::Value::Object(record.fields.clone());
            let encoded_len = encode_record(record).len() as u64;
            Leaf {
                name: record.id.clone(),
                hash: content.content_hash(),
                length: encoded_len,
                last_modified: now,
            }
        });
        MerkleTree::from_leaves(leaves.collect())
    }
}
