//! A named map from `_id` to record, sharded by ID-prefix hash and backed by
//! a pluggable [`Storage`] (spec §3, §4.1).

mod crud;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::warn;

use crate::error::DbResult;
use crate::merkle::{decode_tree, encode_tree, Leaf, MerkleTree};
use crate::shard::Shard;
use crate::storage::Storage;

const SHARD_TREE_MAGIC: &[u8; 4] = b"COLT";
const COLLECTION_TREE_MAGIC: &[u8; 4] = b"COLT";

pub struct Collection<S: Storage> {
    pub(crate) name: String,
    pub(crate) storage: Arc<S>,
    pub(crate) max_records_per_shard: usize,
    pub(crate) shard_cache: Mutex<LruCache<String, Shard>>,
    pub(crate) tree: Mutex<MerkleTree>,
}

impl<S: Storage> Collection<S> {
    /// Open (or lazily create) the named collection, loading its persisted
    /// Merkle tree from `collection.dat` if present.
    pub async fn open(
        name: impl Into<String>,
        storage: Arc<S>,
        max_cached_shards: usize,
        max_records_per_shard: usize,
    ) -> DbResult<Self> {
        let name = name.into();
        let cap = NonZeroUsize::new(max_cached_shards.max(1)).unwrap();
        let collection = Collection {
            tree: Mutex::new(Self::load_tree(&storage, &name).await?),
            name,
            storage,
            max_records_per_shard,
            shard_cache: Mutex::new(LruCache::new(cap)),
        };
        Ok(collection)
    }

    async fn load_tree(storage: &S, name: &str) -> DbResult<MerkleTree> {
        match storage.read(&Self::collection_tree_path_for(name)).await? {
            Some(bytes) => match decode_tree(&bytes) {
                Ok((_, tree)) => Ok(tree),
                Err(e) => {
                    warn!(collection = name, error = %e, "collection tree unreadable, starting empty");
                    Ok(MerkleTree::new())
                }
            },
            None => Ok(MerkleTree::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn collection_dir(&self) -> String {
        format!("collections/{}", self.name)
    }

    fn collection_tree_path_for(name: &str) -> String {
        format!("collections/{name}/collection.dat")
    }

    fn collection_tree_path(&self) -> String {
        Self::collection_tree_path_for(&self.name)
    }

    fn shard_data_path(&self, shard_id: &str) -> String {
        format!("{}/shards/{}", self.collection_dir(), shard_id)
    }

    fn shard_tree_path(&self, shard_id: &str) -> String {
        format!("{}/shards/{}.dat", self.collection_dir(), shard_id)
    }

    /// Current collection-level Merkle root (rebuilding if the leaf set
    /// changed since the last build).
    pub fn root_hash(&self) -> [u8; 32] {
        self.tree.lock().root_hash()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.lock().is_empty()
    }

    /// Load a shard into the cache (transparently self-healing a missing or
    /// corrupt Merkle sibling, per spec §9 / Scenario D), returning nothing:
    /// callers look the shard back up via the cache after this resolves.
    async fn ensure_shard_loaded(&self, shard_id: &str) -> DbResult<()> {
        if self.shard_cache.lock().contains(shard_id) {
            return Ok(());
        }

        let data_path = self.shard_data_path(shard_id);
        let shard = match self.storage.read(&data_path).await? {
            Some(bytes) => Shard::decode(shard_id.to_string(), &bytes)?,
            None => Shard::new(shard_id.to_string()),
        };

        if !shard.is_empty() {
            self.heal_shard_tree_if_needed(shard_id, &shard).await?;
        }

        let evicted = self.shard_cache.lock().push(shard_id.to_string(), shard);
        if let Some((evicted_id, evicted_shard)) = evicted {
            if evicted_shard.is_dirty() {
                self.flush_shard_value(&evicted_id, evicted_shard).await?;
            }
        }
        Ok(())
    }

    async fn heal_shard_tree_if_needed(&self, shard_id: &str, shard: &Shard) -> DbResult<()> {
        let tree_path = self.shard_tree_path(shard_id);
        let needs_rebuild = match self.storage.read(&tree_path).await? {
            Some(bytes) => decode_tree(&bytes).is_err(),
            None => true,
        };
        if needs_rebuild {
            warn!(collection = %self.name, shard = shard_id, "shard merkle tree missing or unreadable, rebuilding from shard data");
            let tree = shard.build_merkle_tree();
            let encoded = encode_tree(SHARD_TREE_MAGIC, &tree);
            self.storage.write(&tree_path, None, encoded).await?;
        }
        Ok(())
    }

    /// Rebuild a shard's Merkle tree, write both the shard file and its
    /// sibling in one buffered pass, and update the collection-level leaf
    /// for it. Matches spec §4.1: "the collection never writes partial
    /// data... it builds the full shard bytes in a buffer, then issues a
    /// single Storage.write."
    async fn flush_shard_value(&self, shard_id: &str, mut shard: Shard) -> DbResult<()> {
        if shard.is_empty() {
            self.storage.delete_file(&self.shard_data_path(shard_id)).await?;
            self.storage.delete_file(&self.shard_tree_path(shard_id)).await?;
            self.tree.lock().delete_item(shard_id);
            self.persist_tree().await?;
            return Ok(());
        }

        let shard_tree = shard.build_merkle_tree();
        let mut shard_tree = shard_tree;
        let shard_root = shard_tree.root_hash();
        let leaf_count = shard.len() as u64;

        let shard_bytes = shard.encode();
        self.storage.write(&self.shard_data_path(shard_id), None, shard_bytes).await?;
        let tree_bytes = encode_tree(SHARD_TREE_MAGIC, &shard_tree);
        self.storage.write(&self.shard_tree_path(shard_id), None, tree_bytes).await?;

        shard.mark_clean();

        self.tree.lock().add_item(Leaf {
            name: shard_id.to_string(),
            hash: shard_root,
            length: leaf_count,
            last_modified: now_millis(),
        });
        self.persist_tree().await?;
        Ok(())
    }

    async fn flush_shard(&self, shard_id: &str) -> DbResult<()> {
        let shard = {
            let mut cache = self.shard_cache.lock();
            cache.get(shard_id).cloned()
        };
        if let Some(shard) = shard {
            self.flush_shard_value(shard_id, shard.clone()).await?;
            if let Some(cached) = self.shard_cache.lock().get_mut(shard_id) {
                cached.mark_clean();
            }
        }
        Ok(())
    }

    async fn persist_tree(&self) -> DbResult<()> {
        let encoded = {
            let mut tree = self.tree.lock();
            tree.root_hash();
            encode_tree(COLLECTION_TREE_MAGIC, &tree)
        };
        self.storage.write(&self.collection_tree_path(), None, encoded).await
    }

    /// Flush any shards still marked dirty (normally a no-op given this
    /// crate's flush-per-operation policy; exists for the retry path after a
    /// prior flush failed) and release the shard cache.
    pub async fn shutdown(&self) -> DbResult<()> {
        let dirty: Vec<(String, Shard)> = {
            let cache = self.shard_cache.lock();
            cache
                .iter()
                .filter(|(_, s)| s.is_dirty())
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };
        for (shard_id, shard) in dirty {
            self.flush_shard_value(&shard_id, shard).await?;
        }
        self.shard_cache.lock().clear();
        Ok(())
    }

    /// Record count and on-disk byte size per shard, reduced from the
    /// teacher's `CollectionStats` to the fields that make sense for a
    /// file-based store (no SST/memtable internals to report).
    pub async fn stats(&self) -> DbResult<CollectionStats> {
        let data_files = self.storage.list_files(&format!("{}/shards", self.collection_dir()), 4096, None).await?;
        let mut shards = Vec::new();
        let mut total_records = 0u64;
        let mut total_bytes = 0u64;
        for name in data_files.names {
            if name.ends_with(".dat") {
                continue;
            }
            let info = self.storage.info(&self.shard_data_path(&name)).await?;
            let bytes = info.map(|i| i.length).unwrap_or(0);
            let record_count = self.tree.lock().find_item_node(&name).map(|l| l.length).unwrap_or(0);
            total_records += record_count;
            total_bytes += bytes;
            shards.push(ShardStats {
                shard_id: name,
                record_count,
                storage_bytes: bytes,
            });
        }
        shards.sort_by(|a, b| a.shard_id.cmp(&b.shard_id));
        Ok(CollectionStats {
            name: self.name.clone(),
            shard_count: shards.len(),
            record_count: total_records,
            storage_bytes: total_bytes,
            shards,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ShardStats {
    pub shard_id: String,
    pub record_count: u64,
    pub storage_bytes: u64,
}

#[derive(Debug, Clone)]
pub struct CollectionStats {
    pub name: String,
    pub shard_count: usize,
    pub record_count: u64,
    pub storage_bytes: u64,
    pub shards: Vec<ShardStats>,
}

pub(crate) fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
