//! Top-level handle: a named map of lazily-opened [`Collection`]s sharing one
//! [`Storage`] backend, with a database-level Merkle tree aggregating each
//! collection's root hash (spec §4.4).

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::collection::Collection;
use crate::config::DbConfig;
use crate::error::DbResult;
use crate::merkle::{decode_tree, encode_tree, Leaf, MerkleTree};
use crate::storage::Storage;

const DATABASE_TREE_MAGIC: &[u8; 4] = b"BDBT";
const DB_TREE_PATH: &str = "db.dat";

pub struct Database<S: Storage> {
    storage: Arc<S>,
    config: DbConfig,
    collections: DashMap<String, Arc<Collection<S>>>,
    tree: Mutex<MerkleTree>,
}

impl<S: Storage> Database<S> {
    pub async fn open(storage: Arc<S>, config: DbConfig) -> DbResult<Self> {
        let tree = match storage.read(DB_TREE_PATH).await? {
            Some(bytes) => match decode_tree(&bytes) {
                Ok((_, tree)) => tree,
                Err(e) => {
                    tracing::warn!(error = %e, "database tree unreadable, starting empty");
                    MerkleTree::new()
                }
            },
            None => MerkleTree::new(),
        };
        Ok(Database {
            storage,
            config,
            collections: DashMap::new(),
            tree: Mutex::new(tree),
        })
    }

    /// Lazily construct (or return the cached handle for) the named
    /// collection.
    pub async fn collection(&self, name: &str) -> DbResult<Arc<Collection<S>>> {
        if let Some(existing) = self.collections.get(name) {
            return Ok(existing.clone());
        }
        let collection = Arc::new(
            Collection::open(
                name,
                self.storage.clone(),
                self.config.max_cached_shards,
                self.config.max_records_per_shard,
            )
            .await?,
        );
        self.collections.insert(name.to_string(), collection.clone());
        Ok(collection)
    }

    /// Union of collections already opened in-process and collections that
    /// exist on disk but haven't been touched yet this session.
    pub async fn collections(&self) -> DbResult<Vec<String>> {
        let mut names: Vec<String> = self.collections.iter().map(|e| e.key().clone()).collect();
        let on_disk = self.storage.list_dirs("collections", 1000, None).await?;
        for name in on_disk.names {
            if !names.contains(&name) {
                names.push(name);
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Flush each cached collection's own state and drop the cache, then
    /// persist the database tree one last time.
    pub async fn close(&self) -> DbResult<()> {
        for entry in self.collections.iter() {
            entry.value().shutdown().await?;
        }
        self.collections.clear();
        Ok(())
    }

    /// Recompute and persist the database Merkle root: one leaf per open
    /// collection, aggregating each collection's own (already-consistent)
    /// root hash bottom-up (spec §4.4 "Merkle maintenance").
    pub async fn root_hash(&self) -> DbResult<[u8; 32]> {
        {
            let mut tree = self.tree.lock();
            for entry in self.collections.iter() {
                let name = entry.key().clone();
                let collection = entry.value();
                if collection.is_empty() {
                    tree.delete_item(&name);
                } else {
                    tree.add_item(Leaf {
                        name,
                        hash: collection.root_hash(),
                        length: 0,
                        last_modified: crate::collection::now_millis(),
                    });
                }
            }
        }
        self.persist_tree().await
    }

    async fn persist_tree(&self) -> DbResult<[u8; 32]> {
        let mut tree = self.tree.lock();
        let root = tree.root_hash();
        let encoded = encode_tree(DATABASE_TREE_MAGIC, &tree);
        drop(tree);
        self.storage.write(DB_TREE_PATH, None, encoded).await?;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalFsStorage;
    use crate::value::Value;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn open_db(dir: &TempDir) -> Database<LocalFsStorage> {
        let storage = Arc::new(LocalFsStorage::new(dir.path()));
        Database::open(storage, DbConfig::default()).await.unwrap()
    }

    #[tokio::test]
    async fn root_hash_reflects_collection_contents() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        let empty_root = db.root_hash().await.unwrap();

        let users = db.collection("users").await.unwrap();
        let mut fields = BTreeMap::new();
        fields.insert("_id".to_string(), Value::String("u1".to_string()));
        fields.insert("name".to_string(), Value::String("Alice".to_string()));
        users.insert_one(fields, 1).await.unwrap();

        let populated_root = db.root_hash().await.unwrap();
        assert_ne!(empty_root, populated_root);
    }

    #[tokio::test]
    async fn collections_lists_on_disk_and_in_memory_names() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir).await;
        let mut fields = BTreeMap::new();
        fields.insert("_id".to_string(), Value::String("u1".to_string()));
        db.collection("users").await.unwrap().insert_one(fields, 1).await.unwrap();
        db.root_hash().await.unwrap();
        db.close().await.unwrap();

        let storage = Arc::new(LocalFsStorage::new(dir.path()));
        let reopened = Database::open(storage, DbConfig::default()).await.unwrap();
        let names = reopened.collections().await.unwrap();
        assert!(names.contains(&"users".to_string()));
    }
}
