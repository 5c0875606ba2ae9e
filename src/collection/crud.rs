use std::collections::BTreeMap;

use crate::error::{DbError, DbResult};
use crate::record::Record;
use crate::shard::shard_id_for;
use crate::storage::Storage;
use crate::value::Value;

use super::Collection;

impl<S: Storage> Collection<S> {
    /// `insertOne`: `fields` must contain `_id`. Fails with `DuplicateId` if
    /// a record with that id already exists. Every scalar field is stamped
    /// with `timestamp`.
    pub async fn insert_one(&self, mut fields: BTreeMap<String, Value>, timestamp: i64) -> DbResult<Record> {
        let id = fields
            .remove("_id")
            .and_then(|v| v.as_str().map(str::to_string))
            .ok_or_else(|| DbError::NotFound("_id".to_string()))?;

        let shard_id = shard_id_for(&id);
        self.ensure_shard_loaded(&shard_id).await?;

        let record = {
            let mut cache = self.shard_cache.lock();
            let shard = cache.get_mut(&shard_id).expect("just loaded");
            if shard.get(&id).is_some() {
                return Err(DbError::DuplicateId(id));
            }
            let record = Record::new(id, fields, timestamp);
            shard.insert(record.clone())?;
            record
        };

        self.flush_shard(&shard_id).await?;
        Ok(record)
    }

    /// `updateOne`: merges `updates` into the existing record with
    /// last-writer-wins semantics. Returns whether any field changed.
    pub async fn update_one(&self, id: &str, updates: &BTreeMap<String, Value>, timestamp: i64) -> DbResult<bool> {
        let shard_id = shard_id_for(id);
        self.ensure_shard_loaded(&shard_id).await?;

        let changed = {
            let mut cache = self.shard_cache.lock();
            let shard = cache.get_mut(&shard_id).expect("just loaded");
            shard.update(id, updates, timestamp)?
        };

        if changed {
            self.flush_shard(&shard_id).await?;
        }
        Ok(changed)
    }

    /// `getOne`: lookup by `_id`.
    pub async fn get_one(&self, id: &str) -> DbResult<Option<Record>> {
        let shard_id = shard_id_for(id);
        self.ensure_shard_loaded(&shard_id).await?;
        let mut cache = self.shard_cache.lock();
        Ok(cache.get(&shard_id).and_then(|s| s.get(id)).cloned())
    }

    /// `deleteOne`: removes the record, emptying (and deleting) the shard if
    /// it was the last record in it. Returns `false`, not an error, if the
    /// record was already absent.
    pub async fn delete_one(&self, id: &str) -> DbResult<bool> {
        let shard_id = shard_id_for(id);
        self.ensure_shard_loaded(&shard_id).await?;

        let removed = {
            let mut cache = self.shard_cache.lock();
            let shard = cache.get_mut(&shard_id).expect("just loaded");
            shard.delete(id)
        };

        if removed {
            self.flush_shard(&shard_id).await?;
        }
        Ok(removed)
    }

    /// `getAll`: paginated iteration in ascending `_id` order. `cursor` is
    /// the last id returned by the previous page; `next` is `None` once
    /// iteration is complete.
    ///
    /// Shards are bucketed by ID-prefix hash, not ID range, so a global
    /// ordered scan has to visit every shard; this crate favors a simple,
    /// correct implementation over one optimized for very large collections.
    pub async fn get_all(&self, cursor: Option<&str>, limit: usize) -> DbResult<(Vec<Record>, Option<String>)> {
        let shard_ids = self.list_shard_ids().await?;
        let mut all: BTreeMap<String, Record> = BTreeMap::new();
        for shard_id in shard_ids {
            self.ensure_shard_loaded(&shard_id).await?;
            let mut cache = self.shard_cache.lock();
            if let Some(shard) = cache.get(&shard_id) {
                for record in shard.records() {
                    all.insert(record.id.clone(), record.clone());
                }
            }
        }

        let mut iter = all.into_iter();
        if let Some(cursor) = cursor {
            for (id, _) in iter.by_ref() {
                if id.as_str() > cursor {
                    break;
                }
            }
        }

        let page: Vec<Record> = iter.by_ref().take(limit).map(|(_, r)| r).collect();
        let next = if page.len() == limit {
            match iter.next() {
                Some(_) => page.last().map(|r| r.id.clone()),
                None => None,
            }
        } else {
            None
        };

        Ok((page, next))
    }

    async fn list_shard_ids(&self) -> DbResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut cursor = None;
        loop {
            let page = self
                .storage
                .list_files(&format!("collections/{}/shards", self.name), 1000, cursor.as_deref())
                .await?;
            ids.extend(page.names.into_iter().filter(|n| !n.ends_with(".dat")));
            match page.next {
                Some(c) => cursor = Some(c),
                None => break,
            }
        }
        Ok(ids)
    }
}
