//! Runtime configuration (spec §6.5), grounded on the teacher's
//! `main.rs`/CLI-args pattern: a plain struct constructed programmatically by
//! library callers, with the demo binary layering environment and CLI
//! overrides on top via `dotenvy`/`clap`.

use std::collections::HashMap;
use std::path::PathBuf;

use rsa::{RsaPrivateKey, RsaPublicKey};

pub type DecryptionKeyMap = HashMap<String, RsaPrivateKey>;

#[derive(Clone)]
pub struct DbConfig {
    /// LRU capacity for a collection's resident shard cache.
    pub max_cached_shards: usize,
    /// Soft cap on records per shard before a future rebalance would be
    /// warranted; this crate does not yet split overfull shards (spec §9).
    pub max_records_per_shard: usize,
    /// Public key new writes are encrypted under; `None` disables encryption.
    pub encryption_public_key: Option<RsaPublicKey>,
    /// Private keys available for decrypting existing ciphertexts, keyed by
    /// the hex SHA-256 of the corresponding public key's DER encoding, plus
    /// a `"default"` entry for legacy (headerless) payloads.
    pub decryption_key_map: DecryptionKeyMap,
    /// Root directory for a [`crate::storage::LocalFsStorage`] backend.
    pub root_path: PathBuf,
    /// Worker count for the database's [`crate::queue::TaskQueue`].
    pub worker_count: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig {
            max_cached_shards: 256,
            max_records_per_shard: 10_000,
            encryption_public_key: None,
            decryption_key_map: DecryptionKeyMap::new(),
            root_path: PathBuf::from("./data"),
            worker_count: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let config = DbConfig::default();
        assert!(config.max_cached_shards > 0);
        assert!(config.max_records_per_shard > 0);
        assert!(config.worker_count > 0);
        assert!(config.encryption_public_key.is_none());
    }
}
