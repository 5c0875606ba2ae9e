use thiserror::Error;

/// Errors surfaced by every layer of the store: collection CRUD, Merkle tree
/// maintenance, shard I/O, and the storage backends (plain and encrypting).
#[derive(Error, Debug)]
pub enum DbError {
    #[error("record '{0}' not found")]
    NotFound(String),

    #[error("record '{0}' already exists")]
    DuplicateId(String),

    #[error("shard '{0}' is corrupt: {1}")]
    CorruptShard(String, String),

    #[error("merkle tree at '{0}' is corrupt: {1}")]
    CorruptTree(String, String),

    #[error("unsupported format version {0} (expected {1})")]
    UnsupportedVersion(u32, u32),

    #[error("decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("no matching decryption key for hash {0}")]
    NoMatchingKey(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type DbResult<T> = Result<T, DbError>;

impl From<reqwest::Error> for DbError {
    fn from(err: reqwest::Error) -> Self {
        DbError::StorageUnavailable(err.to_string())
    }
}
