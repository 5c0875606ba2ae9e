//! Pluggable byte-level storage abstraction (spec §4.3, §6.1): a flat
//! namespace of path-like keys, implemented over the local filesystem or an
//! S3-compatible object store, optionally wrapped in transparent hybrid
//! RSA/AES encryption.

pub mod crypto;
pub mod encrypting;
pub mod http_client;
pub mod local;
pub mod s3;

pub use encrypting::EncryptingStorage;
pub use local::LocalFsStorage;
pub use s3::S3Storage;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

use crate::error::DbResult;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub content_type: Option<String>,
    pub length: u64,
    pub last_modified: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub names: Vec<String>,
    pub next: Option<String>,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = DbResult<Bytes>> + Send>>;

/// A flat namespace of path-like keys with atomic whole-object writes.
///
/// `write`/`read` are the workhorse pair; `write_stream`/`read_stream` exist
/// for payloads too large to buffer in memory. All operations are suspension
/// points (spec §5) — everything else in this crate is synchronous.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn write(&self, path: &str, content_type: Option<&str>, data: Vec<u8>) -> DbResult<()>;

    async fn read(&self, path: &str) -> DbResult<Option<Vec<u8>>>;

    async fn write_stream(
        &self,
        path: &str,
        content_type: Option<&str>,
        stream: ByteStream,
    ) -> DbResult<()>;

    async fn read_stream(&self, path: &str) -> DbResult<ByteStream>;

    async fn info(&self, path: &str) -> DbResult<Option<ObjectInfo>>;

    async fn file_exists(&self, path: &str) -> DbResult<bool> {
        Ok(self.info(path).await?.is_some())
    }

    async fn delete_file(&self, path: &str) -> DbResult<()>;

    async fn list_files(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage>;

    async fn list_dirs(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage>;
}
