use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncWriteExt;

use crate::error::{DbError, DbResult};

use super::{ByteStream, ListPage, ObjectInfo, Storage};

/// Filesystem-backed [`Storage`]: every path-like key maps directly onto a
/// path under `root`, with parent directories created implicitly on write.
pub struct LocalFsStorage {
    root: PathBuf,
}

impl LocalFsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        LocalFsStorage { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Storage for LocalFsStorage {
    async fn write(&self, path: &str, _content_type: Option<&str>, data: Vec<u8>) -> DbResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Atomic whole-object replacement: write to a sibling temp file then
        // rename over the target rather than truncating it in place.
        let tmp = sibling_tmp_path(&full);
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> DbResult<Option<Vec<u8>>> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    async fn write_stream(
        &self,
        path: &str,
        _content_type: Option<&str>,
        mut stream: ByteStream,
    ) -> DbResult<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = sibling_tmp_path(&full);
        let mut file = tokio::fs::File::create(&tmp).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        drop(file);
        tokio::fs::rename(&tmp, &full).await?;
        Ok(())
    }

    async fn read_stream(&self, path: &str) -> DbResult<ByteStream> {
        let data = self
            .read(path)
            .await?
            .ok_or_else(|| DbError::NotFound(path.to_string()))?;
        let stream = futures::stream::once(async move { Ok(Bytes::from(data)) });
        Ok(Box::pin(stream))
    }

    async fn info(&self, path: &str) -> DbResult<Option<ObjectInfo>> {
        match tokio::fs::metadata(self.resolve(path)).await {
            Ok(meta) => {
                let last_modified = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_millis() as u64)
                    .unwrap_or(0);
                Ok(Some(ObjectInfo {
                    content_type: None,
                    length: meta.len(),
                    last_modified,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    async fn delete_file(&self, path: &str) -> DbResult<()> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DbError::Io(e)),
        }
    }

    async fn list_files(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        list_entries(&self.resolve(prefix), limit, cursor, false).await
    }

    async fn list_dirs(&self, prefix: &str, limit: usize, cursor: Option<&str>) -> DbResult<ListPage> {
        list_entries(&self.resolve(prefix), limit, cursor, true).await
    }
}

fn sibling_tmp_path(full: &Path) -> PathBuf {
    let file_name = full.file_name().and_then(|n| n.to_str()).unwrap_or("object");
    full.with_file_name(format!("{file_name}.tmp"))
}

async fn list_entries(dir: &Path, limit: usize, cursor: Option<&str>, dirs_only: bool) -> DbResult<ListPage> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(rd) => rd,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(ListPage::default());
        }
        Err(e) => return Err(DbError::Io(e)),
    };

    let mut names = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let file_type = entry.file_type().await?;
        if file_type.is_dir() != dirs_only {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();

    let start = match cursor {
        Some(c) => names.iter().position(|n| n.as_str() > c).unwrap_or(names.len()),
        None => 0,
    };
    let page: Vec<String> = names[start..].iter().take(limit).cloned().collect();
    let next = if start + page.len() < names.len() {
        page.last().cloned()
    } else {
        None
    };

    Ok(ListPage { names: page, next })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        storage.write("a/b.dat", None, b"hello".to_vec()).await.unwrap();
        let data = storage.read("a/b.dat").await.unwrap();
        assert_eq!(data, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn read_missing_returns_none() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        assert_eq!(storage.read("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        storage.write("f", None, b"x".to_vec()).await.unwrap();
        storage.delete_file("f").await.unwrap();
        storage.delete_file("f").await.unwrap();
        assert_eq!(storage.read("f").await.unwrap(), None);
    }

    #[tokio::test]
    async fn info_length_matches_content() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        storage.write("f", None, b"12345".to_vec()).await.unwrap();
        let info = storage.info("f").await.unwrap().unwrap();
        assert_eq!(info.length, 5);
    }

    #[tokio::test]
    async fn list_files_excludes_dirs() {
        let dir = TempDir::new().unwrap();
        let storage = LocalFsStorage::new(dir.path());
        storage.write("shards/a", None, b"1".to_vec()).await.unwrap();
        tokio::fs::create_dir_all(dir.path().join("shards/sub")).await.unwrap();
        let page = storage.list_files("shards", 10, None).await.unwrap();
        assert_eq!(page.names, vec!["a".to_string()]);
    }
}
