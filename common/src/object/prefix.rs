//! View of a storage restricted to keys under a prefix

use async_trait::async_trait;
use std::sync::Arc;

use super::{
    ByteStream, DirectoryLister, Entry, EntryStream, FileInfo, FileSystem, MultipartUpload,
    ObjectStorage, Part, Result, StorageClass, Symlinks,
};

const LIST_CHANNEL_SIZE: usize = 1000;

#[derive(Debug)]
pub struct WithPrefix {
    inner: Arc<dyn ObjectStorage>,
    prefix: String,
}

impl WithPrefix {
    pub fn new(inner: Arc<dyn ObjectStorage>, prefix: &str) -> Self {
        Self {
            inner,
            prefix: prefix.to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Translate an inner entry back; the entry of the prefix itself has no key in this view.
    fn strip(&self, mut entry: Entry) -> Option<Entry> {
        let key = entry.key.strip_prefix(&self.prefix)?;
        if key.is_empty() {
            return None;
        }
        entry.key = key.to_string();
        Some(entry)
    }
}

impl std::fmt::Display for WithPrefix {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.inner, self.prefix)
    }
}

#[async_trait]
impl ObjectStorage for WithPrefix {
    async fn head(&self, key: &str) -> Result<Entry> {
        let mut entry = self.inner.head(&self.key(key)).await?;
        entry.key = key.to_string();
        Ok(entry)
    }

    async fn get(&self, key: &str, off: u64, limit: Option<u64>) -> Result<ByteStream> {
        self.inner.get(&self.key(key), off, limit).await
    }

    async fn put(&self, key: &str, body: ByteStream) -> Result<()> {
        self.inner.put(&self.key(key), body).await
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        self.inner.copy(&self.key(dst), &self.key(src)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&self.key(key)).await
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<Entry>> {
        let marker = if marker.is_empty() {
            String::new()
        } else {
            self.key(marker)
        };
        let entries = self.inner.list(&self.key(prefix), &marker, limit).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| self.strip(entry))
            .collect())
    }

    async fn list_all(&self, prefix: &str, marker: &str) -> Result<EntryStream> {
        let marker = if marker.is_empty() {
            String::new()
        } else {
            self.key(marker)
        };
        let mut inner = self.inner.list_all(&self.key(prefix), &marker).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(LIST_CHANNEL_SIZE);
        let view_prefix = self.prefix.clone();
        tokio::spawn(async move {
            while let Some(item) = inner.recv().await {
                let item = match item {
                    Ok(mut entry) => match entry.key.strip_prefix(&view_prefix) {
                        Some(key) if !key.is_empty() => {
                            entry.key = key.to_string();
                            Ok(entry)
                        }
                        _ => continue,
                    },
                    Err(err) => Err(err),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<MultipartUpload> {
        self.inner.create_multipart_upload(&self.key(key)).await
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        num: u32,
        body: bytes::Bytes,
    ) -> Result<Part> {
        self.inner
            .upload_part(&self.key(key), upload_id, num, body)
            .await
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        self.inner
            .complete_upload(&self.key(key), upload_id, parts)
            .await
    }

    async fn abort_upload(&self, key: &str, upload_id: &str) {
        self.inner.abort_upload(&self.key(key), upload_id).await
    }

    fn as_file_system(&self) -> Option<&dyn FileSystem> {
        self.inner.as_file_system().map(|_| self as &dyn FileSystem)
    }

    fn as_symlinks(&self) -> Option<&dyn Symlinks> {
        self.inner.as_symlinks().map(|_| self as &dyn Symlinks)
    }

    fn as_storage_class(&self) -> Option<&dyn StorageClass> {
        self.inner.as_storage_class()
    }

    fn as_directory_lister(&self) -> Option<&dyn DirectoryLister> {
        self.inner
            .as_directory_lister()
            .map(|_| self as &dyn DirectoryLister)
    }

    fn as_prefixed(&self) -> Option<(&Arc<dyn ObjectStorage>, &str)> {
        Some((&self.inner, &self.prefix))
    }
}

fn unsupported() -> super::StorageError {
    super::StorageError::NotSupported
}

#[async_trait]
impl FileSystem for WithPrefix {
    async fn file_info(&self, key: &str) -> Result<FileInfo> {
        let fs = self.inner.as_file_system().ok_or_else(unsupported)?;
        fs.file_info(&self.key(key)).await
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        let fs = self.inner.as_file_system().ok_or_else(unsupported)?;
        fs.chmod(&self.key(key), mode).await
    }

    async fn chown(&self, key: &str, uid: u32, gid: u32) -> Result<()> {
        let fs = self.inner.as_file_system().ok_or_else(unsupported)?;
        fs.chown(&self.key(key), uid, gid).await
    }

    async fn chtimes(&self, key: &str, mtime: i64) -> Result<()> {
        let fs = self.inner.as_file_system().ok_or_else(unsupported)?;
        fs.chtimes(&self.key(key), mtime).await
    }
}

#[async_trait]
impl Symlinks for WithPrefix {
    async fn readlink(&self, key: &str) -> Result<String> {
        let links = self.inner.as_symlinks().ok_or_else(unsupported)?;
        links.readlink(&self.key(key)).await
    }

    async fn symlink(&self, target: &str, key: &str) -> Result<()> {
        let links = self.inner.as_symlinks().ok_or_else(unsupported)?;
        links.symlink(target, &self.key(key)).await
    }
}

#[async_trait]
impl DirectoryLister for WithPrefix {
    async fn list_delimited(&self, prefix: &str) -> Result<Vec<Entry>> {
        let lister = self.inner.as_directory_lister().ok_or_else(unsupported)?;
        let entries = lister.list_delimited(&self.key(prefix)).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| self.strip(entry))
            .collect())
    }
}
