//! In-memory object storage
//!
//! Keys live in a sorted map. The backend supports server side copy, multipart uploads, storage
//! classes and delimited listing, and counts every mutating call so callers can check what reached
//! the storage.

use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;

use super::{
    ByteStream, DirectoryLister, Entry, EntryStream, MultipartUpload, ObjectStorage, Part,
    Result, StorageClass, StorageError,
};

const LIST_CHANNEL_SIZE: usize = 1000;

#[derive(Clone, Debug)]
struct Object {
    data: bytes::Bytes,
    mtime: i64,
    storage_class: Option<String>,
}

/// Counters of calls that reached the storage.
#[derive(Debug, Default)]
pub struct Calls {
    pub get: AtomicU64,
    pub put: AtomicU64,
    pub copy: AtomicU64,
    pub delete: AtomicU64,
    pub upload_part: AtomicU64,
    pub complete_upload: AtomicU64,
    pub abort_upload: AtomicU64,
}

impl Calls {
    /// Calls that modify stored data.
    pub fn mutations(&self) -> u64 {
        self.put.load(Ordering::Relaxed)
            + self.copy.load(Ordering::Relaxed)
            + self.delete.load(Ordering::Relaxed)
            + self.upload_part.load(Ordering::Relaxed)
            + self.complete_upload.load(Ordering::Relaxed)
    }
}

#[derive(Debug)]
pub struct MemStorage {
    name: String,
    objects: parking_lot::Mutex<BTreeMap<String, Object>>,
    uploads: parking_lot::Mutex<HashMap<String, BTreeMap<u32, bytes::Bytes>>>,
    storage_class: parking_lot::Mutex<Option<String>>,
    /// remaining injected failures per key, consumed by `get` and `put`
    failures: parking_lot::Mutex<HashMap<String, u32>>,
    server_side_copy: bool,
    multipart: bool,
    min_part_size: u64,
    next_upload: AtomicU64,
    pub calls: Calls,
}

impl MemStorage {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            objects: Default::default(),
            uploads: Default::default(),
            storage_class: Default::default(),
            failures: Default::default(),
            server_side_copy: true,
            multipart: true,
            min_part_size: 1,
            next_upload: AtomicU64::new(1),
            calls: Default::default(),
        }
    }

    /// Same storage with `copy` and multipart reported as not supported.
    pub fn basic(name: &str) -> Self {
        Self {
            server_side_copy: false,
            multipart: false,
            ..Self::new(name)
        }
    }

    pub fn insert(&self, key: &str, data: impl Into<bytes::Bytes>, mtime: i64) {
        self.objects.lock().insert(
            key.to_string(),
            Object {
                data: data.into(),
                mtime,
                storage_class: None,
            },
        );
    }

    pub fn data(&self, key: &str) -> Option<bytes::Bytes> {
        self.objects.lock().get(key).map(|object| object.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    pub fn object_storage_class(&self, key: &str) -> Option<String> {
        self.objects
            .lock()
            .get(key)
            .and_then(|object| object.storage_class.clone())
    }

    pub fn pending_uploads(&self) -> usize {
        self.uploads.lock().len()
    }

    /// Make the next `count` reads or writes of `key` fail.
    pub fn fail_next(&self, key: &str, count: u32) {
        self.failures.lock().insert(key.to_string(), count);
    }

    fn check_failure(&self, key: &str) -> Result<()> {
        let mut failures = self.failures.lock();
        if let Some(remaining) = failures.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Other(anyhow!("injected failure for {key:?}")));
            }
        }
        Ok(())
    }

    fn entry(key: &str, object: &Object) -> Entry {
        if key.ends_with('/') {
            Entry::dir(key, object.mtime)
        } else {
            Entry::file(key, object.data.len() as i64, object.mtime)
        }
    }

    fn store(&self, key: &str, data: bytes::Bytes) {
        let storage_class = self.storage_class.lock().clone();
        self.objects.lock().insert(
            key.to_string(),
            Object {
                data,
                mtime: super::unix_seconds(std::time::SystemTime::now()),
                storage_class,
            },
        );
    }
}

impl std::fmt::Display for MemStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mem://{}/", self.name)
    }
}

#[async_trait]
impl ObjectStorage for MemStorage {
    async fn head(&self, key: &str) -> Result<Entry> {
        let objects = self.objects.lock();
        let object = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(Self::entry(key, object))
    }

    async fn get(&self, key: &str, off: u64, limit: Option<u64>) -> Result<ByteStream> {
        self.calls.get.fetch_add(1, Ordering::Relaxed);
        self.check_failure(key)?;
        let data = self
            .data(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        let start = (off as usize).min(data.len());
        let end = match limit {
            Some(limit) => start.saturating_add(limit as usize).min(data.len()),
            None => data.len(),
        };
        Ok(Box::new(std::io::Cursor::new(data.slice(start..end))))
    }

    async fn put(&self, key: &str, mut body: ByteStream) -> Result<()> {
        self.calls.put.fetch_add(1, Ordering::Relaxed);
        self.check_failure(key)?;
        let mut buffer = Vec::new();
        body.read_to_end(&mut buffer)
            .await
            .map_err(|err| StorageError::io(err, key))?;
        self.store(key, buffer.into());
        Ok(())
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        if !self.server_side_copy {
            return Err(StorageError::NotSupported);
        }
        self.calls.copy.fetch_add(1, Ordering::Relaxed);
        let data = self
            .data(src)
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?;
        self.store(dst, data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.calls.delete.fetch_add(1, Ordering::Relaxed);
        self.objects.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<Entry>> {
        let objects = self.objects.lock();
        Ok(objects
            .iter()
            .filter(|(key, _)| key.starts_with(prefix) && key.as_str() > marker)
            .take(limit)
            .map(|(key, object)| Self::entry(key, object))
            .collect())
    }

    async fn list_all(&self, prefix: &str, marker: &str) -> Result<EntryStream> {
        let entries = self.list(prefix, marker, usize::MAX).await?;
        let (tx, rx) = tokio::sync::mpsc::channel(LIST_CHANNEL_SIZE);
        tokio::spawn(async move {
            for entry in entries {
                if tx.send(Ok(entry)).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<MultipartUpload> {
        if !self.multipart {
            return Err(StorageError::NotSupported);
        }
        let id = self.next_upload.fetch_add(1, Ordering::Relaxed);
        let upload_id = format!("{key}#{id}");
        self.uploads.lock().insert(upload_id.clone(), BTreeMap::new());
        Ok(MultipartUpload {
            upload_id,
            min_part_size: self.min_part_size,
            max_count: 10000,
        })
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        num: u32,
        body: bytes::Bytes,
    ) -> Result<Part> {
        self.calls.upload_part.fetch_add(1, Ordering::Relaxed);
        self.check_failure(key)?;
        let mut uploads = self.uploads.lock();
        let parts = uploads
            .get_mut(upload_id)
            .ok_or_else(|| StorageError::Other(anyhow!("unknown upload {upload_id}")))?;
        let size = body.len() as u64;
        parts.insert(num, body);
        Ok(Part {
            num,
            size,
            etag: format!("{upload_id}-{num}"),
        })
    }

    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()> {
        self.calls.complete_upload.fetch_add(1, Ordering::Relaxed);
        let uploaded = self
            .uploads
            .lock()
            .remove(upload_id)
            .ok_or_else(|| StorageError::Other(anyhow!("unknown upload {upload_id}")))?;
        let mut data = bytes::BytesMut::new();
        for part in parts {
            let body = uploaded.get(&part.num).ok_or_else(|| {
                StorageError::Other(anyhow!("part {} of {upload_id} was not uploaded", part.num))
            })?;
            data.extend_from_slice(body);
        }
        self.store(key, data.freeze());
        Ok(())
    }

    async fn abort_upload(&self, _key: &str, upload_id: &str) {
        self.calls.abort_upload.fetch_add(1, Ordering::Relaxed);
        self.uploads.lock().remove(upload_id);
    }

    fn as_storage_class(&self) -> Option<&dyn StorageClass> {
        Some(self)
    }

    fn as_directory_lister(&self) -> Option<&dyn DirectoryLister> {
        Some(self)
    }
}

impl StorageClass for MemStorage {
    fn set_storage_class(&self, class: &str) -> Result<()> {
        *self.storage_class.lock() = Some(class.to_string());
        Ok(())
    }
}

#[async_trait]
impl DirectoryLister for MemStorage {
    async fn list_delimited(&self, prefix: &str) -> Result<Vec<Entry>> {
        let objects = self.objects.lock();
        let mut entries: Vec<Entry> = Vec::new();
        for (key, object) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            match rest.find('/') {
                // key lives below a child prefix
                Some(pos) if pos + 1 < rest.len() => {
                    let child = &key[..prefix.len() + pos + 1];
                    if entries.last().map(|last| last.key.as_str()) != Some(child) {
                        entries.push(Entry::dir(child, object.mtime));
                    }
                }
                _ => entries.push(Self::entry(key, object)),
            }
        }
        Ok(entries)
    }
}
