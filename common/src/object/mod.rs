//! Storage port consumed by the sync engine
//!
//! Every backend implements [`ObjectStorage`]. Optional features (POSIX permissions, symlinks,
//! storage classes, delimited listing) are separate capability traits which a backend exposes
//! through the `as_*` accessors. The engine asks for a capability once at setup and treats `None`
//! as "not supported" rather than calling methods that silently do nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub mod file;
pub mod mem;
pub mod prefix;

pub use file::FileStorage;
pub use mem::MemStorage;
pub use prefix::WithPrefix;

/// One listed storage key.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Entry {
    pub key: String,
    /// byte length, -1 for directory placeholders
    pub size: i64,
    /// last modification time in unix seconds
    pub mtime: i64,
    #[serde(rename = "IsDir")]
    pub is_prefix: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_symlink: bool,
}

impl Entry {
    pub fn file(key: impl Into<String>, size: i64, mtime: i64) -> Self {
        Self {
            key: key.into(),
            size,
            mtime,
            is_prefix: false,
            is_symlink: false,
        }
    }

    pub fn dir(key: impl Into<String>, mtime: i64) -> Self {
        Self {
            key: key.into(),
            size: -1,
            mtime,
            is_prefix: true,
            is_symlink: false,
        }
    }

    /// Number of data bytes, placeholders count as zero.
    pub fn data_size(&self) -> u64 {
        u64::try_from(self.size).unwrap_or(0)
    }
}

/// What should happen to a key; the wire default is a plain copy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    /// key is missing at the destination
    #[default]
    Copy,
    /// key exists at the destination and must be overwritten
    Update,
    /// sizes match, compare content and copy only on mismatch
    Verify,
    DeleteDst,
    /// key is already in sync, remove it from the source
    DeleteSrc,
    /// content is in sync but permissions differ
    #[serde(rename = "perms")]
    CopyPerms,
}

impl Action {
    fn is_copy(&self) -> bool {
        *self == Action::Copy
    }
}

/// Unit of pending work handed to the transfer pipeline, serialized as an [`Entry`] with an
/// optional `Action` field.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    #[serde(flatten)]
    pub entry: Entry,
    #[serde(rename = "Action", default, skip_serializing_if = "Action::is_copy")]
    pub action: Action,
}

impl Task {
    pub fn new(entry: Entry, action: Action) -> Self {
        Self { entry, action }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{0}: not found")]
    NotFound(String),
    #[error("operation not supported")]
    NotSupported,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl StorageError {
    pub fn io(error: std::io::Error, key: &str) -> Self {
        if error.kind() == std::io::ErrorKind::NotFound {
            StorageError::NotFound(key.to_string())
        } else {
            StorageError::Other(anyhow::Error::new(error).context(format!("key {key:?}")))
        }
    }

    /// True when `error` (or anything in its chain) is a missing key.
    pub fn is_not_found(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<StorageError>(),
            Some(StorageError::NotFound(_))
        )
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

pub type ByteStream = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

/// Unbounded listing, sorted by key; an `Err` item ends the listing.
pub type EntryStream = tokio::sync::mpsc::Receiver<Result<Entry>>;

#[derive(Clone, Debug)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub min_part_size: u64,
    pub max_count: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Part {
    pub num: u32,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStorage: std::fmt::Display + std::fmt::Debug + Send + Sync {
    async fn head(&self, key: &str) -> Result<Entry>;
    /// Read `limit` bytes (all remaining when `None`) starting at `off`.
    async fn get(&self, key: &str, off: u64, limit: Option<u64>) -> Result<ByteStream>;
    async fn put(&self, key: &str, body: ByteStream) -> Result<()>;
    /// Server side copy within this storage.
    async fn copy(&self, dst: &str, src: &str) -> Result<()>;
    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
    /// At most `limit` entries under `prefix` with keys greater than `marker`.
    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<Entry>>;
    async fn list_all(&self, prefix: &str, marker: &str) -> Result<EntryStream>;
    async fn create_multipart_upload(&self, key: &str) -> Result<MultipartUpload>;
    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        num: u32,
        body: bytes::Bytes,
    ) -> Result<Part>;
    async fn complete_upload(&self, key: &str, upload_id: &str, parts: &[Part]) -> Result<()>;
    async fn abort_upload(&self, key: &str, upload_id: &str);

    fn as_file_system(&self) -> Option<&dyn FileSystem> {
        None
    }
    fn as_symlinks(&self) -> Option<&dyn Symlinks> {
        None
    }
    fn as_storage_class(&self) -> Option<&dyn StorageClass> {
        None
    }
    fn as_directory_lister(&self) -> Option<&dyn DirectoryLister> {
        None
    }
    /// Underlying storage and key prefix when this storage is a view into another one.
    fn as_prefixed(&self) -> Option<(&std::sync::Arc<dyn ObjectStorage>, &str)> {
        None
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// POSIX attributes of stored keys.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn file_info(&self, key: &str) -> Result<FileInfo>;
    async fn chmod(&self, key: &str, mode: u32) -> Result<()>;
    async fn chown(&self, key: &str, uid: u32, gid: u32) -> Result<()>;
    async fn chtimes(&self, key: &str, mtime: i64) -> Result<()>;
}

#[async_trait]
pub trait Symlinks: Send + Sync {
    async fn readlink(&self, key: &str) -> Result<String>;
    async fn symlink(&self, target: &str, key: &str) -> Result<()>;
}

pub trait StorageClass: Send + Sync {
    fn set_storage_class(&self, class: &str) -> Result<()>;
}

/// Listing of the direct children of a prefix.
///
/// Results are sorted by key. Children that contain further keys are returned once as a
/// placeholder entry (`is_prefix`, key ending with `/`); a placeholder stored at exactly `prefix`
/// is returned as well.
#[async_trait]
pub trait DirectoryLister: Send + Sync {
    async fn list_delimited(&self, prefix: &str) -> Result<Vec<Entry>>;
}

/// Resolve prefixed views down to the storage that actually holds the data.
pub fn resolve(
    storage: &std::sync::Arc<dyn ObjectStorage>,
) -> (std::sync::Arc<dyn ObjectStorage>, String) {
    let mut current = storage.clone();
    let mut prefix = String::new();
    while let Some((inner, inner_prefix)) = current.as_prefixed() {
        prefix = format!("{inner_prefix}{prefix}");
        let inner = inner.clone();
        current = inner;
    }
    (current, prefix)
}

pub fn same_instance(
    a: &std::sync::Arc<dyn ObjectStorage>,
    b: &std::sync::Arc<dyn ObjectStorage>,
) -> bool {
    std::ptr::addr_eq(std::sync::Arc::as_ptr(a), std::sync::Arc::as_ptr(b))
}

pub(crate) fn unix_seconds(time: std::time::SystemTime) -> i64 {
    match time.duration_since(std::time::UNIX_EPOCH) {
        Ok(duration) => duration.as_secs() as i64,
        Err(err) => -(err.duration().as_secs() as i64),
    }
}
