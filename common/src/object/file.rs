//! Local filesystem storage
//!
//! Keys are `/` separated paths relative to the root directory; directories are listed as
//! placeholders whose key ends with `/`. Writes go to a temporary file in the target directory
//! which is then renamed into place, so readers never observe partially written objects.

use anyhow::anyhow;
use async_recursion::async_recursion;
use async_trait::async_trait;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use super::{
    ByteStream, DirectoryLister, Entry, EntryStream, FileInfo, FileSystem, MultipartUpload,
    ObjectStorage, Part, Result, StorageError, Symlinks,
};

const LIST_CHANNEL_SIZE: usize = 1000;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
    follow_links: bool,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            follow_links: true,
        }
    }

    /// When following links (the default) symlinked files are listed and read as regular files
    /// and symlinked directories are skipped; otherwise symlinks are listed as such.
    pub fn with_follow_links(mut self, follow_links: bool) -> Self {
        self.follow_links = follow_links;
        self
    }

    fn path(&self, key: &str) -> PathBuf {
        path_of(&self.root, key)
    }
}

fn path_of(root: &Path, key: &str) -> PathBuf {
    let relative = key.trim_end_matches('/');
    if relative.is_empty() {
        root.to_path_buf()
    } else {
        root.join(relative)
    }
}

/// Directory part of a prefix, including the trailing `/`.
fn dir_key(prefix: &str) -> &str {
    match prefix.rfind('/') {
        Some(pos) => &prefix[..=pos],
        None => "",
    }
}

fn entry_from(key: String, md: &std::fs::Metadata) -> Entry {
    let mtime = md.modified().map(super::unix_seconds).unwrap_or(0);
    if md.is_dir() {
        let key = if key.is_empty() || key.ends_with('/') {
            key
        } else {
            format!("{key}/")
        };
        Entry::dir(key, mtime)
    } else {
        Entry {
            key,
            size: md.len() as i64,
            mtime,
            is_prefix: false,
            is_symlink: md.file_type().is_symlink(),
        }
    }
}

/// Metadata of `path`, following a symlink only when asked to and only to a non-directory.
async fn metadata(path: &Path, follow_links: bool) -> std::io::Result<Option<std::fs::Metadata>> {
    let lmd = tokio::fs::symlink_metadata(path).await?;
    if !follow_links || !lmd.file_type().is_symlink() {
        return Ok(Some(lmd));
    }
    match tokio::fs::metadata(path).await {
        Ok(md) if md.is_dir() => {
            tracing::warn!("skipping symlink to directory {:?}", path);
            Ok(None)
        }
        Ok(md) => Ok(Some(md)),
        // dangling link, report the link itself
        Err(_) => Ok(Some(lmd)),
    }
}

/// Children of the directory `dir_key`, sorted by key; a missing directory has no children.
async fn read_children(
    root: &Path,
    dir_key: &str,
    follow_links: bool,
) -> Result<Vec<(String, std::fs::Metadata)>> {
    let dir = path_of(root, dir_key);
    let mut read_dir = match tokio::fs::read_dir(&dir).await {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(err) => return Err(StorageError::io(err, dir_key)),
    };
    let mut children = Vec::new();
    while let Some(item) = read_dir
        .next_entry()
        .await
        .map_err(|err| StorageError::io(err, dir_key))?
    {
        let name = match item.file_name().into_string() {
            Ok(name) => name,
            Err(name) => {
                tracing::warn!("skipping non UTF-8 file name {:?} in {:?}", name, dir);
                continue;
            }
        };
        let md = match metadata(&item.path(), follow_links).await {
            Ok(Some(md)) => md,
            Ok(None) => continue,
            // removed since it was listed
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(StorageError::io(err, &format!("{dir_key}{name}"))),
        };
        let key = if md.is_dir() {
            format!("{dir_key}{name}/")
        } else {
            format!("{dir_key}{name}")
        };
        children.push((key, md));
    }
    children.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(children)
}

type EntrySender = tokio::sync::mpsc::Sender<Result<Entry>>;

/// Depth-first walk emitting keys in sorted order; returns false once the listing must stop.
#[async_recursion]
async fn walk(
    root: &Path,
    follow_links: bool,
    dir_key: &str,
    prefix: &str,
    marker: &str,
    tx: &EntrySender,
) -> bool {
    let children = match read_children(root, dir_key, follow_links).await {
        Ok(children) => children,
        Err(err) => {
            let _ = tx.send(Err(err)).await;
            return false;
        }
    };
    for (key, md) in children {
        if md.is_dir() {
            if !key.starts_with(prefix) && !prefix.starts_with(&key) {
                continue;
            }
            if key.starts_with(prefix)
                && key.as_str() > marker
                && tx.send(Ok(entry_from(key.clone(), &md))).await.is_err()
            {
                return false;
            }
            if (key.as_str() > marker || marker.starts_with(&key))
                && !walk(root, follow_links, &key, prefix, marker, tx).await
            {
                return false;
            }
        } else if key.starts_with(prefix)
            && key.as_str() > marker
            && tx.send(Ok(entry_from(key, &md))).await.is_err()
        {
            return false;
        }
    }
    true
}

impl std::fmt::Display for FileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let root = self.root.display().to_string();
        if root.ends_with('/') {
            write!(f, "file://{root}")
        } else {
            write!(f, "file://{root}/")
        }
    }
}

#[async_trait]
impl ObjectStorage for FileStorage {
    async fn head(&self, key: &str) -> Result<Entry> {
        match metadata(&self.path(key), self.follow_links).await {
            Ok(Some(md)) => Ok(entry_from(key.to_string(), &md)),
            Ok(None) => Err(StorageError::NotFound(key.to_string())),
            Err(err) => Err(StorageError::io(err, key)),
        }
    }

    async fn get(&self, key: &str, off: u64, limit: Option<u64>) -> Result<ByteStream> {
        let path = self.path(key);
        if key.ends_with('/') {
            return Ok(Box::new(tokio::io::empty()));
        }
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|err| StorageError::io(err, key))?;
        if off > 0 {
            file.seek(std::io::SeekFrom::Start(off))
                .await
                .map_err(|err| StorageError::io(err, key))?;
        }
        Ok(match limit {
            Some(limit) => Box::new(file.take(limit)),
            None => Box::new(file),
        })
    }

    async fn put(&self, key: &str, mut body: ByteStream) -> Result<()> {
        let path = self.path(key);
        if key.ends_with('/') {
            return tokio::fs::create_dir_all(&path)
                .await
                .map_err(|err| StorageError::io(err, key));
        }
        let (parent, name) = match (path.parent(), path.file_name()) {
            (Some(parent), Some(name)) => (parent.to_path_buf(), name.to_string_lossy()),
            _ => return Err(StorageError::Other(anyhow!("invalid key {key:?}"))),
        };
        tokio::fs::create_dir_all(&parent)
            .await
            .map_err(|err| StorageError::io(err, key))?;
        let tmp = parent.join(format!(
            ".{}.tmp.{}.{}",
            name,
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let written = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            tokio::io::copy(&mut body, &mut file).await?;
            file.flush().await?;
            tokio::fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(err) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(err, key));
        }
        Ok(())
    }

    async fn copy(&self, dst: &str, src: &str) -> Result<()> {
        if src.ends_with('/') {
            return self.put(dst, Box::new(tokio::io::empty())).await;
        }
        let dst_path = self.path(dst);
        if let Some(parent) = dst_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(err, dst))?;
        }
        tokio::fs::copy(self.path(src), &dst_path)
            .await
            .map_err(|err| StorageError::io(err, src))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.path(key);
        let md = match tokio::fs::symlink_metadata(&path).await {
            Ok(md) => md,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StorageError::io(err, key)),
        };
        let removed = if md.is_dir() {
            tokio::fs::remove_dir(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                Err(StorageError::io(err, key))
            }
            _ => Ok(()),
        }
    }

    async fn list(&self, prefix: &str, marker: &str, limit: usize) -> Result<Vec<Entry>> {
        let mut rx = self.list_all(prefix, marker).await?;
        let mut entries = Vec::new();
        while entries.len() < limit {
            match rx.recv().await {
                Some(entry) => entries.push(entry?),
                None => break,
            }
        }
        Ok(entries)
    }

    async fn list_all(&self, prefix: &str, marker: &str) -> Result<EntryStream> {
        let (tx, rx) = tokio::sync::mpsc::channel(LIST_CHANNEL_SIZE);
        let root = self.root.clone();
        let follow_links = self.follow_links;
        let prefix = prefix.to_string();
        let marker = marker.to_string();
        tokio::spawn(async move {
            let start = dir_key(&prefix);
            if !start.is_empty() && start == prefix && start > marker.as_str() {
                match metadata(&path_of(&root, start), follow_links).await {
                    Ok(Some(md)) if md.is_dir() => {
                        if tx.send(Ok(entry_from(start.to_string(), &md))).await.is_err() {
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => return,
                    Err(err) => {
                        let _ = tx.send(Err(StorageError::io(err, start))).await;
                        return;
                    }
                }
            }
            walk(&root, follow_links, start, &prefix, &marker, &tx).await;
        });
        Ok(rx)
    }

    async fn create_multipart_upload(&self, _key: &str) -> Result<MultipartUpload> {
        Err(StorageError::NotSupported)
    }

    async fn upload_part(
        &self,
        _key: &str,
        _upload_id: &str,
        _num: u32,
        _body: bytes::Bytes,
    ) -> Result<Part> {
        Err(StorageError::NotSupported)
    }

    async fn complete_upload(&self, _key: &str, _upload_id: &str, _parts: &[Part]) -> Result<()> {
        Err(StorageError::NotSupported)
    }

    async fn abort_upload(&self, _key: &str, _upload_id: &str) {}

    fn as_file_system(&self) -> Option<&dyn FileSystem> {
        Some(self)
    }

    fn as_symlinks(&self) -> Option<&dyn Symlinks> {
        Some(self)
    }

    fn as_directory_lister(&self) -> Option<&dyn DirectoryLister> {
        Some(self)
    }
}

#[async_trait]
impl FileSystem for FileStorage {
    async fn file_info(&self, key: &str) -> Result<FileInfo> {
        let md = match metadata(&self.path(key), self.follow_links).await {
            Ok(Some(md)) => md,
            Ok(None) => return Err(StorageError::NotFound(key.to_string())),
            Err(err) => return Err(StorageError::io(err, key)),
        };
        Ok(FileInfo {
            mode: md.permissions().mode() & 0o7777,
            uid: md.uid(),
            gid: md.gid(),
        })
    }

    async fn chmod(&self, key: &str, mode: u32) -> Result<()> {
        let path = self.path(key);
        let md = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|err| StorageError::io(err, key))?;
        if md.file_type().is_symlink() {
            // link permissions are not used on linux
            return Ok(());
        }
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|err| StorageError::io(err, key))
    }

    async fn chown(&self, key: &str, uid: u32, gid: u32) -> Result<()> {
        std::os::unix::fs::lchown(self.path(key), Some(uid), Some(gid))
            .map_err(|err| StorageError::io(err, key))
    }

    async fn chtimes(&self, key: &str, mtime: i64) -> Result<()> {
        let time = filetime::FileTime::from_unix_time(mtime, 0);
        filetime::set_symlink_file_times(self.path(key), time, time)
            .map_err(|err| StorageError::io(err, key))
    }
}

#[async_trait]
impl Symlinks for FileStorage {
    async fn readlink(&self, key: &str) -> Result<String> {
        let target = tokio::fs::read_link(self.path(key))
            .await
            .map_err(|err| StorageError::io(err, key))?;
        target
            .into_os_string()
            .into_string()
            .map_err(|target| {
                StorageError::Other(anyhow!("{key}: non UTF-8 link target {target:?}"))
            })
    }

    async fn symlink(&self, target: &str, key: &str) -> Result<()> {
        let path = self.path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| StorageError::io(err, key))?;
        }
        match tokio::fs::remove_file(&path).await {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => {
                return Err(StorageError::io(err, key));
            }
            _ => {}
        }
        tokio::fs::symlink(target, &path)
            .await
            .map_err(|err| StorageError::io(err, key))
    }
}

#[async_trait]
impl DirectoryLister for FileStorage {
    async fn list_delimited(&self, prefix: &str) -> Result<Vec<Entry>> {
        let dir = dir_key(prefix);
        let mut entries = Vec::new();
        if !dir.is_empty() && dir == prefix {
            match metadata(&self.path(dir), self.follow_links).await {
                Ok(Some(md)) if md.is_dir() => entries.push(entry_from(dir.to_string(), &md)),
                Ok(_) => return Ok(entries),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
                Err(err) => return Err(StorageError::io(err, dir)),
            }
        }
        for (key, md) in read_children(&self.root, dir, self.follow_links).await? {
            if key.starts_with(prefix) {
                entries.push(entry_from(key, &md));
            }
        }
        Ok(entries)
    }
}
