//! Execution of sync tasks
//!
//! A fixed number of workers pull [`Task`]s from a shared channel until it is closed and drained.
//! Every task ends in exactly one statistics update; per-object errors are retried a bounded
//! number of times and then counted as failures, they never stop the pipeline.

use anyhow::{Context, anyhow, bail};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::checksum;
use crate::config::SyncConfig;
use crate::object::{Action, Entry, MultipartUpload, ObjectStorage, Part, StorageError, Task};
use crate::stats::Stats;

pub const MAX_ATTEMPTS: u32 = 3;

/// Number of parts of one object uploaded concurrently
pub const PART_CONCURRENCY: usize = 4;

/// Pipeline settings after checking what both storages support
#[derive(Clone, Debug)]
pub struct Settings {
    pub dry: bool,
    pub check_all: bool,
    pub check_new: bool,
    pub delete_src: bool,
    pub perms: bool,
    pub links: bool,
    pub part_size: u64,
    pub part_concurrency: usize,
    pub max_attempts: u32,
    /// base delay between attempts, grows with the square of the attempt number
    pub retry_delay: std::time::Duration,
}

impl Settings {
    /// Settings for `config`; features one of the storages cannot support are turned off with a
    /// single warning.
    pub fn resolve(config: &SyncConfig, src: &dyn ObjectStorage, dst: &dyn ObjectStorage) -> Self {
        let mut perms = config.perms;
        if perms && (src.as_file_system().is_none() || dst.as_file_system().is_none()) {
            tracing::warn!(
                "permissions are not supported by {} or {}, --perms is ignored",
                src,
                dst
            );
            perms = false;
        }
        let mut links = config.links;
        if links && (src.as_symlinks().is_none() || dst.as_symlinks().is_none()) {
            tracing::warn!(
                "symlinks are not supported by {} or {}, --links is ignored",
                src,
                dst
            );
            links = false;
        }
        Self {
            dry: config.dry,
            check_all: config.check_all,
            check_new: config.check_new,
            delete_src: config.delete_src,
            perms,
            links,
            part_size: config.part_size,
            part_concurrency: PART_CONCURRENCY,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: std::time::Duration::from_secs(1),
        }
    }
}

/// Set the storage class for everything written to `dst`.
pub fn apply_storage_class(dst: &dyn ObjectStorage, class: Option<&str>) -> anyhow::Result<()> {
    let Some(class) = class else {
        return Ok(());
    };
    match dst.as_storage_class() {
        Some(storage) => storage
            .set_storage_class(class)
            .with_context(|| format!("failed to set storage class {class:?} for {dst}")),
        None => {
            tracing::warn!(
                "{} does not support storage classes, --storage-class is ignored",
                dst
            );
            Ok(())
        }
    }
}

/// Same underlying storage on both sides: objects can be copied without moving the data here.
struct ServerCopy {
    storage: Arc<dyn ObjectStorage>,
    src_prefix: String,
    dst_prefix: String,
}

pub struct Transfer {
    src: Arc<dyn ObjectStorage>,
    dst: Arc<dyn ObjectStorage>,
    settings: Settings,
    stats: Arc<Stats>,
    throttle: Arc<throttle::Throttle>,
    server_copy: Option<ServerCopy>,
}

impl Transfer {
    pub fn new(
        src: Arc<dyn ObjectStorage>,
        dst: Arc<dyn ObjectStorage>,
        settings: Settings,
        stats: Arc<Stats>,
        throttle: Arc<throttle::Throttle>,
    ) -> Self {
        let (src_base, src_prefix) = crate::object::resolve(&src);
        let (dst_base, dst_prefix) = crate::object::resolve(&dst);
        let server_copy = if crate::object::same_instance(&src_base, &dst_base)
            && src_prefix != dst_prefix
        {
            tracing::debug!("{} and {} share storage, using server side copy", src, dst);
            Some(ServerCopy {
                storage: src_base,
                src_prefix,
                dst_prefix,
            })
        } else {
            None
        };
        Self {
            src,
            dst,
            settings,
            stats,
            throttle,
            server_copy,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run `threads` workers until the channel is closed and drained.
    pub async fn run(
        self: &Arc<Self>,
        tasks: async_channel::Receiver<Task>,
        threads: usize,
    ) -> anyhow::Result<()> {
        let mut join_set = tokio::task::JoinSet::new();
        for worker in 0..threads.max(1) {
            let transfer = self.clone();
            let tasks = tasks.clone();
            join_set.spawn(async move {
                while let Ok(task) = tasks.recv().await {
                    transfer.execute(task).await;
                }
                tracing::debug!("transfer worker {} finished", worker);
            });
        }
        drop(tasks);
        while let Some(res) = join_set.join_next().await {
            res?
        }
        Ok(())
    }

    /// Execute `tasks` one at a time, in the given order.
    pub async fn run_in_order(&self, tasks: Vec<Task>) {
        for task in tasks {
            self.execute(task).await;
        }
    }

    #[instrument(skip(self, task), fields(key = %task.entry.key, action = ?task.action))]
    pub async fn execute(&self, task: Task) {
        let Task { entry, action } = task;
        match action {
            Action::Copy => self.copy_and_count(&entry, true).await,
            Action::Update => self.copy_and_count(&entry, false).await,
            Action::Verify => self.verify_and_count(&entry).await,
            Action::DeleteDst => self.delete_and_count(&*self.dst, &entry).await,
            Action::DeleteSrc => self.delete_and_count(&*self.src, &entry).await,
            Action::CopyPerms => self.perms_and_count(&entry).await,
        }
    }

    async fn copy_and_count(&self, entry: &Entry, is_new: bool) {
        if self.settings.dry {
            tracing::info!("dry run: copy {}", entry.key);
            self.stats.inc_copied(entry.data_size());
            if self.settings.delete_src && !entry.is_prefix {
                self.stats.inc_deleted();
            }
            return;
        }
        let verify = self.settings.check_all || (self.settings.check_new && is_new);
        match self
            .with_retry("copy", &entry.key, || self.copy_verified(entry, verify))
            .await
        {
            Ok(()) => {
                tracing::debug!("copied {} ({} bytes)", entry.key, entry.data_size());
                self.stats.inc_copied(entry.data_size());
                if self.settings.delete_src && !entry.is_prefix {
                    self.delete_and_count(&*self.src, entry).await;
                }
            }
            Err(err) if StorageError::is_not_found(&err) => {
                tracing::info!("{} disappeared during copy: {:#}", entry.key, err);
                self.stats.inc_skipped();
            }
            Err(err) => {
                tracing::error!("failed to copy {}: {:#}", entry.key, err);
                self.stats.inc_failed();
            }
        }
    }

    async fn verify_and_count(&self, entry: &Entry) {
        match checksum::same_content(&*self.src, &*self.dst, &entry.key).await {
            Ok(true) => {
                tracing::debug!("{} is in sync", entry.key);
                self.stats.inc_checked();
                if self.settings.delete_src {
                    self.delete_and_count(&*self.src, entry).await;
                }
            }
            Ok(false) => self.copy_and_count(entry, false).await,
            Err(err) if StorageError::is_not_found(&err) => {
                tracing::info!("{} disappeared during verification: {:#}", entry.key, err);
                self.stats.inc_skipped();
            }
            Err(err) => {
                tracing::error!("failed to verify {}: {:#}", entry.key, err);
                self.stats.inc_failed();
            }
        }
    }

    async fn delete_and_count(&self, storage: &dyn ObjectStorage, entry: &Entry) {
        if self.settings.dry {
            tracing::info!("dry run: delete {} from {}", entry.key, storage);
            self.stats.inc_deleted();
            return;
        }
        let key = entry.key.as_str();
        let deleted = self
            .with_retry("delete", key, || async move {
                storage.delete(key).await?;
                Ok(())
            })
            .await;
        match deleted {
            Ok(()) => {
                tracing::debug!("deleted {} from {}", key, storage);
                self.stats.inc_deleted();
            }
            Err(err) => {
                tracing::error!("failed to delete {} from {}: {:#}", key, storage, err);
                self.stats.inc_failed();
            }
        }
    }

    async fn perms_and_count(&self, entry: &Entry) {
        if self.settings.dry {
            tracing::info!("dry run: copy permissions of {}", entry.key);
            self.stats.inc_copied(0);
            return;
        }
        match self
            .with_retry("copy permissions of", &entry.key, || self.copy_perms(entry))
            .await
        {
            Ok(()) => self.stats.inc_copied(0),
            Err(err) => {
                tracing::error!("failed to copy permissions of {}: {:#}", entry.key, err);
                self.stats.inc_failed();
            }
        }
    }

    async fn with_retry<F, Fut>(&self, what: &str, key: &str, mut op: F) -> anyhow::Result<()>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(()) => return Ok(()),
                Err(err)
                    if attempt >= self.settings.max_attempts
                        || StorageError::is_not_found(&err) =>
                {
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "{} {} failed (attempt {}/{}): {:#}",
                        what,
                        key,
                        attempt,
                        self.settings.max_attempts,
                        err
                    );
                    tokio::time::sleep(self.settings.retry_delay * attempt * attempt).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn copy_verified(&self, entry: &Entry, verify: bool) -> anyhow::Result<()> {
        let copied_link = self.copy_object(entry).await?;
        if verify && !entry.is_prefix && !copied_link {
            let written = self.dst.head(&entry.key).await?;
            if written.size != entry.size {
                bail!(
                    "size mismatch after copy: {} bytes expected, {} found",
                    entry.size,
                    written.size
                );
            }
            if !checksum::same_content(&*self.src, &*self.dst, &entry.key).await? {
                bail!("checksum mismatch after copy");
            }
        }
        if self.settings.perms {
            self.copy_perms(entry).await?;
        }
        Ok(())
    }

    /// Copy one object; returns true when a symlink was recreated instead of copying data.
    async fn copy_object(&self, entry: &Entry) -> anyhow::Result<bool> {
        let key = entry.key.as_str();
        if entry.is_prefix {
            self.dst.put(key, Box::new(tokio::io::empty())).await?;
            return Ok(false);
        }
        if entry.is_symlink && self.settings.links {
            let (Some(src_links), Some(dst_links)) =
                (self.src.as_symlinks(), self.dst.as_symlinks())
            else {
                bail!("symlinks are not supported");
            };
            let target = src_links.readlink(key).await?;
            dst_links.symlink(&target, key).await?;
            return Ok(true);
        }
        let size = entry.data_size();
        // bytes already taken from the bandwidth budget for this attempt
        let mut charged = false;
        if let Some(server_copy) = &self.server_copy {
            // a shared local backend still moves the data through this host
            self.throttle.consume(size).await;
            charged = true;
            let src_key = format!("{}{}", server_copy.src_prefix, key);
            let dst_key = format!("{}{}", server_copy.dst_prefix, key);
            match server_copy.storage.copy(&dst_key, &src_key).await {
                Ok(()) => return Ok(false),
                Err(StorageError::NotSupported) => {
                    tracing::trace!("server side copy not supported, copying {} through", key);
                }
                Err(err) => return Err(err.into()),
            }
        }
        if size > self.settings.part_size {
            match self.dst.create_multipart_upload(key).await {
                Ok(upload) => {
                    self.copy_multipart(entry, upload, !charged).await?;
                    return Ok(false);
                }
                Err(StorageError::NotSupported) => {}
                Err(err) => return Err(err.into()),
            }
        }
        if !charged {
            self.throttle.consume(size).await;
        }
        let body = self.src.get(key, 0, None).await?;
        self.dst.put(key, body).await?;
        Ok(false)
    }

    /// Upload `entry` in parts; with `throttled` every part is charged to the bandwidth budget.
    async fn copy_multipart(
        &self,
        entry: &Entry,
        upload: MultipartUpload,
        throttled: bool,
    ) -> anyhow::Result<()> {
        let key = entry.key.as_str();
        let size = entry.data_size();
        let max_count = u64::from(upload.max_count.max(1));
        let mut part_size = self.settings.part_size.max(upload.min_part_size).max(1);
        if size.div_ceil(part_size) > max_count {
            part_size = size.div_ceil(max_count);
        }
        let count = size.div_ceil(part_size);
        tracing::debug!(
            "uploading {} in {} parts of {}",
            key,
            count,
            bytesize::ByteSize(part_size)
        );
        let mut join_set = tokio::task::JoinSet::new();
        let mut parts: Vec<Part> = Vec::new();
        let uploaded: anyhow::Result<()> = async {
            for index in 0..count {
                if join_set.len() >= self.settings.part_concurrency.max(1) {
                    if let Some(res) = join_set.join_next().await {
                        parts.push(res??);
                    }
                }
                let off = index * part_size;
                let len = part_size.min(size - off);
                let num = u32::try_from(index + 1)?;
                let src = self.src.clone();
                let dst = self.dst.clone();
                let throttle = throttled.then(|| self.throttle.clone());
                let key = key.to_string();
                let upload_id = upload.upload_id.clone();
                join_set.spawn(async move {
                    if let Some(throttle) = throttle {
                        throttle.consume(len).await;
                    }
                    let mut reader = src.get(&key, off, Some(len)).await?;
                    let mut buffer = Vec::with_capacity(usize::try_from(len)?);
                    reader.read_to_end(&mut buffer).await?;
                    if buffer.len() as u64 != len {
                        bail!("short read of part {}: {} of {} bytes", num, buffer.len(), len);
                    }
                    let part = dst.upload_part(&key, &upload_id, num, buffer.into()).await?;
                    Ok::<Part, anyhow::Error>(part)
                });
            }
            while let Some(res) = join_set.join_next().await {
                parts.push(res??);
            }
            Ok(())
        }
        .await;
        if let Err(err) = uploaded {
            join_set.abort_all();
            self.dst.abort_upload(key, &upload.upload_id).await;
            return Err(err.context(format!("multipart upload {} aborted", upload.upload_id)));
        }
        parts.sort_by_key(|part| part.num);
        if let Err(err) = self
            .dst
            .complete_upload(key, &upload.upload_id, &parts)
            .await
        {
            self.dst.abort_upload(key, &upload.upload_id).await;
            return Err(anyhow!(err).context("failed to complete multipart upload"));
        }
        Ok(())
    }

    async fn copy_perms(&self, entry: &Entry) -> anyhow::Result<()> {
        let (Some(src_fs), Some(dst_fs)) = (self.src.as_file_system(), self.dst.as_file_system())
        else {
            return Ok(());
        };
        let key = entry.key.as_str();
        let info = src_fs.file_info(key).await?;
        if !entry.is_symlink {
            dst_fs.chmod(key, info.mode).await?;
        }
        if let Err(err) = dst_fs.chown(key, info.uid, info.gid).await {
            tracing::debug!("cannot change owner of {}: {:#}", key, err);
        }
        dst_fs.chtimes(key, entry.mtime).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{FileStorage, FileSystem, MemStorage, Symlinks, WithPrefix};
    use std::sync::atomic::Ordering;

    fn settings() -> Settings {
        Settings {
            dry: false,
            check_all: false,
            check_new: false,
            delete_src: false,
            perms: false,
            links: false,
            part_size: crate::config::DEFAULT_PART_SIZE,
            part_concurrency: 2,
            max_attempts: MAX_ATTEMPTS,
            retry_delay: std::time::Duration::ZERO,
        }
    }

    async fn run(
        src: Arc<dyn ObjectStorage>,
        dst: Arc<dyn ObjectStorage>,
        settings: Settings,
        tasks: Vec<Task>,
    ) -> Arc<Stats> {
        let stats = Arc::new(Stats::new());
        let transfer = Arc::new(Transfer::new(
            src,
            dst,
            settings,
            stats.clone(),
            Arc::new(throttle::Throttle::unlimited()),
        ));
        let (tx, rx) = async_channel::unbounded();
        for task in tasks {
            tx.send(task).await.unwrap();
        }
        drop(tx);
        transfer.run(rx, 3).await.unwrap();
        stats
    }

    fn copy(key: &str, size: i64) -> Task {
        Task::new(Entry::file(key, size, 0), Action::Copy)
    }

    #[tokio::test]
    async fn copies_and_counts() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("a", "aaa", 0);
        src.insert("b/c", "cc", 0);
        dst.insert("b/c", "old", 0);
        let stats = run(
            src.clone(),
            dst.clone(),
            settings(),
            vec![
                copy("a", 3),
                Task::new(Entry::file("b/c", 2, 0), Action::Update),
            ],
        )
        .await;
        assert_eq!(dst.data("a").unwrap(), "aaa");
        assert_eq!(dst.data("b/c").unwrap(), "cc");
        let stat = stats.snapshot();
        assert_eq!(stat.copied, 2);
        assert_eq!(stat.copied_bytes, 5);
        assert_eq!(stat.failed, 0);
    }

    #[tokio::test]
    async fn dry_run_counts_without_touching_storage() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("a", "aaa", 0);
        dst.insert("z", "z", 0);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                dry: true,
                delete_src: true,
                ..settings()
            },
            vec![
                copy("a", 3),
                Task::new(Entry::file("z", 1, 0), Action::DeleteDst),
            ],
        )
        .await;
        let stat = stats.snapshot();
        assert_eq!(stat.copied, 1);
        assert_eq!(stat.copied_bytes, 3);
        assert_eq!(stat.deleted, 2);
        assert_eq!(src.calls.mutations(), 0);
        assert_eq!(dst.calls.mutations(), 0);
        assert!(dst.data("a").is_none());
        assert!(src.data("a").is_some());
    }

    #[tokio::test]
    async fn retries_transient_failures() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("flaky", "x", 0);
        src.insert("broken", "y", 0);
        src.fail_next("flaky", 2);
        src.fail_next("broken", 10);
        let stats = run(
            src.clone(),
            dst.clone(),
            settings(),
            vec![copy("flaky", 1), copy("broken", 1)],
        )
        .await;
        let stat = stats.snapshot();
        assert_eq!(stat.copied, 1);
        assert_eq!(stat.failed, 1);
        assert_eq!(dst.data("flaky").unwrap(), "x");
        assert!(dst.data("broken").is_none());
        // 3 attempts for each key
        assert_eq!(src.calls.get.load(Ordering::Relaxed), 6);
    }

    #[tokio::test]
    async fn missing_source_is_skipped() {
        let stats = run(
            Arc::new(MemStorage::new("src")),
            Arc::new(MemStorage::new("dst")),
            settings(),
            vec![copy("gone", 1)],
        )
        .await;
        assert_eq!(stats.snapshot().failed, 0);
        assert_eq!(stats.skipped(), 1);
    }

    #[tokio::test]
    async fn same_storage_uses_server_side_copy() {
        let base = Arc::new(MemStorage::new("base"));
        base.insert("src/k", "value", 0);
        let src: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(base.clone(), "src/"));
        let dst: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(base.clone(), "dst/"));
        let stats = run(src, dst, settings(), vec![copy("k", 5)]).await;
        assert_eq!(stats.snapshot().copied, 1);
        assert_eq!(base.data("dst/k").unwrap(), "value");
        assert_eq!(base.calls.copy.load(Ordering::Relaxed), 1);
        assert_eq!(base.calls.get.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn server_side_copy_falls_back() {
        let base = Arc::new(MemStorage::basic("base"));
        base.insert("src/k", "value", 0);
        let src: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(base.clone(), "src/"));
        let dst: Arc<dyn ObjectStorage> = Arc::new(WithPrefix::new(base.clone(), "dst/"));
        let stats = run(src, dst, settings(), vec![copy("k", 5)]).await;
        assert_eq!(stats.snapshot().copied, 1);
        assert_eq!(base.data("dst/k").unwrap(), "value");
        assert_eq!(base.calls.get.load(Ordering::Relaxed), 1);
    }

    /// Copy a 5-byte object between two views of `base` with a 4 bytes per second budget.
    async fn copy_within(base: Arc<MemStorage>) -> std::time::Duration {
        base.insert("src/k", "value", 0);
        let throttle = Arc::new(throttle::Throttle::new(4, std::time::Duration::from_secs(1)));
        let replenish = throttle.spawn_replenish().unwrap();
        let transfer = Transfer::new(
            Arc::new(WithPrefix::new(base.clone(), "src/")),
            Arc::new(WithPrefix::new(base.clone(), "dst/")),
            settings(),
            Arc::new(Stats::new()),
            throttle,
        );
        let start = tokio::time::Instant::now();
        transfer.execute(copy("k", 5)).await;
        replenish.abort();
        assert_eq!(transfer.stats.snapshot().copied, 1);
        assert_eq!(base.data("dst/k").unwrap(), "value");
        start.elapsed()
    }

    #[tokio::test(start_paused = true)]
    async fn server_side_copy_is_throttled_once() {
        // 4 bytes from the initial bucket, the last one after the first refill
        let second = std::time::Duration::from_secs(1);
        let elapsed = copy_within(Arc::new(MemStorage::new("base"))).await;
        assert!(elapsed >= second && elapsed < 2 * second, "{elapsed:?}");
        let elapsed = copy_within(Arc::new(MemStorage::basic("base"))).await;
        assert!(elapsed >= second && elapsed < 2 * second, "{elapsed:?}");
    }

    #[tokio::test]
    async fn large_objects_use_multipart() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("big", "0123456789", 0);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                part_size: 4,
                check_new: true,
                ..settings()
            },
            vec![copy("big", 10)],
        )
        .await;
        assert_eq!(stats.snapshot().copied, 1);
        assert_eq!(dst.data("big").unwrap(), "0123456789");
        assert_eq!(dst.calls.upload_part.load(Ordering::Relaxed), 3);
        assert_eq!(dst.calls.put.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn failed_multipart_is_aborted() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("big", "0123456789", 0);
        dst.fail_next("big", 100);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                part_size: 4,
                ..settings()
            },
            vec![copy("big", 10)],
        )
        .await;
        assert_eq!(stats.snapshot().failed, 1);
        assert_eq!(dst.calls.abort_upload.load(Ordering::Relaxed), 3);
        assert_eq!(dst.pending_uploads(), 0);
        assert!(dst.data("big").is_none());
    }

    #[tokio::test]
    async fn multipart_not_supported_falls_back_to_put() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::basic("dst"));
        src.insert("big", "0123456789", 0);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                part_size: 4,
                ..settings()
            },
            vec![copy("big", 10)],
        )
        .await;
        assert_eq!(stats.snapshot().copied, 1);
        assert_eq!(dst.calls.put.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn source_deleted_only_after_successful_copy() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("ok", "1", 0);
        src.insert("bad", "2", 0);
        src.fail_next("bad", 10);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                delete_src: true,
                ..settings()
            },
            vec![copy("ok", 1), copy("bad", 1)],
        )
        .await;
        assert!(src.data("ok").is_none());
        assert_eq!(dst.data("ok").unwrap(), "1");
        assert!(src.data("bad").is_some());
        let stat = stats.snapshot();
        assert_eq!(stat.deleted, 1);
        assert_eq!(stat.failed, 1);
    }

    #[tokio::test]
    async fn verify_copies_only_on_mismatch() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("same", "abc", 0);
        dst.insert("same", "abc", 0);
        src.insert("changed", "abc", 0);
        dst.insert("changed", "xyz", 0);
        let stats = run(
            src.clone(),
            dst.clone(),
            Settings {
                check_all: true,
                ..settings()
            },
            vec![
                Task::new(Entry::file("same", 3, 0), Action::Verify),
                Task::new(Entry::file("changed", 3, 0), Action::Verify),
            ],
        )
        .await;
        assert_eq!(stats.checked(), 1);
        assert_eq!(stats.snapshot().copied, 1);
        assert_eq!(dst.data("changed").unwrap(), "abc");
        assert_eq!(dst.calls.put.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn permissions_and_links_between_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let src = FileStorage::new(tmp.path().join("src")).with_follow_links(false);
        let dst = FileStorage::new(tmp.path().join("dst")).with_follow_links(false);
        src.put("f", Box::new(std::io::Cursor::new(b"data".to_vec())))
            .await
            .unwrap();
        src.chmod("f", 0o600).await.unwrap();
        src.symlink("f", "l").await.unwrap();
        let f = src.head("f").await.unwrap();
        let l = src.head("l").await.unwrap();
        assert!(l.is_symlink);
        let (src, dst): (Arc<dyn ObjectStorage>, Arc<dyn ObjectStorage>) =
            (Arc::new(src), Arc::new(dst));
        let config = SyncConfig {
            perms: true,
            links: true,
            ..Default::default()
        };
        let resolved = Settings::resolve(&config, &*src, &*dst);
        assert!(resolved.perms && resolved.links);
        let stats = run(
            src,
            dst.clone(),
            Settings {
                retry_delay: std::time::Duration::ZERO,
                ..resolved
            },
            vec![Task::new(f.clone(), Action::Copy), Task::new(l, Action::Copy)],
        )
        .await;
        assert_eq!(stats.snapshot().copied, 2);
        let fs = dst.as_file_system().unwrap();
        assert_eq!(fs.file_info("f").await.unwrap().mode, 0o600);
        assert_eq!(dst.head("f").await.unwrap().mtime, f.mtime);
        assert_eq!(dst.as_symlinks().unwrap().readlink("l").await.unwrap(), "f");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn missing_capabilities_disable_flags() {
        let src = MemStorage::new("src");
        let dst = MemStorage::new("dst");
        let config = SyncConfig {
            perms: true,
            links: true,
            ..Default::default()
        };
        let resolved = Settings::resolve(&config, &src, &dst);
        assert!(!resolved.perms);
        assert!(!resolved.links);
        assert!(logs_contain("--perms is ignored"));
        assert!(logs_contain("--links is ignored"));
    }

    #[tokio::test]
    async fn storage_class_is_applied() {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        src.insert("k", "v", 0);
        apply_storage_class(&*dst, Some("COLD")).unwrap();
        run(src, dst.clone(), settings(), vec![copy("k", 1)]).await;
        assert_eq!(dst.object_storage_class("k").as_deref(), Some("COLD"));
        let tmp = tempfile::tempdir().unwrap();
        assert!(apply_storage_class(&FileStorage::new(tmp.path()), Some("COLD")).is_ok());
    }
}
