//! Merge of the source and destination listings into sync decisions
//!
//! Both listings arrive sorted by key. They are walked in lockstep and every key is classified
//! exactly once; everything that needs work becomes a [`Task`] on the task channel.

use std::sync::Arc;
use tracing::instrument;

use crate::config::SyncConfig;
use crate::object::{Action, Entry, EntryStream, ObjectStorage, Task};
use crate::stats::Stats;

/// Outcome of comparing one key
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Copy,
    Update,
    Verify,
    DeleteDst,
    DeleteSrc,
    CopyPerms,
    Skip,
}

impl Decision {
    pub fn action(self) -> Option<Action> {
        match self {
            Decision::Copy => Some(Action::Copy),
            Decision::Update => Some(Action::Update),
            Decision::Verify => Some(Action::Verify),
            Decision::DeleteDst => Some(Action::DeleteDst),
            Decision::DeleteSrc => Some(Action::DeleteSrc),
            Decision::CopyPerms => Some(Action::CopyPerms),
            Decision::Skip => None,
        }
    }
}

/// Decision for a key present only in the source
pub fn only_in_src(config: &SyncConfig) -> Decision {
    if config.existing {
        Decision::Skip
    } else {
        Decision::Copy
    }
}

/// Decision for a key present only in the destination
pub fn only_in_dst(config: &SyncConfig) -> Decision {
    if config.delete_dst {
        Decision::DeleteDst
    } else {
        Decision::Skip
    }
}

/// Decision for a key present on both sides, before permissions are compared
pub fn compare(config: &SyncConfig, src: &Entry, dst: &Entry) -> Decision {
    if config.ignore_existing {
        return Decision::Skip;
    }
    if config.force_update {
        return Decision::Update;
    }
    if config.update {
        if src.mtime > dst.mtime {
            return Decision::Update;
        }
        if src.mtime < dst.mtime {
            return Decision::Skip;
        }
    }
    if src.size != dst.size {
        return Decision::Update;
    }
    if config.check_all && !src.is_prefix {
        return Decision::Verify;
    }
    if config.delete_src {
        return Decision::DeleteSrc;
    }
    Decision::Skip
}

/// Storages whose permissions are compared for keys that are otherwise in sync
#[derive(Clone)]
pub struct PermsCheck {
    pub src: Arc<dyn ObjectStorage>,
    pub dst: Arc<dyn ObjectStorage>,
}

impl PermsCheck {
    async fn differs(&self, key: &str) -> bool {
        let (Some(src_fs), Some(dst_fs)) = (self.src.as_file_system(), self.dst.as_file_system())
        else {
            return false;
        };
        match tokio::try_join!(src_fs.file_info(key), dst_fs.file_info(key)) {
            Ok((src, dst)) => src != dst,
            Err(err) => {
                tracing::warn!("failed to compare permissions of {}: {:#}", key, err);
                false
            }
        }
    }
}

/// What the producer did
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DiffSummary {
    /// tasks sent to the pipeline, plus the deferred ones
    pub emitted: u64,
    /// listing stopped because the limit was reached
    pub limited: bool,
    /// destination directories to delete once every other task has finished, deepest first
    pub deferred: Vec<Task>,
}

/// One side of the merge: drops keys that are filtered out or outside the key range.
struct Side<'a> {
    rx: EntryStream,
    config: &'a SyncConfig,
    name: &'static str,
    done: bool,
}

impl<'a> Side<'a> {
    fn new(rx: EntryStream, config: &'a SyncConfig, name: &'static str) -> Self {
        Self {
            rx,
            config,
            name,
            done: false,
        }
    }

    async fn next(&mut self) -> anyhow::Result<Option<Entry>> {
        while !self.done {
            let entry = match self.rx.recv().await {
                Some(Ok(entry)) => entry,
                Some(Err(err)) => {
                    self.done = true;
                    return Err(anyhow::Error::new(err)
                        .context(format!("failed to list {}", self.name)));
                }
                None => break,
            };
            if self.config.past_end(&entry.key) {
                break;
            }
            if entry.key.is_empty()
                || !self.config.in_range(&entry.key)
                || (entry.is_prefix && !self.config.dirs)
            {
                continue;
            }
            if let crate::filter::FilterResult::ExcludedByPattern(pattern) = self
                .config
                .filter
                .should_include(&entry.key, entry.is_prefix)
            {
                tracing::debug!("{} {:?} excluded by {:?}", self.name, entry.key, pattern);
                continue;
            }
            return Ok(Some(entry));
        }
        self.done = true;
        Ok(None)
    }
}

struct Emitter<'a> {
    config: &'a SyncConfig,
    tasks: &'a async_channel::Sender<Task>,
    stats: &'a Stats,
    summary: DiffSummary,
    /// destination directories are removed after their content
    deferred_dirs: Vec<Entry>,
}

impl Emitter<'_> {
    /// Returns false once no more tasks may be emitted.
    async fn emit(&mut self, entry: Entry, decision: Decision) -> anyhow::Result<bool> {
        let Some(action) = decision.action() else {
            self.stats.inc_skipped();
            return Ok(true);
        };
        if let Some(limit) = self.config.limit {
            if self.summary.emitted >= limit {
                self.summary.limited = true;
                return Ok(false);
            }
        }
        if action == Action::DeleteDst && entry.is_prefix {
            self.summary.emitted += 1;
            self.deferred_dirs.push(entry);
            return Ok(true);
        }
        tracing::trace!("{:?} {:?}", action, entry.key);
        self.tasks
            .send(Task::new(entry, action))
            .await
            .map_err(|_| anyhow::anyhow!("task channel closed, no transfer worker left"))?;
        self.summary.emitted += 1;
        Ok(true)
    }

    fn finish(mut self) -> DiffSummary {
        // listed parents come before their children
        self.summary.deferred = self
            .deferred_dirs
            .into_iter()
            .rev()
            .map(|entry| Task::new(entry, Action::DeleteDst))
            .collect();
        self.summary
    }
}

/// Merge both listings and send a task for every key that needs work.
///
/// The task sender is dropped on return, which closes the channel once every other sender is
/// gone as well. Destination directories to delete are not sent; they come back in
/// [`DiffSummary::deferred`] and must run only after the tasks sent here have finished.
#[instrument(skip_all)]
pub async fn produce(
    config: &SyncConfig,
    src: EntryStream,
    dst: EntryStream,
    tasks: async_channel::Sender<Task>,
    stats: &Stats,
    perms: Option<PermsCheck>,
) -> anyhow::Result<DiffSummary> {
    let mut src = Side::new(src, config, "source");
    let mut dst = Side::new(dst, config, "destination");
    let mut emitter = Emitter {
        config,
        tasks: &tasks,
        stats,
        summary: DiffSummary::default(),
        deferred_dirs: Vec::new(),
    };
    let mut dst_next = dst.next().await?;
    'merge: {
        while let Some(src_entry) = src.next().await? {
            while let Some(dst_entry) = dst_next.take_if(|entry| entry.key < src_entry.key) {
                if !emitter.emit(dst_entry, only_in_dst(config)).await? {
                    break 'merge;
                }
                dst_next = dst.next().await?;
            }
            let decision = match dst_next.take_if(|entry| entry.key == src_entry.key) {
                Some(dst_entry) => {
                    dst_next = dst.next().await?;
                    let mut decision = compare(config, &src_entry, &dst_entry);
                    if decision == Decision::Skip && !src_entry.is_prefix {
                        if let Some(perms) = &perms {
                            if perms.differs(&src_entry.key).await {
                                decision = Decision::CopyPerms;
                            }
                        }
                    }
                    decision
                }
                None => only_in_src(config),
            };
            if !emitter.emit(src_entry, decision).await? {
                break 'merge;
            }
        }
        while let Some(dst_entry) = dst_next.take() {
            if !emitter.emit(dst_entry, only_in_dst(config)).await? {
                break 'merge;
            }
            dst_next = dst.next().await?;
        }
    }
    let summary = emitter.finish();
    tracing::info!(
        "listing finished, {} tasks{}",
        summary.emitted,
        if summary.limited { " (limit reached)" } else { "" }
    );
    Ok(summary)
}
