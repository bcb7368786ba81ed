//! Transfer statistics
//!
//! Every process keeps one [`Stats`] ledger. Workers periodically push the part of their ledger
//! the manager has not seen yet as a [`Stat`] delta and subtract exactly what was acknowledged, so
//! a failed push leaves the whole delta in place for the next attempt.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};

/// Counters exchanged between workers and the manager
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stat {
    pub copied: i64,
    pub copied_bytes: i64,
    pub failed: i64,
    pub deleted: i64,
}

impl Stat {
    pub fn is_empty(&self) -> bool {
        *self == Stat::default()
    }
}

#[derive(Debug)]
pub struct Stats {
    copied: AtomicI64,
    copied_bytes: AtomicI64,
    failed: AtomicI64,
    deleted: AtomicI64,
    skipped: AtomicI64,
    checked: AtomicI64,
    start_time: std::time::Instant,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            copied: AtomicI64::new(0),
            copied_bytes: AtomicI64::new(0),
            failed: AtomicI64::new(0),
            deleted: AtomicI64::new(0),
            skipped: AtomicI64::new(0),
            checked: AtomicI64::new(0),
            start_time: std::time::Instant::now(),
        }
    }

    pub fn inc_copied(&self, bytes: u64) {
        self.copied.fetch_add(1, Ordering::Relaxed);
        self.copied_bytes
            .fetch_add(i64::try_from(bytes).unwrap_or(i64::MAX), Ordering::Relaxed);
    }

    pub fn inc_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_deleted(&self) {
        self.deleted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_checked(&self) {
        self.checked.fetch_add(1, Ordering::Relaxed);
    }

    /// Add a delta reported by a worker.
    pub fn add(&self, delta: &Stat) {
        self.copied.fetch_add(delta.copied, Ordering::Relaxed);
        self.copied_bytes
            .fetch_add(delta.copied_bytes, Ordering::Relaxed);
        self.failed.fetch_add(delta.failed, Ordering::Relaxed);
        self.deleted.fetch_add(delta.deleted, Ordering::Relaxed);
    }

    /// Remove a delta once its receiver acknowledged it.
    pub fn subtract(&self, delta: &Stat) {
        self.copied.fetch_sub(delta.copied, Ordering::Relaxed);
        self.copied_bytes
            .fetch_sub(delta.copied_bytes, Ordering::Relaxed);
        self.failed.fetch_sub(delta.failed, Ordering::Relaxed);
        self.deleted.fetch_sub(delta.deleted, Ordering::Relaxed);
    }

    /// Current value of the exchanged counters, each read atomically on its own.
    pub fn snapshot(&self) -> Stat {
        Stat {
            copied: self.copied.load(Ordering::Relaxed),
            copied_bytes: self.copied_bytes.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    pub fn skipped(&self) -> i64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn checked(&self) -> i64 {
        self.checked.load(Ordering::Relaxed)
    }

    pub fn get_duration(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }

    pub fn summary(&self) -> Summary {
        Summary {
            stat: self.snapshot(),
            skipped: self.skipped(),
            checked: self.checked(),
        }
    }

    /// Push everything not yet acknowledged to `sink`; nothing is subtracted on failure.
    pub async fn flush(&self, sink: &dyn StatsSink) -> anyhow::Result<Stat> {
        let delta = self.snapshot();
        if delta.is_empty() {
            return Ok(delta);
        }
        sink.push(&delta).await?;
        self.subtract(&delta);
        Ok(delta)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiver of statistics deltas, e.g. the manager of a distributed run
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Returns once the delta was accepted.
    async fn push(&self, delta: &Stat) -> anyhow::Result<()>;
}

#[async_trait]
impl StatsSink for Stats {
    async fn push(&self, delta: &Stat) -> anyhow::Result<()> {
        self.add(delta);
        Ok(())
    }
}

/// Final totals of a run
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Summary {
    pub stat: Stat,
    pub skipped: i64,
    pub checked: i64,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "copied: {}\n\
            bytes copied: {}\n\
            checked: {}\n\
            skipped: {}\n\
            deleted: {}\n\
            failed: {}",
            self.stat.copied,
            bytesize::ByteSize(u64::try_from(self.stat.copied_bytes).unwrap_or(0)),
            self.checked,
            self.skipped,
            self.stat.deleted,
            self.stat.failed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn stat_wire_format() {
        let stat = Stat {
            copied: 1,
            copied_bytes: 2,
            failed: 3,
            deleted: 4,
        };
        let json = serde_json::to_string(&stat).unwrap();
        assert_eq!(json, r#"{"Copied":1,"CopiedBytes":2,"Failed":3,"Deleted":4}"#);
        assert_eq!(serde_json::from_str::<Stat>(&json).unwrap(), stat);
    }

    #[test]
    fn threaded_counting() {
        let stats = Stats::new();
        std::thread::scope(|scope| {
            for _ in 0..10 {
                scope.spawn(|| {
                    for _ in 0..100 {
                        stats.inc_copied(10);
                        stats.inc_deleted();
                    }
                });
            }
        });
        let snapshot = stats.snapshot();
        assert_eq!(snapshot.copied, 1000);
        assert_eq!(snapshot.copied_bytes, 10_000);
        assert_eq!(snapshot.deleted, 1000);
    }

    struct FlakySink {
        total: Stats,
        fail: AtomicBool,
    }

    #[async_trait]
    impl StatsSink for FlakySink {
        async fn push(&self, delta: &Stat) -> anyhow::Result<()> {
            if self.fail.load(Ordering::Relaxed) {
                anyhow::bail!("connection refused");
            }
            self.total.add(delta);
            Ok(())
        }
    }

    #[tokio::test]
    async fn failed_flush_keeps_delta() {
        let stats = Stats::new();
        let sink = FlakySink {
            total: Stats::new(),
            fail: AtomicBool::new(true),
        };
        stats.inc_copied(100);
        assert!(stats.flush(&sink).await.is_err());
        assert_eq!(stats.snapshot().copied, 1);
        stats.inc_failed();
        sink.fail.store(false, Ordering::Relaxed);
        let sent = stats.flush(&sink).await.unwrap();
        assert_eq!(sent.copied, 1);
        assert_eq!(sent.failed, 1);
        assert!(stats.snapshot().is_empty());
        assert_eq!(sink.total.snapshot(), sent);
        // nothing left to send
        assert!(stats.flush(&sink).await.unwrap().is_empty());
    }

    #[test]
    fn summary_display() {
        let stats = Stats::new();
        stats.inc_copied(2048);
        stats.inc_skipped();
        let text = stats.summary().to_string();
        assert!(text.contains("copied: 1\n"));
        assert!(text.contains("skipped: 1\n"));
        assert!(text.contains("failed: 0"));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Copy(u16),
        Fail,
        Delete,
        Flush { succeed: bool },
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u16>().prop_map(Op::Copy),
            Just(Op::Fail),
            Just(Op::Delete),
            any::<bool>().prop_map(|succeed| Op::Flush { succeed }),
        ]
    }

    proptest! {
        #[test]
        fn manager_totals_match_worker_work(
            workers in proptest::collection::vec(proptest::collection::vec(op(), 0..40), 1..5),
        ) {
            let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
            runtime.block_on(async {
                let manager = Arc::new(Stats::new());
                let mut expected = Stat::default();
                let mut handles = Vec::new();
                for ops in workers {
                    for op in &ops {
                        match op {
                            Op::Copy(bytes) => {
                                expected.copied += 1;
                                expected.copied_bytes += i64::from(*bytes);
                            }
                            Op::Fail => expected.failed += 1,
                            Op::Delete => expected.deleted += 1,
                            Op::Flush { .. } => {}
                        }
                    }
                    let manager = manager.clone();
                    handles.push(tokio::spawn(async move {
                        let local = Stats::new();
                        let sink = FlakySink {
                            total: Stats::new(),
                            fail: AtomicBool::new(false),
                        };
                        for op in ops {
                            match op {
                                Op::Copy(bytes) => local.inc_copied(u64::from(bytes)),
                                Op::Fail => local.inc_failed(),
                                Op::Delete => local.inc_deleted(),
                                Op::Flush { succeed } => {
                                    sink.fail.store(!succeed, Ordering::Relaxed);
                                    let _ = local.flush(&sink).await;
                                }
                            }
                            tokio::task::yield_now().await;
                        }
                        sink.fail.store(false, Ordering::Relaxed);
                        local.flush(&sink).await.unwrap();
                        manager.add(&sink.total.snapshot());
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
                assert_eq!(manager.snapshot(), expected);
            });
        }
    }
}
