//! Running a sync in one of its three roles
//!
//! - local: list, diff and transfer in this process
//! - manager: list and diff here, hand the tasks out over HTTP to remote workers and to a local
//!   transfer pipeline reading the same channel
//! - worker: fetch tasks from a manager, transfer them and report statistics back

use common::config::SyncConfig;
use common::object::{ObjectStorage, Task};
use common::transfer::{Settings, Transfer};
use common::{Stats, Summary, diff, listing};
use remote::SshSession;
use remote::launcher::Launcher;
use remote::protocol::RetryPolicy;
use std::sync::Arc;
use tracing::instrument;

/// Capacity of the task channel between the differ and the transfer workers
pub const TASK_QUEUE: usize = 1000;

/// Both ends of a sync
#[derive(Clone)]
pub struct Endpoints {
    pub src: Arc<dyn ObjectStorage>,
    pub dst: Arc<dyn ObjectStorage>,
}

struct Pipeline {
    transfer: Arc<Transfer>,
    replenish: Option<tokio::task::JoinHandle<()>>,
}

impl Pipeline {
    fn new(endpoints: &Endpoints, config: &SyncConfig, stats: &Arc<Stats>) -> anyhow::Result<Self> {
        let settings = Settings::resolve(config, &*endpoints.src, &*endpoints.dst);
        if !settings.dry {
            common::transfer::apply_storage_class(
                &*endpoints.dst,
                config.storage_class.as_deref(),
            )?;
        }
        let throttle = Arc::new(throttle::Throttle::from_mbps(config.bwlimit));
        let replenish = throttle.spawn_replenish();
        let transfer = Arc::new(Transfer::new(
            endpoints.src.clone(),
            endpoints.dst.clone(),
            settings,
            stats.clone(),
            throttle,
        ));
        Ok(Self {
            transfer,
            replenish,
        })
    }

    fn spawn(
        &self,
        tasks: async_channel::Receiver<Task>,
        threads: usize,
    ) -> tokio::task::JoinHandle<anyhow::Result<()>> {
        let transfer = self.transfer.clone();
        tokio::spawn(async move { transfer.run(tasks, threads).await })
    }

    fn perms(&self) -> bool {
        self.transfer.settings().perms
    }

    /// Delete the directories the differ held back, once nothing else is running.
    async fn remove_dirs(&self, produced: &anyhow::Result<diff::DiffSummary>) {
        let Ok(summary) = produced else {
            return;
        };
        if summary.deferred.is_empty() {
            return;
        }
        tracing::debug!("removing {} directories", summary.deferred.len());
        self.transfer.run_in_order(summary.deferred.clone()).await;
    }

    fn stop(self) {
        if let Some(replenish) = self.replenish {
            replenish.abort();
        }
    }
}

/// List both sides and send the tasks into `tasks`; the channel closes when this returns.
async fn produce_tasks(
    endpoints: &Endpoints,
    config: &SyncConfig,
    tasks: async_channel::Sender<Task>,
    stats: &Stats,
    perms: bool,
) -> anyhow::Result<diff::DiffSummary> {
    let (src, dst) = tokio::try_join!(
        listing::list_sorted(&endpoints.src, config.list_threads, config.list_depth),
        listing::list_sorted(&endpoints.dst, config.list_threads, config.list_depth),
    )?;
    let perms = perms.then(|| diff::PermsCheck {
        src: endpoints.src.clone(),
        dst: endpoints.dst.clone(),
    });
    diff::produce(config, src, dst, tasks, stats, perms).await
}

/// Sync everything within this process.
#[instrument(skip_all)]
pub async fn run_local(
    endpoints: Endpoints,
    config: &SyncConfig,
    stats: Arc<Stats>,
) -> anyhow::Result<Summary> {
    let pipeline = Pipeline::new(&endpoints, config, &stats)?;
    let (tx, rx) = async_channel::bounded(TASK_QUEUE);
    let workers = pipeline.spawn(rx, config.threads);
    // the pipeline drains whatever was sent, also when listing failed half way
    let produced = produce_tasks(&endpoints, config, tx, &stats, pipeline.perms()).await;
    let drained = workers.await;
    if matches!(drained, Ok(Ok(()))) {
        pipeline.remove_dirs(&produced).await;
    }
    pipeline.stop();
    drained??;
    produced?;
    Ok(stats.summary())
}

/// Run the differ here and share its tasks with workers started on `hosts`.
#[instrument(skip_all, fields(hosts = hosts.len()))]
pub async fn run_manager(
    endpoints: Endpoints,
    config: &SyncConfig,
    stats: Arc<Stats>,
    launcher: Arc<dyn Launcher>,
    hosts: Vec<SshSession>,
    bind: std::net::SocketAddr,
) -> anyhow::Result<Summary> {
    let pipeline = Pipeline::new(&endpoints, config, &stats)?;
    let (tx, rx) = async_channel::bounded(TASK_QUEUE);
    let server = remote::manager::ManagerServer::start(bind, rx.clone(), stats.clone()).await?;
    let addr = match server.advertised_addr() {
        Ok(addr) => addr,
        Err(err) => {
            server.shutdown().await?;
            return Err(err.context("cannot determine the address workers should connect to"));
        }
    };
    tracing::info!(
        "manager at {} (bound to {}), starting {} workers",
        addr,
        server.local_addr(),
        hosts.len()
    );
    let launched = tokio::spawn(remote::launcher::launch_workers(launcher, hosts, addr));
    let local = pipeline.spawn(rx, config.threads);
    let produced = produce_tasks(&endpoints, config, tx, &stats, pipeline.perms()).await;
    let drained = local.await;
    let succeeded = launched.await;
    // every worker has exited, so no file deletion is still in flight
    if matches!(drained, Ok(Ok(()))) {
        pipeline.remove_dirs(&produced).await;
    }
    pipeline.stop();
    server.shutdown().await?;
    drained??;
    tracing::info!("{} workers finished", succeeded?);
    produced?;
    Ok(stats.summary())
}

/// Execute tasks handed out by the manager at `manager`.
#[instrument(skip_all, fields(manager = %manager))]
pub async fn run_worker(
    endpoints: Endpoints,
    config: &SyncConfig,
    stats: Arc<Stats>,
    manager: &str,
    retry: RetryPolicy,
) -> anyhow::Result<Summary> {
    let pipeline = Pipeline::new(&endpoints, config, &stats)?;
    let client = Arc::new(remote::worker::ManagerClient::new(manager, retry));
    let flusher = remote::worker::StatsFlusher::spawn(
        stats.clone(),
        client.clone(),
        retry,
        remote::worker::STATS_INTERVAL,
    );
    let (tx, rx) = async_channel::bounded(TASK_QUEUE);
    let local = pipeline.spawn(rx, config.threads);
    let fetched = remote::worker::fetch_tasks(&client, tx).await;
    let drained = local.await;
    pipeline.stop();
    let sent = flusher.finish().await;
    drained??;
    let received = fetched?;
    let sent = sent?;
    tracing::info!("worker finished {} tasks", received);
    Ok(Summary {
        stat: sent,
        skipped: stats.skipped(),
        checked: stats.checked(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::object::MemStorage;

    /// Runs workers in this process against the same storages
    struct InProcess {
        endpoints: Endpoints,
        config: SyncConfig,
    }

    #[async_trait::async_trait]
    impl Launcher for InProcess {
        async fn launch(
            &self,
            _host: &SshSession,
            manager_addr: std::net::SocketAddr,
        ) -> anyhow::Result<()> {
            run_worker(
                self.endpoints.clone(),
                &self.config,
                Arc::new(Stats::new()),
                &manager_addr.to_string(),
                RetryPolicy {
                    initial: std::time::Duration::from_millis(10),
                    ..Default::default()
                },
            )
            .await?;
            Ok(())
        }
    }

    fn endpoints(keys: usize) -> (Arc<MemStorage>, Arc<MemStorage>, Endpoints) {
        let src = Arc::new(MemStorage::new("src"));
        let dst = Arc::new(MemStorage::new("dst"));
        for n in 0..keys {
            src.insert(&format!("dir{}/key{n:04}", n % 7), format!("value {n}"), 0);
        }
        dst.insert("stale", "x", 0);
        let endpoints = Endpoints {
            src: src.clone(),
            dst: dst.clone(),
        };
        (src, dst, endpoints)
    }

    #[tokio::test]
    async fn local_sync_is_idempotent() {
        let (src, dst, endpoints) = endpoints(50);
        let config = SyncConfig {
            delete_dst: true,
            ..Default::default()
        };
        let summary = run_local(endpoints.clone(), &config, Arc::new(Stats::new()))
            .await
            .unwrap();
        assert_eq!(summary.stat.copied, 50);
        assert_eq!(summary.stat.deleted, 1);
        assert_eq!(dst.keys(), src.keys());
        let again = run_local(endpoints, &config, Arc::new(Stats::new()))
            .await
            .unwrap();
        assert_eq!(again.stat.copied, 0);
        assert_eq!(again.stat.deleted, 0);
        assert_eq!(again.skipped, 50);
    }

    #[tokio::test]
    async fn limit_zero_does_nothing() {
        let (_, dst, endpoints) = endpoints(10);
        let config = SyncConfig {
            limit: Some(0),
            ..Default::default()
        };
        let summary = run_local(endpoints, &config, Arc::new(Stats::new()))
            .await
            .unwrap();
        assert_eq!(summary.stat, common::Stat::default());
        assert_eq!(dst.calls.mutations(), 0);
    }

    fn local_endpoints(src: &tempfile::TempDir, dst: &tempfile::TempDir) -> Endpoints {
        let (src, dst) = crate::uri::open(
            &format!("{}/", src.path().display()),
            &format!("{}/", dst.path().display()),
            true,
        )
        .unwrap();
        Endpoints { src, dst }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bandwidth_limit_applies_to_local_copies() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("big"), vec![7u8; 500_000]).unwrap();
        let config = SyncConfig {
            bwlimit: 8,
            ..Default::default()
        };
        let start = std::time::Instant::now();
        let summary = run_local(local_endpoints(&src, &dst), &config, Arc::new(Stats::new()))
            .await
            .unwrap();
        let elapsed = start.elapsed();
        assert_eq!(summary.stat.copied, 1);
        assert_eq!(summary.stat.copied_bytes, 500_000);
        assert_eq!(std::fs::read(dst.path().join("big")).unwrap().len(), 500_000);
        // 8 Mbps is 100 000 bytes per 100ms; past the first interval the file waits for 4 refills
        assert!(
            elapsed >= std::time::Duration::from_millis(350),
            "copied too fast: {elapsed:?}"
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn directories_are_removed_after_their_content() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();
        for dir in 0..4 {
            let sub = dst.path().join(format!("x{dir}/sub"));
            std::fs::create_dir_all(&sub).unwrap();
            for file in 0..25 {
                std::fs::write(sub.join(format!("f{file}")), "data").unwrap();
            }
        }
        let config = SyncConfig {
            dirs: true,
            delete_dst: true,
            threads: 16,
            ..Default::default()
        };
        let start = std::time::Instant::now();
        let summary = run_local(local_endpoints(&src, &dst), &config, Arc::new(Stats::new()))
            .await
            .unwrap();
        assert_eq!(summary.stat.failed, 0);
        // 100 files, then x{n}/sub/ and x{n}/
        assert_eq!(summary.stat.deleted, 108);
        assert!(std::fs::read_dir(dst.path()).unwrap().next().is_none());
        // a directory removed too early is only retried after a delay of at least a second
        assert!(start.elapsed() < std::time::Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn manager_and_workers_share_the_work() {
        let (src, dst, endpoints) = endpoints(1000);
        let config = SyncConfig {
            delete_dst: true,
            threads: 2,
            ..Default::default()
        };
        let worker_config = SyncConfig {
            manager: Some("unused".to_string()),
            ..config.clone()
        };
        let launcher = Arc::new(InProcess {
            endpoints: endpoints.clone(),
            config: worker_config,
        });
        let hosts = SshSession::parse_list(&["w1,w2".to_string()]).unwrap();
        let summary = run_manager(
            endpoints,
            &config,
            Arc::new(Stats::new()),
            launcher,
            hosts,
            "127.0.0.1:0".parse().unwrap(),
        )
        .await
        .unwrap();
        // every task is executed exactly once, by the manager or one of the workers
        assert_eq!(summary.stat.copied, 1000);
        assert_eq!(summary.stat.deleted, 1);
        assert_eq!(summary.stat.failed, 0);
        assert_eq!(dst.keys(), src.keys());
        assert_eq!(
            dst.calls.put.load(std::sync::atomic::Ordering::Relaxed),
            1000
        );
    }
}
