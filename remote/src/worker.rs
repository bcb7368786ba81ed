//! Worker side of a distributed sync
//!
//! A worker pulls batches from the manager into its local task channel and reports its statistics
//! periodically. Deltas are subtracted from the local ledger only after the manager acknowledged
//! them, so a lost `/stats` request is resent with the next flush.

use anyhow::{Context, bail};
use async_trait::async_trait;
use common::object::Task;
use common::{Stat, Stats, StatsSink};
use std::sync::Arc;

use crate::protocol::{FETCH_PATH, RetryPolicy, STATS_OK, STATS_PATH};

/// How often workers push their statistics
pub const STATS_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ManagerClient {
    client: reqwest::Client,
    base_url: String,
    retry: RetryPolicy,
}

impl ManagerClient {
    /// Client for the manager at `addr` (`host:port` or a full `http://` URL).
    pub fn new(addr: &str, retry: RetryPolicy) -> Self {
        let base_url = if addr.starts_with("http://") || addr.starts_with("https://") {
            addr.trim_end_matches('/').to_string()
        } else {
            format!("http://{addr}")
        };
        Self {
            client: reqwest::Client::new(),
            base_url,
            retry,
        }
    }

    pub async fn fetch(&self) -> anyhow::Result<Vec<Task>> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, FETCH_PATH))
            .send()
            .await
            .context("failed to fetch tasks")?
            .error_for_status()?;
        Ok(response.json().await.context("invalid task batch")?)
    }

    pub async fn send_stats(&self, delta: &Stat) -> anyhow::Result<()> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, STATS_PATH))
            .json(delta)
            .send()
            .await
            .context("failed to send stats")?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() || body != STATS_OK {
            bail!("manager rejected stats ({}): {}", status, body);
        }
        Ok(())
    }
}

#[async_trait]
impl StatsSink for ManagerClient {
    async fn push(&self, delta: &Stat) -> anyhow::Result<()> {
        self.send_stats(delta).await
    }
}

/// Move batches from the manager into `tasks` until the manager sends an empty batch.
///
/// The channel is closed when this returns, also when the manager stayed unreachable for the
/// configured number of attempts. Returns the number of received tasks.
pub async fn fetch_tasks(
    client: &ManagerClient,
    tasks: async_channel::Sender<Task>,
) -> anyhow::Result<u64> {
    let mut received = 0u64;
    let res = async {
        loop {
            let batch = client
                .retry
                .retry("fetching tasks", || client.fetch())
                .await?;
            if batch.is_empty() {
                tracing::info!("no more tasks, received {} in total", received);
                return Ok(());
            }
            tracing::debug!("received {} tasks", batch.len());
            for task in batch {
                tasks
                    .send(task)
                    .await
                    .context("task channel closed unexpectedly")?;
                received += 1;
            }
        }
    }
    .await;
    tasks.close();
    res.map(|()| received)
}

/// Background task pushing the local statistics to the manager
pub struct StatsFlusher {
    stats: Arc<Stats>,
    sink: Arc<dyn StatsSink>,
    retry: RetryPolicy,
    /// deltas the manager acknowledged
    sent: Arc<Stats>,
    stop: tokio::sync::watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl StatsFlusher {
    pub fn spawn(
        stats: Arc<Stats>,
        sink: Arc<dyn StatsSink>,
        retry: RetryPolicy,
        interval: std::time::Duration,
    ) -> Self {
        let (stop, mut stopped) = tokio::sync::watch::channel(false);
        let sent = Arc::new(Stats::new());
        let handle = tokio::spawn({
            let stats = stats.clone();
            let sink = sink.clone();
            let sent = sent.clone();
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {}
                        _ = stopped.changed() => return,
                    }
                    match stats.flush(&*sink).await {
                        Ok(delta) => sent.add(&delta),
                        Err(err) => tracing::warn!("failed to report stats: {:#}", err),
                    }
                }
            }
        });
        Self {
            stats,
            sink,
            retry,
            sent,
            stop,
            handle,
        }
    }

    /// Stop the periodic flushes and push what is left. Returns everything the manager accepted.
    pub async fn finish(self) -> anyhow::Result<Stat> {
        let _ = self.stop.send(true);
        if let Err(err) = self.handle.await {
            tracing::warn!("stats flusher ended abnormally: {}", err);
        }
        let stats = &self.stats;
        let sink = &*self.sink;
        let delta = self
            .retry
            .retry("reporting final stats", || stats.flush(sink))
            .await?;
        self.sent.add(&delta);
        Ok(self.sent.snapshot())
    }
}
