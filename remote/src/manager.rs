//! Manager side of a distributed sync
//!
//! The manager owns the task channel fed by the differ. Every `/fetch` waits for one task and then
//! takes whatever else is ready, up to [`MAX_BATCH`]; once the channel is closed and drained each
//! request gets an empty batch. Deltas pushed to `/stats` go straight into the manager's
//! [`Stats`].

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{any, get},
};
use common::Stats;
use common::object::Task;
use std::sync::Arc;

use crate::protocol::{FETCH_PATH, MAX_BATCH, POST_REQUIRED, STATS_OK, STATS_PATH};

#[derive(Clone)]
struct ManagerState {
    tasks: async_channel::Receiver<Task>,
    stats: Arc<Stats>,
}

pub fn router(tasks: async_channel::Receiver<Task>, stats: Arc<Stats>) -> Router {
    Router::new()
        .route(FETCH_PATH, get(fetch_handler))
        .route(STATS_PATH, any(stats_handler))
        .with_state(ManagerState { tasks, stats })
}

/// Wait for one task, then take what is ready without waiting; empty once closed and drained.
pub async fn next_batch(tasks: &async_channel::Receiver<Task>) -> Vec<Task> {
    let Ok(first) = tasks.recv().await else {
        return Vec::new();
    };
    let mut batch = vec![first];
    while batch.len() < MAX_BATCH {
        match tasks.try_recv() {
            Ok(task) => batch.push(task),
            Err(_) => break,
        }
    }
    batch
}

async fn fetch_handler(State(state): State<ManagerState>) -> Json<Vec<Task>> {
    let batch = next_batch(&state.tasks).await;
    tracing::debug!("handing out {} tasks", batch.len());
    Json(batch)
}

async fn stats_handler(
    State(state): State<ManagerState>,
    method: Method,
    body: Bytes,
) -> impl IntoResponse {
    if method != Method::POST {
        return (StatusCode::BAD_REQUEST, POST_REQUIRED.to_string());
    }
    match serde_json::from_slice::<common::Stat>(&body) {
        Ok(delta) => {
            tracing::trace!("stats from worker: {:?}", delta);
            state.stats.add(&delta);
            (StatusCode::OK, STATS_OK.to_string())
        }
        Err(err) => {
            tracing::warn!("invalid stats from worker: {}", err);
            (StatusCode::BAD_REQUEST, err.to_string())
        }
    }
}

/// Running manager HTTP server
pub struct ManagerServer {
    local_addr: std::net::SocketAddr,
    shutdown: tokio::sync::oneshot::Sender<()>,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl ManagerServer {
    /// Bind `bind` (port 0 picks an ephemeral port) and serve in the background.
    pub async fn start(
        bind: std::net::SocketAddr,
        tasks: async_channel::Receiver<Task>,
        stats: Arc<Stats>,
    ) -> anyhow::Result<Self> {
        let listener = tokio::net::TcpListener::bind(bind).await?;
        let local_addr = listener.local_addr()?;
        tracing::info!("manager listening on {}", local_addr);
        let (shutdown, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
        let app = router(tasks, stats);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });
        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Address workers on other hosts should use: the outbound IP of this host with the bound port.
    pub fn advertised_addr(&self) -> anyhow::Result<std::net::SocketAddr> {
        if !self.local_addr.ip().is_unspecified() {
            return Ok(self.local_addr);
        }
        let ip = crate::get_local_ip()?;
        Ok(std::net::SocketAddr::new(ip, self.local_addr.port()))
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.shutdown.send(());
        self.handle.await??;
        Ok(())
    }
}
