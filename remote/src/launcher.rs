//! Starting workers on other hosts

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use std::sync::Arc;

use crate::SshSession;

/// Starts one worker process pointed at the manager and waits for it to exit.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, host: &SshSession, manager_addr: std::net::SocketAddr)
    -> anyhow::Result<()>;
}

/// Command line for a worker: the manager's arguments without the program name and any worker
/// list, plus the manager address.
pub fn worker_args(args: &[String], manager_addr: std::net::SocketAddr) -> Vec<String> {
    let mut result = Vec::with_capacity(args.len() + 2);
    let mut iter = args.iter().skip(1);
    while let Some(arg) = iter.next() {
        if arg == "--" {
            result.push(arg.clone());
            result.extend(iter.cloned());
            break;
        }
        if arg == "--worker" || arg == "--manager" {
            iter.next();
            continue;
        }
        if arg.starts_with("--worker=") || arg.starts_with("--manager=") {
            continue;
        }
        result.push(arg.clone());
    }
    let (options, positional) = match result.iter().position(|arg| arg == "--") {
        Some(pos) => result.split_at(pos),
        None => (result.as_slice(), &[][..]),
    };
    let mut args: Vec<String> = options.to_vec();
    args.push("--manager".to_string());
    args.push(manager_addr.to_string());
    args.extend(positional.iter().cloned());
    args
}

/// Copies the running executable to the host over SSH and runs it as a worker
pub struct SshLauncher {
    args: Vec<String>,
}

impl SshLauncher {
    /// `args` are the manager's own command line arguments, program name included.
    pub fn new(args: Vec<String>) -> Self {
        Self { args }
    }
}

#[async_trait]
impl Launcher for SshLauncher {
    async fn launch(
        &self,
        host: &SshSession,
        manager_addr: std::net::SocketAddr,
    ) -> anyhow::Result<()> {
        let session = crate::setup_ssh_session(host).await?;
        let current_exe =
            std::env::current_exe().context("Failed to get current executable path")?;
        let remote_path =
            crate::deploy::deploy_binary(&session, &current_exe, &host.to_string()).await?;
        let args = worker_args(&self.args, manager_addr);
        tracing::info!("starting worker on {}: {} {:?}", host, remote_path, args);
        let output = session
            .arc_command(&remote_path)
            .args(&args)
            .output()
            .await
            .with_context(|| format!("failed to run worker on {host}"))?;
        if !output.status.success() {
            return Err(anyhow!(
                "worker on {} failed, status code: {:?}\nstdout:\n{}\nstderr:\n{}",
                host,
                output.status.code(),
                String::from_utf8_lossy(&output.stdout),
                String::from_utf8_lossy(&output.stderr),
            ));
        }
        tracing::info!("worker on {} finished", host);
        tracing::debug!(
            "worker on {} output:\n{}",
            host,
            String::from_utf8_lossy(&output.stdout)
        );
        Ok(())
    }
}

/// Launch a worker on every host concurrently and wait for all of them.
///
/// A failing host is logged and does not affect the others. Returns the number of workers that
/// finished successfully.
pub async fn launch_workers(
    launcher: Arc<dyn Launcher>,
    hosts: Vec<SshSession>,
    manager_addr: std::net::SocketAddr,
) -> usize {
    let mut join_set = tokio::task::JoinSet::new();
    for host in hosts {
        let launcher = launcher.clone();
        join_set.spawn(async move {
            let res = launcher.launch(&host, manager_addr).await;
            (host, res)
        });
    }
    let mut succeeded = 0;
    while let Some(res) = join_set.join_next().await {
        match res {
            Ok((_, Ok(()))) => succeeded += 1,
            Ok((host, Err(err))) => tracing::error!("worker on {} failed: {:#}", host, err),
            Err(err) => tracing::error!("worker launch task failed: {}", err),
        }
    }
    succeeded
}
