//! Shared library of the `osync` object synchronizer
//!
//! The building blocks of a sync run:
//!
//! - [`object`]: the storage port, capability traits and the built-in backends
//! - [`listing`]: sorted (optionally concurrent) listing of a whole storage
//! - [`filter`]: include/exclude rules applied per path level
//! - [`diff`]: merge of two sorted listings into a stream of [`object::Task`]s
//! - [`transfer`]: workers executing tasks with retries, verification and throttling
//! - [`stats`]: counters shared by everything above, mergeable across processes
//!
//! [`run`] wraps an async entry point with logging, a tokio runtime, progress printing and the
//! final summary.

use std::sync::Arc;

pub mod checksum;
pub mod config;
pub mod diff;
pub mod filter;
pub mod listing;
pub mod object;
pub mod progress;
pub mod stats;
pub mod transfer;

pub use config::{OutputConfig, ProgressSettings, RuntimeConfig, SyncConfig};
pub use stats::{Stat, Stats, StatsSink, Summary};

fn log_filter(output: &OutputConfig) -> tracing_subscriber::EnvFilter {
    if output.quiet {
        return tracing_subscriber::EnvFilter::new("off");
    }
    let level = match output.verbose {
        0 => "error",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level))
}

fn build_runtime(runtime: &RuntimeConfig) -> anyhow::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all();
    if runtime.max_workers > 0 {
        builder.worker_threads(runtime.max_workers);
    }
    if runtime.max_blocking_threads > 0 {
        builder.max_blocking_threads(runtime.max_blocking_threads);
    }
    Ok(builder.build()?)
}

/// Run `func` to completion and report the outcome.
///
/// Returns `None` when `func` failed or any object failed to sync; the caller is expected to
/// exit with a non-zero status then.
pub fn run<Fut>(
    progress: Option<ProgressSettings>,
    output: OutputConfig,
    runtime: RuntimeConfig,
    stats: Arc<Stats>,
    func: impl FnOnce() -> Fut,
) -> Option<Summary>
where
    Fut: std::future::Future<Output = anyhow::Result<Summary>>,
{
    // a second call in the same process keeps the first subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(log_filter(&output))
        .with_writer(std::io::stdout)
        .with_target(false)
        .try_init();
    let runtime = match build_runtime(&runtime) {
        Ok(runtime) => runtime,
        Err(error) => {
            tracing::error!("failed to start tokio runtime: {:#}", error);
            if !output.quiet {
                eprintln!("osync: failed to start tokio runtime: {error:#}");
            }
            return None;
        }
    };
    let res = runtime.block_on(async move {
        let printer = progress.map(|settings| {
            tokio::spawn(progress::run_printer(stats.clone(), settings.delay))
        });
        let res = func().await;
        if let Some(printer) = printer {
            printer.abort();
        }
        res
    });
    match res {
        Ok(summary) => {
            if output.print_summary || output.verbose > 0 {
                println!("{summary}");
            }
            if summary.stat.failed > 0 {
                tracing::error!("{} objects failed to sync", summary.stat.failed);
                return None;
            }
            Some(summary)
        }
        Err(error) => {
            tracing::error!("{:#}", error);
            if !output.quiet {
                eprintln!("osync: {error:#}");
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_objects_fail_the_run() {
        let stats = Arc::new(Stats::new());
        let output = OutputConfig {
            quiet: true,
            ..Default::default()
        };
        let ok = run(None, output, RuntimeConfig::default(), stats.clone(), {
            let stats = stats.clone();
            || async move {
                stats.inc_copied(10);
                Ok(stats.summary())
            }
        });
        assert_eq!(ok.map(|summary| summary.stat.copied), Some(1));
        let failed = run(None, output, RuntimeConfig::default(), stats.clone(), {
            let stats = stats.clone();
            || async move {
                stats.inc_failed();
                Ok(stats.summary())
            }
        });
        assert!(failed.is_none());
        let errored = run(None, output, RuntimeConfig::default(), stats, || async {
            Err::<Summary, _>(anyhow::anyhow!("setup failed"))
        });
        assert!(errored.is_none());
    }

    #[test]
    fn verbosity_maps_to_levels() {
        let filter = |quiet, verbose| {
            log_filter(&OutputConfig {
                quiet,
                verbose,
                print_summary: false,
            })
            .to_string()
        };
        if std::env::var_os("RUST_LOG").is_none() {
            assert_eq!(filter(false, 0), "error");
            assert_eq!(filter(false, 2), "debug");
            assert_eq!(filter(false, 5), "trace");
        }
        assert_eq!(filter(true, 3), "off");
    }
}
