//! Manager HTTP protocol
//!
//! `GET /fetch` returns a JSON array of at most [`MAX_BATCH`] tasks and `[]` once the manager has
//! nothing left to hand out. `POST /stats` takes a JSON [`common::Stat`] delta and answers
//! [`STATS_OK`] once it has been added to the manager's totals.

pub const FETCH_PATH: &str = "/fetch";
pub const STATS_PATH: &str = "/stats";

/// Maximum number of tasks in one `/fetch` response
pub const MAX_BATCH: usize = 100;

pub const STATS_OK: &str = "OK";
pub const POST_REQUIRED: &str = "POST required";

/// Bounded exponential backoff for calls to the manager
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial: std::time::Duration,
    pub max_delay: std::time::Duration,
    /// consecutive failures after which the caller gives up
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: std::time::Duration::from_secs(1),
            max_delay: std::time::Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure.
    pub fn delay(&self, failures: u32) -> std::time::Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max_delay)
    }

    /// Run `op` until it succeeds or fails `max_attempts` times in a row.
    pub async fn retry<T, F, Fut>(&self, what: &str, mut op: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = anyhow::Result<T>>,
    {
        let mut failures = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    failures += 1;
                    if failures >= self.max_attempts {
                        return Err(err.context(format!("{what} failed {failures} times")));
                    }
                    let delay = self.delay(failures);
                    tracing::warn!("{} failed, retrying in {:?}: {:#}", what, delay, err);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
