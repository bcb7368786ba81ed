//! Bandwidth throttling for object transfers
//!
//! This crate provides a shared byte budget that all transfer workers draw from before moving data.
//! It is a token bucket: the bucket holds at most one interval worth of bytes and a background task
//! tops it up every interval. A worker that finds the bucket empty is parked on the underlying
//! semaphore until the next refill, it never spins.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use throttle::Throttle;
//!
//! # async fn example() {
//! // 100 Mbps shared by every worker of this process
//! let throttle = Arc::new(Throttle::from_mbps(100));
//! let replenish = throttle.spawn_replenish();
//!
//! // before sending a 4 MiB part
//! throttle.consume(4 * 1024 * 1024).await;
//!
//! if let Some(handle) = replenish {
//!     handle.abort();
//! }
//! # }
//! ```
//!
//! # Token Calculation
//!
//! One token is one byte. With a limit of `L` Mbps and the default interval of 100ms the bucket is
//! refilled to:
//!
//! ```text
//! tokens = L * 1_000_000 / 8 / 10
//! ```
//!
//! Requests larger than the bucket are split into bucket-sized pieces, so a single large object
//! simply waits for as many refills as it needs.
//!
//! # Thread Safety
//!
//! A [`Throttle`] is meant to be shared behind an `Arc` across tasks and threads.

mod semaphore;

/// Default refill interval.
pub const DEFAULT_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

/// Number of bytes per second for a limit given in megabits per second.
pub fn mbps_to_bytes_per_sec(mbps: u64) -> u64 {
    mbps.saturating_mul(1_000_000) / 8
}

/// Shared byte budget; a zero budget means unlimited.
#[derive(Debug)]
pub struct Throttle {
    sem: semaphore::Semaphore,
    per_interval: usize,
    interval: std::time::Duration,
}

impl Throttle {
    pub fn new(per_interval: usize, interval: std::time::Duration) -> Self {
        let sem = semaphore::Semaphore::new();
        sem.setup(per_interval);
        Self {
            sem,
            per_interval,
            interval,
        }
    }

    pub fn unlimited() -> Self {
        Self::new(0, DEFAULT_INTERVAL)
    }

    /// Budget for a limit in megabits per second (0 = unlimited).
    ///
    /// Refilled every [`DEFAULT_INTERVAL`].
    pub fn from_mbps(mbps: u64) -> Self {
        let per_sec = mbps_to_bytes_per_sec(mbps);
        let intervals_per_sec = (1000 / DEFAULT_INTERVAL.as_millis()).max(1) as u64;
        let per_interval = if per_sec == 0 {
            0
        } else {
            (per_sec / intervals_per_sec).max(1)
        };
        Self::new(
            usize::try_from(per_interval).unwrap_or(usize::MAX),
            DEFAULT_INTERVAL,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.sem.is_enabled()
    }

    pub fn bytes_per_interval(&self) -> usize {
        self.per_interval
    }

    /// Wait until `bytes` can be sent.
    pub async fn consume(&self, bytes: u64) {
        if !self.is_enabled() {
            return;
        }
        let chunk = self.per_interval.min(u32::MAX as usize) as u64;
        let mut remaining = bytes;
        while remaining > 0 {
            let take = remaining.min(chunk);
            // take is bounded by chunk which fits in u32
            self.sem.consume_many(take as u32).await;
            remaining -= take;
        }
    }

    pub async fn run_replenish_thread(&self) {
        self.sem
            .run_replenish_thread(self.per_interval, self.interval)
            .await;
    }

    /// Start the background refill task; returns `None` when the throttle is disabled.
    pub fn spawn_replenish(
        self: &std::sync::Arc<Self>,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if !self.is_enabled() {
            return None;
        }
        tracing::debug!(
            "bandwidth throttle enabled: {} bytes every {:?}",
            self.per_interval,
            self.interval
        );
        let throttle = self.clone();
        Some(tokio::spawn(async move {
            throttle.run_replenish_thread().await;
        }))
    }
}

impl Default for Throttle {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn mbps_conversion() {
        assert_eq!(mbps_to_bytes_per_sec(0), 0);
        assert_eq!(mbps_to_bytes_per_sec(8), 1_000_000);
        let throttle = Throttle::from_mbps(8);
        assert_eq!(throttle.bytes_per_interval(), 100_000);
        assert!(throttle.is_enabled());
        assert!(!Throttle::from_mbps(0).is_enabled());
    }

    #[tokio::test(start_paused = true)]
    async fn unlimited_never_waits() {
        let throttle = Arc::new(Throttle::unlimited());
        assert!(throttle.spawn_replenish().is_none());
        let start = tokio::time::Instant::now();
        throttle.consume(u64::MAX).await;
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn consume_waits_for_replenish() {
        let throttle = Arc::new(Throttle::new(100, Duration::from_millis(100)));
        let replenish = throttle.spawn_replenish().unwrap();
        let start = tokio::time::Instant::now();
        // first 100 bytes come from the initial bucket, the rest needs two refills
        throttle.consume(300).await;
        assert!(start.elapsed() >= Duration::from_millis(200));
        replenish.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn shared_budget_across_tasks() {
        let throttle = Arc::new(Throttle::new(1000, Duration::from_millis(100)));
        let replenish = throttle.spawn_replenish().unwrap();
        let start = tokio::time::Instant::now();
        let mut join_set = tokio::task::JoinSet::new();
        for _ in 0..4 {
            let throttle = throttle.clone();
            join_set.spawn(async move { throttle.consume(1000).await });
        }
        while let Some(res) = join_set.join_next().await {
            res.unwrap();
        }
        // 4000 bytes at 1000 bytes per 100ms with a full initial bucket
        assert!(start.elapsed() >= Duration::from_millis(300));
        replenish.abort();
    }
}
