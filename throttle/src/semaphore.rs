use std::sync::atomic::{AtomicBool, Ordering};

/// Token bucket backed by a tokio semaphore.
///
/// Disabled until `setup` is called with a non-zero value.
#[derive(Debug)]
pub struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(0),
        }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn consume_many(&self, value: u32) {
        if !self.is_enabled() || value == 0 {
            return;
        }
        // the semaphore is never closed, an error here means there is nothing to wait for
        if let Ok(permit) = self.sem.acquire_many(value).await {
            permit.forget();
        }
    }

    pub async fn run_replenish_thread(&self, replenish: usize, interval: std::time::Duration) {
        if !self.is_enabled() {
            return;
        }
        loop {
            tokio::time::sleep(interval).await;
            let curr_permits = self.sem.available_permits();
            if curr_permits >= replenish {
                continue;
            }
            self.sem.add_permits(replenish - curr_permits);
        }
    }
}

impl Default for Semaphore {
    fn default() -> Self {
        Self::new()
    }
}
