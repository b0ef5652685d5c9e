//! Restart throttling for crashed processes.
//!
//! A token bucket holding `max_restarts` tokens, refilled evenly over the
//! window. A disabled limiter never hands out a token again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use tokio::sync::{Mutex, Notify};

use crate::config::RestartSettings;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket guarding automatic restarts of one process
pub struct RestartLimiter {
    capacity: f64,
    refill_every: Duration,
    bucket: Mutex<Bucket>,
    disabled: AtomicBool,
    wake: Notify,
}

impl RestartLimiter {
    pub fn new(settings: &RestartSettings) -> Self {
        let capacity = settings.max_restarts.max(1);
        let window = Duration::from_secs(settings.window_seconds.max(1));

        Self {
            capacity: capacity as f64,
            refill_every: window / capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
            disabled: AtomicBool::new(false),
            wake: Notify::new(),
        }
    }

    /// Wait for a restart token.
    ///
    /// Returns `false` once the limiter is disabled; no restart may follow.
    pub async fn acquire(&self) -> bool {
        loop {
            // Register before checking the flag so a concurrent disable() is not missed
            let notified = self.wake.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.is_disabled() {
                return false;
            }

            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket);

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return true;
                }

                let missing = 1.0 - bucket.tokens;
                self.refill_every.mul_f64(missing)
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = &mut notified => {}
            }
        }
    }

    /// Permanently refuse further restarts
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    fn refill(&self, bucket: &mut Bucket) {
        let elapsed = bucket.last_refill.elapsed();
        let earned = elapsed.as_secs_f64() / self.refill_every.as_secs_f64();
        bucket.tokens = (bucket.tokens + earned).min(self.capacity);
        bucket.last_refill = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn settings(max_restarts: u32, window_seconds: u64) -> RestartSettings {
        RestartSettings {
            max_restarts,
            window_seconds,
        }
    }

    #[tokio::test]
    async fn test_burst_is_immediate() {
        let limiter = RestartLimiter::new(&settings(3, 60));
        let start = Instant::now();

        for _ in 0..3 {
            assert!(limiter.acquire().await);
        }

        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn test_exhausted_bucket_waits() {
        let limiter = Arc::new(RestartLimiter::new(&settings(1, 3600)));
        assert!(limiter.acquire().await);

        let waiting = limiter.clone();
        let result = tokio::time::timeout(Duration::from_millis(100), async move {
            waiting.acquire().await
        })
        .await;

        assert!(result.is_err(), "second token should not be available yet");
    }

    #[tokio::test]
    async fn test_disable_releases_waiters() {
        let limiter = Arc::new(RestartLimiter::new(&settings(1, 3600)));
        assert!(limiter.acquire().await);

        let waiting = limiter.clone();
        let task = tokio::spawn(async move { waiting.acquire().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.disable();

        let granted = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert!(!granted);
        assert!(!limiter.acquire().await);
    }
}
