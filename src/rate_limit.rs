use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{sleep, Instant};

/// Global minimum spacing between outbound provider calls.
///
/// The check, the wait and the timestamp update all happen while holding the
/// async mutex, so concurrent callers queue up and are released one interval
/// apart.
pub struct RateLimiter {
    min_interval_ms: AtomicU64,
    last_grant: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval_ms: u64) -> Self {
        Self {
            min_interval_ms: AtomicU64::new(min_interval_ms),
            last_grant: AsyncMutex::new(None),
        }
    }

    pub fn set_interval_ms(&self, min_interval_ms: u64) {
        self.min_interval_ms.store(min_interval_ms, Ordering::SeqCst);
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms.load(Ordering::SeqCst))
    }

    /// Suspends until the caller may issue its request; returns the instant
    /// the slot was granted.
    pub async fn acquire(&self) -> Instant {
        let mut guard = self.last_grant.lock().await;
        let interval = self.interval();
        if let Some(prev) = *guard {
            let elapsed = prev.elapsed();
            if elapsed < interval {
                sleep(interval - elapsed).await;
            }
        }
        let granted = Instant::now();
        *guard = Some(granted);
        granted
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures_util::future::join_all;

    use super::*;

    #[tokio::test]
    async fn first_acquire_is_immediate() {
        let limiter = RateLimiter::new(5_000);
        let started = Instant::now();
        limiter.acquire().await;
        assert!(started.elapsed() < Duration::from_millis(1_000));
    }

    #[tokio::test]
    async fn spaces_concurrent_acquisitions() {
        let limiter = Arc::new(RateLimiter::new(40));
        let workers = (0..5).map(|_| {
            let limiter = Arc::clone(&limiter);
            async move { limiter.acquire().await }
        });
        let mut grants = join_all(workers).await;
        grants.sort();

        for pair in grants.windows(2) {
            assert!(
                pair[1] - pair[0] >= Duration::from_millis(40),
                "grants too close: {:?}",
                pair[1] - pair[0]
            );
        }
    }

    #[tokio::test]
    async fn spaces_acquisitions_across_spawned_tasks() {
        let limiter = Arc::new(RateLimiter::new(25));
        let handles = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect::<Vec<_>>();
        let mut grants = Vec::new();
        for handle in handles {
            grants.push(handle.await.unwrap());
        }
        grants.sort();
        assert!(grants[3] - grants[0] >= Duration::from_millis(75));
    }

    #[tokio::test]
    async fn interval_can_change_between_calls() {
        let limiter = RateLimiter::new(10_000);
        limiter.set_interval_ms(0);
        let first = limiter.acquire().await;
        let second = limiter.acquire().await;
        assert!(second >= first);
        assert_eq!(limiter.interval(), Duration::ZERO);
    }
}
