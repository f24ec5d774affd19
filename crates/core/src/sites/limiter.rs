//! Per-site request limiting.
//!
//! Two mechanisms compose: a semaphore bounds in-flight requests per site,
//! and a token bucket paces request starts to the site's rate limit.
//! Adapters acquire the limiter before every request.

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, SemaphorePermit};
use tokio::time::{Duration, Instant};

/// Token bucket: tokens refill at a constant rate and each request takes
/// one. The bucket starts full so a burst up to the capacity goes through
/// immediately.
pub struct TokenBucket {
    capacity: f32,
    tokens: f32,
    refill_rate: f32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(requests_per_minute: u32) -> Self {
        let capacity = requests_per_minute.max(1) as f32;
        Self {
            capacity,
            tokens: capacity,
            refill_rate: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    /// Take a token, or report how long to wait for one.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f32(needed / self.refill_rate))
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f32();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

/// Concurrency and pacing for one site.
pub struct SiteLimiter {
    semaphore: Arc<Semaphore>,
    bucket: Mutex<TokenBucket>,
}

impl SiteLimiter {
    pub fn new(max_concurrent: usize, requests_per_minute: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            bucket: Mutex::new(TokenBucket::new(requests_per_minute)),
        }
    }

    /// Wait for a concurrency slot and a pacing token.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("site semaphore never closed");
        loop {
            let wait = { self.bucket.lock().await.try_acquire() };
            match wait {
                Ok(()) => return permit,
                Err(d) => tokio::time::sleep(d).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_starts_full_and_empties() {
        let mut bucket = TokenBucket::new(3);
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        assert!(bucket.try_acquire().is_ok());
        let wait = bucket.try_acquire().unwrap_err();
        assert!(wait > Duration::ZERO);
        assert!(wait <= Duration::from_secs(21));
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_refills_over_time() {
        let mut bucket = TokenBucket::new(60);
        for _ in 0..60 {
            assert!(bucket.try_acquire().is_ok());
        }
        assert!(bucket.try_acquire().is_err());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(bucket.try_acquire().is_ok());
    }

    #[tokio::test]
    async fn limiter_bounds_concurrency() {
        let limiter = Arc::new(SiteLimiter::new(2, 6000));
        let p1 = limiter.acquire().await;
        let _p2 = limiter.acquire().await;
        assert_eq!(limiter.semaphore.available_permits(), 0);
        drop(p1);
        assert_eq!(limiter.semaphore.available_permits(), 1);
    }
}
