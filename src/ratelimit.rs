//! Token-bucket rate limiter shared across workers.
//!
//! One bucket fronts the mailbox adapter, another the classifier. Refill is
//! computed lazily from elapsed time; `acquire` sleeps until a token is
//! available, so callers just await it before each external call.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

pub struct TokenBucket {
    rate_per_sec: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// `rate_per_sec` tokens accrue per second up to `burst`. A
    /// non-positive rate disables limiting entirely.
    pub fn new(rate_per_sec: f64, burst: u32) -> Self {
        Self {
            rate_per_sec,
            burst: burst.max(1) as f64,
            state: Mutex::new(BucketState {
                tokens: burst.max(1) as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        if self.rate_per_sec <= 0.0 {
            return;
        }
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    Some(Duration::from_secs_f64(
                        (1.0 - state.tokens) / self.rate_per_sec,
                    ))
                }
            };
            match wait {
                None => return,
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Take a token only if one is free right now.
    pub async fn try_acquire(&self) -> bool {
        if self.rate_per_sec <= 0.0 {
            return true;
        }
        let mut state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.burst);
        state.last_refill = Instant::now();
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn burst_tokens_available_immediately() {
        let bucket = TokenBucket::new(1.0, 3);
        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        tokio::time::pause();
        let bucket = TokenBucket::new(10.0, 1);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(bucket.try_acquire().await);
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        tokio::time::pause();
        let bucket = TokenBucket::new(100.0, 1);
        bucket.acquire().await;
        let start = Instant::now();
        let acquire = bucket.acquire();
        tokio::pin!(acquire);
        // not ready immediately
        assert!(
            tokio::time::timeout(Duration::from_millis(1), &mut acquire)
                .await
                .is_err()
        );
        tokio::time::advance(Duration::from_millis(20)).await;
        acquire.await;
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn zero_rate_disables_limiting() {
        let bucket = TokenBucket::new(0.0, 1);
        for _ in 0..100 {
            bucket.acquire().await;
        }
    }
}
