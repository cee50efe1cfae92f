use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::debug;

/// Capacity and refill rate for a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Maximum number of tokens the bucket can hold (burst size).
    pub capacity: u32,
    /// Tokens added per second.
    pub refill_rate: f64,
}

impl BucketConfig {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_refill_rate(mut self, refill_rate: f64) -> Self {
        self.refill_rate = refill_rate;
        self
    }
}

impl Default for BucketConfig {
    /// Per-caller default: 100 tokens, 10 per second.
    fn default() -> Self {
        Self::new(100, 10.0)
    }
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketStats {
    pub capacity: u32,
    pub tokens: f64,
    pub refill_rate: f64,
    pub fill_percentage: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuous-refill token bucket.
///
/// Tokens accrue at `refill_rate` per second up to `capacity` and are spent by
/// successful acquisitions. The refill-and-spend sequence runs under one
/// exclusive lock which is never held across a sleep.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// A new bucket starts full.
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: BucketConfig) -> Self {
        Self::new(config.capacity, config.refill_rate)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Time to accrue `deficit` tokens, or `None` when the rate is too slow
    /// for the wait to fit in a `Duration`.
    fn refill_time(&self, deficit: f64) -> Option<Duration> {
        if self.refill_rate <= 0.0 {
            return None;
        }
        Duration::try_from_secs_f64(deficit / self.refill_rate).ok()
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(f64::from(self.capacity));
        state.last_refill = now;
    }

    /// Non-blocking acquisition. Returns `false` without waiting on shortfall.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        self.try_acquire_or_deficit(tokens).is_ok()
    }

    /// On failure, returns the token shortfall after refill.
    fn try_acquire_or_deficit(&self, tokens: u32) -> Result<(), f64> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let requested = f64::from(tokens);
        if state.tokens >= requested {
            state.tokens -= requested;
            debug!(tokens, remaining = state.tokens, "acquired tokens");
            Ok(())
        } else {
            Err(requested - state.tokens)
        }
    }

    /// Acquire `tokens`, optionally waiting for the refill.
    ///
    /// With `blocking`, a shortfall sleeps for `deficit / refill_rate` and then
    /// retries exactly once. Under sustained contention the call can still
    /// return `false`.
    pub async fn acquire(&self, tokens: u32, blocking: bool) -> bool {
        let deficit = match self.try_acquire_or_deficit(tokens) {
            Ok(()) => return true,
            Err(deficit) => deficit,
        };

        if !blocking || tokens > self.capacity {
            debug!(tokens, deficit, "rate limit exceeded");
            return false;
        }
        let Some(wait) = self.refill_time(deficit) else {
            debug!(tokens, deficit, refill_rate = self.refill_rate, "refill too slow to wait for");
            return false;
        };

        debug!(tokens, wait_ms = wait.as_millis() as u64, "waiting for token refill");
        tokio::time::sleep(wait).await;
        self.try_acquire(tokens)
    }

    /// Time until `tokens` would be available; zero if they are available now,
    /// `Duration::MAX` if the refill rate never gets there.
    pub fn wait_for_tokens(&self, tokens: u32) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let requested = f64::from(tokens);
        if state.tokens >= requested {
            return Duration::ZERO;
        }
        self.refill_time(requested - state.tokens).unwrap_or(Duration::MAX)
    }

    pub fn stats(&self) -> BucketStats {
        let mut state = self.state.lock();
        self.refill(&mut state);
        let fill_percentage = if self.capacity == 0 {
            0.0
        } else {
            state.tokens / f64::from(self.capacity) * 100.0
        };
        BucketStats {
            capacity: self.capacity,
            tokens: state.tokens,
            refill_rate: self.refill_rate,
            fill_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ten_succeed_then_eleventh_fails_then_refills() {
        let bucket = TokenBucket::new(10, 1.0);
        for _ in 0..10 {
            assert!(bucket.acquire(1, false).await);
        }
        assert!(!bucket.acquire(1, false).await);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(bucket.acquire(1, false).await);
        assert!(!bucket.acquire(1, false).await);
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(5, 100.0);
        tokio::time::advance(Duration::from_secs(60)).await;
        let stats = bucket.stats();
        assert_eq!(stats.tokens, 5.0);
        assert_eq!(stats.fill_percentage, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_waits_for_deficit() {
        let bucket = TokenBucket::new(2, 2.0);
        assert!(bucket.try_acquire(2));

        let start = Instant::now();
        assert!(bucket.acquire(1, true).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(500));
        assert!(waited < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn blocking_acquire_beyond_capacity_fails_fast() {
        let bucket = TokenBucket::new(3, 1.0);
        let start = Instant::now();
        assert!(!bucket.acquire(4, true).await);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_tokens_reports_deficit() {
        let bucket = TokenBucket::new(4, 2.0);
        assert_eq!(bucket.wait_for_tokens(1), Duration::ZERO);
        assert!(bucket.try_acquire(4));
        assert_eq!(bucket.wait_for_tokens(3), Duration::from_millis(1500));
        // Asking does not spend tokens.
        tokio::time::advance(Duration::from_millis(1500)).await;
        assert!(bucket.try_acquire(3));
    }

    #[tokio::test(start_paused = true)]
    async fn vanishing_refill_rate_does_not_overflow_duration() {
        let bucket = TokenBucket::new(1, 1e-20);
        assert!(bucket.try_acquire(1));
        assert_eq!(bucket.wait_for_tokens(1), Duration::MAX);

        let start = Instant::now();
        assert!(!bucket.acquire(1, true).await);
        assert_eq!(start.elapsed(), Duration::ZERO);

        let stalled = TokenBucket::new(1, 0.0);
        assert!(stalled.try_acquire(1));
        assert_eq!(stalled.wait_for_tokens(1), Duration::MAX);
        assert!(!stalled.acquire(1, true).await);
    }

    #[tokio::test(start_paused = true)]
    async fn stats_reflect_spending() {
        let bucket = TokenBucket::new(10, 1.0);
        assert!(bucket.try_acquire(5));
        let stats = bucket.stats();
        assert_eq!(stats.capacity, 10);
        assert_eq!(stats.tokens, 5.0);
        assert_eq!(stats.refill_rate, 1.0);
        assert_eq!(stats.fill_percentage, 50.0);
    }

    #[test]
    fn config_builders() {
        let cfg = BucketConfig::default().with_capacity(7).with_refill_rate(0.5);
        assert_eq!(cfg, BucketConfig::new(7, 0.5));
        let bucket = TokenBucket::from_config(cfg);
        assert_eq!(bucket.capacity(), 7);
        assert_eq!(bucket.refill_rate(), 0.5);
    }

    #[test]
    fn config_serializes() {
        let json = serde_json::to_string(&BucketConfig::new(50, 5.0)).unwrap();
        let back: BucketConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.capacity, 50);
        assert_eq!(back.refill_rate, 5.0);
    }
}
