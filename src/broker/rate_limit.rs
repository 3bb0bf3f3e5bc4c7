// =============================================================================
// Rate Limiter — global token bucket for broker calls
// =============================================================================
//
// The brokerage budget (default 200 requests per minute) is self-imposed and
// shared by every adapter call in the process. The bucket refills
// continuously; callers `acquire()` before sending and are put to sleep when
// the bucket is dry, so upstream code only ever observes latency.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Thread-safe token bucket. One instance is shared by all broker calls.
pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    /// Create a bucket allowing `per_minute` requests per minute, starting
    /// full.
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub async fn acquire(&self) {
        loop {
            match self.try_take() {
                None => return,
                Some(wait) => {
                    warn!(wait_ms = wait.as_millis() as u64, "broker rate limit reached, backing off");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Take one token if available. Returns the wait duration until a token
    /// will exist otherwise.
    fn try_take(&self) -> Option<Duration> {
        let mut s = self.state.lock();

        let elapsed = s.last_refill.elapsed().as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = Instant::now();

        if s.tokens >= 1.0 {
            s.tokens -= 1.0;
            debug!(remaining = s.tokens as u64, "rate limit token taken");
            None
        } else {
            let deficit = 1.0 - s.tokens;
            Some(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Tokens currently available (diagnostics only).
    pub fn available(&self) -> f64 {
        let mut s = self.state.lock();
        let elapsed = s.last_refill.elapsed().as_secs_f64();
        s.tokens = (s.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        s.last_refill = Instant::now();
        s.tokens
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("capacity", &self.capacity)
            .field("refill_per_sec", &self.refill_per_sec)
            .finish()
    }
}
