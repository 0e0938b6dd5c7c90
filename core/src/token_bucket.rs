//! Token-bucket bandwidth pacing for [`crate::segment_fetcher::SegmentFetcher`].
//!
//! Capacity `C` = the configured byte-rate limit; refill rate `R` = the same value,
//! i.e. the bucket fully replenishes in one second (SPEC_FULL.md GLOSSARY). A chunk of
//! size `n` is admitted iff at least `n` tokens are available; otherwise the caller
//! waits `(n - available) / R` seconds before the deduction succeeds.
//!
//! Grounded on the per-domain pacing state in the teacher's `download/rate_limiter.rs`
//! (an `Arc`-shared, `tokio::sync::Mutex`-guarded timing state updated from async
//! callers) but generalized from a single fixed inter-request delay into a genuine
//! leaky/token-bucket primitive, since SPEC_FULL.md §4.5 requires byte-rate pacing
//! rather than per-domain courtesy delay.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Shared, cloneable rate limiter. `0` capacity means unlimited (no-op `acquire`).
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// `limit` is bytes/sec; `0` disables pacing entirely.
    #[must_use]
    pub fn new(limit_bytes_per_sec: u64) -> Self {
        let capacity = limit_bytes_per_sec as f64;
        Self {
            capacity,
            refill_per_sec: capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.capacity <= 0.0
    }

    /// Refills based on elapsed time, then either deducts `n` tokens immediately or
    /// returns the `Duration` the caller must sleep before retrying.
    fn try_acquire(&self, n: u64) -> Result<(), Duration> {
        if self.is_unlimited() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;

        let needed = n as f64;
        if state.tokens >= needed {
            state.tokens -= needed;
            Ok(())
        } else {
            let shortfall = needed - state.tokens;
            Err(Duration::from_secs_f64(shortfall / self.refill_per_sec))
        }
    }

    /// Blocks (async) until `n` bytes worth of tokens are available, then deducts them.
    pub async fn acquire(&self, n: u64) {
        loop {
            match self.try_acquire(n) {
                Ok(()) => return,
                Err(wait) => tokio::time::sleep(wait).await,
            }
        }
    }
}
