//! Token bucket rate limiting for background I/O
//!
//! Compaction charges every byte it writes against a [`TokenBucket`] that
//! refills at the configured rate. [`CompactionThrottle`] also backs off while
//! the shard's foreground durability queue is deep, so background merges never
//! compete with acknowledgments for the disk.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A token bucket measured in bytes.
///
/// Refills at `rate` tokens per second up to `capacity`. Requests larger than
/// the capacity are granted once the bucket is full and leave it in debt, so
/// large writes are delayed rather than refused.
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    capacity: f64,
    rate: f64,
}

impl TokenBucket {
    /// Bucket refilling at `rate` bytes per second, holding at most `burst`.
    pub fn new(rate: u64, burst: u64) -> Self {
        let capacity = burst.max(1) as f64;
        TokenBucket {
            tokens: capacity,
            last_refill: Instant::now(),
            capacity,
            rate: rate.max(1) as f64,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens if available now.
    pub fn try_acquire(&mut self, n: u64) -> bool {
        self.refill();
        let need = (n as f64).min(self.capacity);
        if self.tokens >= need {
            self.tokens -= n as f64;
            true
        } else {
            false
        }
    }

    /// How long until `n` tokens could be taken.
    pub fn time_until(&mut self, n: u64) -> Duration {
        self.refill();
        let need = (n as f64).min(self.capacity);
        if self.tokens >= need {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((need - self.tokens) / self.rate)
        }
    }

    /// Take `n` tokens, sleeping until they are available. Returns time waited.
    pub fn acquire(&mut self, n: u64) -> Duration {
        let start = Instant::now();
        loop {
            if self.try_acquire(n) {
                return start.elapsed();
            }
            std::thread::sleep(self.time_until(n));
        }
    }

    /// Tokens currently available (negative while in debt).
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}

/// Outstanding foreground durability operations, shared with the shard loop.
pub type ForegroundLoad = Arc<AtomicUsize>;

const YIELD_SLEEP: Duration = Duration::from_millis(1);
const MAX_YIELDS_PER_CHARGE: u32 = 50;

/// Rate limiter used by compaction.
#[derive(Debug)]
pub struct CompactionThrottle {
    bucket: TokenBucket,
    foreground: ForegroundLoad,
    yield_threshold: usize,
    waited: Duration,
    yields: u64,
}

impl CompactionThrottle {
    /// Throttle at `rate` bytes/sec with `burst` capacity, yielding while
    /// `foreground` exceeds `yield_threshold`.
    pub fn new(rate: u64, burst: u64, foreground: ForegroundLoad, yield_threshold: usize) -> Self {
        CompactionThrottle {
            bucket: TokenBucket::new(rate, burst),
            foreground,
            yield_threshold,
            waited: Duration::ZERO,
            yields: 0,
        }
    }

    /// Unthrottled, for tests and offline tools.
    pub fn unlimited() -> Self {
        Self::new(u64::MAX / 2, u64::MAX / 2, Arc::new(AtomicUsize::new(0)), usize::MAX)
    }

    /// Account for `bytes` of background I/O, blocking as needed.
    pub fn charge(&mut self, bytes: u64) {
        let mut yields = 0;
        while self.foreground.load(Ordering::Relaxed) > self.yield_threshold
            && yields < MAX_YIELDS_PER_CHARGE
        {
            std::thread::sleep(YIELD_SLEEP);
            self.waited += YIELD_SLEEP;
            yields += 1;
        }
        self.yields += yields as u64;
        self.waited += self.bucket.acquire(bytes);
    }

    /// Total time spent waiting.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Times compaction backed off for foreground load.
    pub fn yields(&self) -> u64 {
        self.yields
    }
}
