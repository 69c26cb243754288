//! Lock-free token-bucket rate limiter.
//!
//! Two parameters drive the bucket: *burst size*, the maximum number of
//! requests admitted as a burst, and *average rate*, the expected number of
//! requests per time unit. Both are supplied per call rather than at
//! construction so a long-lived bucket tracks a dynamically reconfigured
//! limit without being rebuilt.
//!
//! The bucket is two atoms mutated only through compare-and-swap loops:
//! the consumed-token count and the last refill timestamp. The refill
//! window is claimed exactly once per elapsed quantum; concurrent callers
//! across the same quantum do not each add tokens.

use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::util::now_unix_ms;

/// Time unit over which the average rate is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateUnit {
    /// `average_rate` tokens are replenished per second.
    Seconds,
    /// `average_rate` tokens are replenished per minute.
    Minutes,
}

impl RateUnit {
    fn ms_per_unit(self) -> u64 {
        match self {
            RateUnit::Seconds => 1_000,
            RateUnit::Minutes => 60_000,
        }
    }
}

/// Lock-free token bucket.
///
/// Thread-safe; share one instance per protected resource. Within a single
/// thread, a completed `acquire` is observed by the next call. Across
/// threads only eventual consistency is guaranteed: a burst of contention
/// can leave the consumed count lagging by up to one refill quantum.
#[derive(Debug)]
pub struct TokenBucket {
    rate_to_ms_conversion: u64,
    consumed_tokens: AtomicU32,
    last_refill_ms: AtomicU64,
}

impl TokenBucket {
    /// Create a bucket whose average rate is expressed in the given unit.
    pub fn new(unit: RateUnit) -> Self {
        Self {
            rate_to_ms_conversion: unit.ms_per_unit(),
            consumed_tokens: AtomicU32::new(0),
            last_refill_ms: AtomicU64::new(0),
        }
    }

    /// Try to take one token, using the wall clock.
    pub fn acquire_now(&self, burst_size: i64, average_rate: i64) -> bool {
        self.acquire(burst_size, average_rate, now_unix_ms())
    }

    /// Try to take one token at time `now_ms`.
    ///
    /// A non-positive `burst_size` or `average_rate` admits the call
    /// unconditionally: an unconfigured limiter lets all traffic through
    /// rather than rejecting it.
    pub fn acquire(&self, burst_size: i64, average_rate: i64, now_ms: u64) -> bool {
        if burst_size <= 0 || average_rate <= 0 {
            return true;
        }
        let burst = burst_size as u32;
        self.refill(burst, average_rate as u64, now_ms);
        self.consume(burst)
    }

    /// Replenish tokens for the quantum elapsed since the last refill.
    ///
    /// Only the thread that wins the compare-and-swap on the refill
    /// timestamp performs the replenishment; losers proceed to consume
    /// against whatever state they observe. The new refill time is derived
    /// from the token count rather than `now_ms`, so partial quanta carry
    /// over instead of being forfeited.
    fn refill(&self, burst_size: u32, average_rate: u64, now_ms: u64) {
        let refill_time = self.last_refill_ms.load(Ordering::Relaxed);
        let time_delta = now_ms.saturating_sub(refill_time);
        let new_tokens = time_delta * average_rate / self.rate_to_ms_conversion;
        if new_tokens == 0 {
            return;
        }
        let new_refill_time = if refill_time == 0 {
            now_ms
        } else {
            refill_time + new_tokens * self.rate_to_ms_conversion / average_rate
        };
        if self
            .last_refill_ms
            .compare_exchange(refill_time, new_refill_time, Ordering::Relaxed, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        loop {
            let current_level = self.consumed_tokens.load(Ordering::Relaxed);
            // A burst-size reduction between calls may have left the level
            // above the new ceiling.
            let adjusted_level = current_level.min(burst_size);
            let new_level = adjusted_level.saturating_sub(new_tokens.min(u64::from(u32::MAX)) as u32);
            if self
                .consumed_tokens
                .compare_exchange(current_level, new_level, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    fn consume(&self, burst_size: u32) -> bool {
        loop {
            let current_level = self.consumed_tokens.load(Ordering::Relaxed);
            if current_level >= burst_size {
                return false;
            }
            if self
                .consumed_tokens
                .compare_exchange(
                    current_level,
                    current_level + 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Zero both atoms, returning the bucket to its freshly built state.
    pub fn reset(&self) {
        self.consumed_tokens.store(0, Ordering::Relaxed);
        self.last_refill_ms.store(0, Ordering::Relaxed);
    }
}
