//! Token bucket state for a single key.

use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use tracing::{debug, trace};

use super::policy::Policy;
use crate::error::{GatekeeperError, Result};

/// Lock-free consume attempts before a consumer falls back to the bucket lock.
pub const MAX_CAS_ATTEMPTS: usize = 32;

/// A token bucket holding the budget of one key.
///
/// Consumption is a compare-and-swap on `tokens` and never blocks on the fast
/// path. Refill touches both `tokens` and the refill timestamp, so it runs
/// under `last_refill_ms`. Its token update is still a CAS, so a consumer
/// racing a refill is never overwritten.
pub struct TokenBucket {
    /// Maximum number of tokens
    capacity: u32,
    /// Tokens added per whole elapsed second
    refill_rate: u32,
    /// Tokens currently available, always within `0..=capacity`
    tokens: AtomicU32,
    /// Epoch millis of the last refill that added tokens
    last_refill_ms: Mutex<u64>,
}

impl TokenBucket {
    /// Create a full bucket.
    pub fn new(capacity: u32, refill_rate: u32, now_ms: u64) -> Result<Self> {
        if capacity == 0 || refill_rate == 0 {
            return Err(GatekeeperError::Config(format!(
                "capacity ({}) and refill_rate ({}) must be positive",
                capacity, refill_rate
            )));
        }

        Ok(Self::full(capacity, refill_rate, now_ms))
    }

    /// Create a full bucket sized by an already validated policy.
    pub fn from_policy(policy: &Policy, now_ms: u64) -> Self {
        Self::full(policy.capacity(), policy.refill_rate(), now_ms)
    }

    fn full(capacity: u32, refill_rate: u32, now_ms: u64) -> Self {
        debug!(capacity, refill_rate, "Creating token bucket");
        Self {
            capacity,
            refill_rate,
            tokens: AtomicU32::new(capacity),
            last_refill_ms: Mutex::new(now_ms),
        }
    }

    /// Add the tokens earned since the last refill.
    ///
    /// Only whole seconds count. The timestamp moves to `now_ms` only when
    /// tokens were actually added. Otherwise a full bucket would keep
    /// resetting its clock and lose the time it accrued while being drained.
    /// Returns whether any tokens were added.
    pub fn refill(&self, now_ms: u64) -> bool {
        let mut last_refill = self.last_refill_ms.lock();

        let elapsed_secs = now_ms.saturating_sub(*last_refill) / 1000;
        if elapsed_secs < 1 {
            return false;
        }

        let to_add = elapsed_secs
            .saturating_mul(u64::from(self.refill_rate))
            .min(u64::from(self.capacity)) as u32;
        let capacity = self.capacity;

        let updated = self
            .tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let next = current.saturating_add(to_add).min(capacity);
                (next > current).then_some(next)
            });

        match updated {
            Ok(previous) => {
                *last_refill = now_ms;
                trace!(
                    previous,
                    added = to_add,
                    capacity,
                    "Refilled token bucket"
                );
                true
            }
            Err(_) => false,
        }
    }

    /// Refill, then take `cost` tokens if that many are available.
    ///
    /// Returns `Ok(remaining)` when admitted and `Err(available)` when there
    /// were not enough tokens. A denial consumes nothing.
    pub fn consume(&self, cost: u32, now_ms: u64) -> std::result::Result<u32, u32> {
        debug_assert!(cost > 0, "cost must be positive");

        self.refill(now_ms);

        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.tokens.load(Ordering::Acquire);
            if current < cost {
                return Err(current);
            }

            if self
                .tokens
                .compare_exchange(current, current - cost, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(current - cost);
            }
        }

        trace!(cost, "Token bucket CAS contended, taking lock");
        self.consume_locked(cost)
    }

    /// Take `cost` tokens while holding the refill lock.
    ///
    /// Used once the lock-free attempts are exhausted, so heavily contended
    /// consumers queue instead of spinning.
    fn consume_locked(&self, cost: u32) -> std::result::Result<u32, u32> {
        let _guard = self.last_refill_ms.lock();
        self.tokens
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(cost)
            })
            .map(|previous| previous - cost)
    }

    /// Refill, then try to take `cost` tokens.
    pub fn try_consume(&self, cost: u32, now_ms: u64) -> bool {
        self.consume(cost, now_ms).is_ok()
    }

    /// Whole seconds until `cost` tokens should be available again.
    ///
    /// Zero when the bucket is already full.
    pub fn estimate_retry_after_secs(&self, cost: u32) -> u64 {
        let tokens = self.tokens();
        if tokens >= self.capacity {
            return 0;
        }

        let deficit = u64::from(cost.saturating_sub(tokens).max(1));
        deficit.div_ceil(u64::from(self.refill_rate))
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> u32 {
        self.tokens.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn refill_rate(&self) -> u32 {
        self.refill_rate
    }

    /// Epoch millis of the last refill that added tokens (or of creation).
    pub fn last_refill_millis(&self) -> u64 {
        *self.last_refill_ms.lock()
    }
}

impl std::fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.tokens())
            .finish()
    }
}
