use crate::limiter::Algorithm;
use std::time::Duration;
use tokio::time::Instant;

/// Tokens are tracked in millionths so that refill is continuous rather than stepped.
const SCALE: u128 = 1_000_000;

/// A bucket of up to `capacity` tokens that refills at `tokens_per_period / period`.
///
/// Refill is computed exactly from elapsed time; the fractional remainder of each refill is
/// carried forward so tokens never drift.
#[derive(Debug)]
pub(crate) struct TokenBucket {
    capacity: u128,
    tokens: u128,
    tokens_per_period: u128,
    period_nanos: u128,

    /// Refill numerator not yet converted into tokens, always less than `period_nanos`.
    carry: u128,
    refilled: Instant,
}

impl TokenBucket {
    pub(crate) fn new(
        capacity: u32,
        tokens_per_period: u32,
        period: Duration,
        now: Instant,
    ) -> Self {
        let capacity = u128::from(capacity) * SCALE;
        Self {
            capacity,
            tokens: capacity,
            tokens_per_period: u128::from(tokens_per_period),
            period_nanos: period.as_nanos().max(1),
            carry: 0,
            refilled: now,
        }
    }

    /// The time until the bucket holds at least one whole token.
    fn until_next_token(&self) -> Duration {
        if self.tokens >= SCALE {
            return Duration::ZERO;
        }
        let deficit = SCALE - self.tokens;
        let needed = (deficit * self.period_nanos).saturating_sub(self.carry);
        let rate = (self.tokens_per_period * SCALE).max(1);
        let nanos = needed.div_ceil(rate);
        Duration::from_nanos(u64::try_from(nanos).unwrap_or(u64::MAX))
    }
}

impl Algorithm for TokenBucket {
    const RELEASE_ON_DROP: bool = false;

    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.refilled).as_nanos();
        self.refilled = now;
        if self.tokens >= self.capacity {
            return;
        }

        let numerator = elapsed * self.tokens_per_period * SCALE + self.carry;
        self.tokens += numerator / self.period_nanos;
        self.carry = numerator % self.period_nanos;
        if self.tokens >= self.capacity {
            self.tokens = self.capacity;
            self.carry = 0;
        }
    }

    fn try_acquire(&mut self) -> bool {
        if self.tokens < SCALE {
            return false;
        }
        self.tokens -= SCALE;
        true
    }

    fn release(&mut self) {
        self.tokens = (self.tokens + SCALE).min(self.capacity);
    }

    fn next_replenish(&self) -> Option<Instant> {
        Some(self.refilled + self.until_next_token())
    }

    fn retry_after(&self, now: Instant) -> Option<Duration> {
        let ready = self.refilled + self.until_next_token();
        Some(ready.saturating_duration_since(now))
    }

    fn is_full(&self) -> bool {
        self.tokens >= self.capacity
    }
}
