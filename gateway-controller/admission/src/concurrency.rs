use crate::limiter::Algorithm;
use std::time::Duration;
use tokio::time::Instant;

/// A counting semaphore: permits are held for the life of a lease.
#[derive(Debug)]
pub(crate) struct Concurrency {
    max: u32,
    in_flight: u32,
}

impl Concurrency {
    pub(crate) fn new(max: u32) -> Self {
        Self { max, in_flight: 0 }
    }
}

impl Algorithm for Concurrency {
    const RELEASE_ON_DROP: bool = true;

    fn replenish(&mut self, _: Instant) {}

    fn try_acquire(&mut self) -> bool {
        if self.in_flight >= self.max {
            return false;
        }
        self.in_flight += 1;
        true
    }

    fn release(&mut self) {
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    fn next_replenish(&self) -> Option<Instant> {
        None
    }

    fn retry_after(&self, _: Instant) -> Option<Duration> {
        None
    }

    fn is_full(&self) -> bool {
        self.in_flight == 0
    }
}
