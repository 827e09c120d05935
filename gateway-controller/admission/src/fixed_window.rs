use crate::limiter::Algorithm;
use std::time::Duration;
use tokio::time::Instant;

/// Grants up to `limit` permits per window; every permit returns at the window boundary.
///
/// Windows are aligned to the moment the partition was created.
#[derive(Debug)]
pub(crate) struct FixedWindow {
    window: Duration,
    limit: u32,
    available: u32,
    started: Instant,
}

impl FixedWindow {
    pub(crate) fn new(window: Duration, limit: u32, now: Instant) -> Self {
        Self {
            window,
            limit,
            available: limit,
            started: now,
        }
    }

    fn ends(&self) -> Instant {
        self.started + self.window
    }
}

impl Algorithm for FixedWindow {
    const RELEASE_ON_DROP: bool = false;

    fn replenish(&mut self, now: Instant) {
        if now < self.ends() {
            return;
        }
        let elapsed = now.saturating_duration_since(self.started).as_nanos();
        let into_window = elapsed % self.window.as_nanos();
        self.started = now - Duration::from_nanos(into_window as u64);
        self.available = self.limit;
    }

    fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        true
    }

    fn release(&mut self) {
        self.available = (self.available + 1).min(self.limit);
    }

    fn next_replenish(&self) -> Option<Instant> {
        Some(self.ends())
    }

    fn retry_after(&self, now: Instant) -> Option<Duration> {
        Some(self.ends().saturating_duration_since(now))
    }

    fn is_full(&self) -> bool {
        self.available == self.limit
    }
}
