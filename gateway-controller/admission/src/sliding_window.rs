use crate::limiter::Algorithm;
use std::{collections::VecDeque, time::Duration};
use tokio::time::Instant;

/// Grants up to `limit` permits in any window, tracked as a ring of segments.
///
/// Permits acquired during a segment are returned once that segment slides out of the window,
/// so throttling eases gradually rather than all at once at a window edge.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
    segment: Duration,
    limit: u32,
    available: u32,

    /// Permits acquired in each segment of the window, oldest first. The last entry is the
    /// current segment.
    acquired: VecDeque<u32>,

    /// When the current segment began.
    current: Instant,
}

impl SlidingWindow {
    pub(crate) fn new(window: Duration, segments: u32, limit: u32, now: Instant) -> Self {
        let segments = segments.max(1);
        Self {
            segment: window / segments,
            limit,
            available: limit,
            acquired: std::iter::repeat(0).take(segments as usize).collect(),
            current: now,
        }
    }

    fn advance(&mut self) {
        let expired = self.acquired.pop_front().unwrap_or(0);
        self.acquired.push_back(0);
        self.available = (self.available + expired).min(self.limit);
        self.current += self.segment;
    }
}

impl Algorithm for SlidingWindow {
    const RELEASE_ON_DROP: bool = false;

    fn replenish(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.current).as_nanos();
        let steps = elapsed / self.segment.as_nanos();
        if steps >= self.acquired.len() as u128 {
            // The whole window has slid past.
            self.acquired.iter_mut().for_each(|n| *n = 0);
            self.available = self.limit;
            let into_segment = elapsed % self.segment.as_nanos();
            self.current = now - Duration::from_nanos(into_segment as u64);
            return;
        }
        for _ in 0..steps {
            self.advance();
        }
    }

    fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        if let Some(current) = self.acquired.back_mut() {
            *current += 1;
        }
        true
    }

    fn release(&mut self) {
        if let Some(current) = self.acquired.back_mut() {
            if *current > 0 {
                *current -= 1;
                self.available += 1;
            }
        }
    }

    fn next_replenish(&self) -> Option<Instant> {
        Some(self.current + self.segment)
    }

    /// The time until the oldest segment still holding permits slides out of the window.
    fn retry_after(&self, now: Instant) -> Option<Duration> {
        let oldest = self.acquired.iter().position(|n| *n > 0)?;
        let expires = self.current + self.segment * (oldest as u32 + 1);
        Some(expires.saturating_duration_since(now))
    }

    fn is_full(&self) -> bool {
        self.available == self.limit
    }
}
