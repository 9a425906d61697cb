//! Per-connection control-frame throttle.
//!
//! Lives inside a single connection task, so it is a plain sliding window
//! over a `VecDeque` with no shared store.

use std::collections::VecDeque;
use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug)]
pub struct ControlThrottle {
    limit: usize,
    window: Duration,
    hits: VecDeque<Instant>,
}

impl ControlThrottle {
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit as usize,
            window,
            hits: VecDeque::with_capacity(limit as usize),
        }
    }

    /// Record a control frame at `now`; `false` when over the limit.
    pub fn allow(&mut self, now: Instant) -> bool {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.window {
                self.hits.pop_front();
            } else {
                break;
            }
        }
        if self.hits.len() >= self.limit {
            return false;
        }
        self.hits.push_back(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_recovers() {
        let mut throttle = ControlThrottle::new(3, Duration::from_secs(10));
        let start = Instant::now();

        assert!(throttle.allow(start));
        assert!(throttle.allow(start + Duration::from_secs(1)));
        assert!(throttle.allow(start + Duration::from_secs(2)));
        assert!(!throttle.allow(start + Duration::from_secs(3)));

        // First hit leaves the window at t=10s.
        assert!(throttle.allow(start + Duration::from_secs(10)));
        assert!(!throttle.allow(start + Duration::from_secs(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn denied_frames_are_not_recorded() {
        let mut throttle = ControlThrottle::new(1, Duration::from_secs(5));
        let start = Instant::now();
        assert!(throttle.allow(start));
        for i in 1..5 {
            assert!(!throttle.allow(start + Duration::from_secs(i)));
        }
        assert!(throttle.allow(start + Duration::from_secs(5)));
    }
}
