//! Sliding-window rate budget shared by every upstream call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::BrokerError;

/// Bounded request budget over a rolling window.
///
/// Never lets the window exceed capacity: callers block until a slot frees
/// or their deadline passes, then fail with a rate-limit error instead of
/// issuing the request.
#[derive(Debug)]
pub struct RateBudget {
    capacity: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateBudget {
    pub fn new(capacity: usize, window: Duration) -> Self {
        Self {
            capacity,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// One-minute window with the given per-minute capacity.
    pub fn per_minute(capacity: usize) -> Self {
        Self::new(capacity, Duration::from_secs(60))
    }

    /// Number of requests currently inside the window.
    pub fn in_window(&self) -> usize {
        let mut timestamps = self.timestamps.lock().expect("budget lock poisoned");
        Self::prune(&mut timestamps, Instant::now(), self.window);
        timestamps.len()
    }

    fn prune(timestamps: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = timestamps.front() {
            if now.duration_since(*front) >= window {
                timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    /// Try to take a slot without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut timestamps = self.timestamps.lock().expect("budget lock poisoned");
        let now = Instant::now();
        Self::prune(&mut timestamps, now, self.window);
        if timestamps.len() < self.capacity {
            timestamps.push_back(now);
            true
        } else {
            false
        }
    }

    /// Take a slot, waiting until one frees or `max_wait` elapses.
    pub async fn acquire(&self, max_wait: Duration) -> Result<(), BrokerError> {
        let deadline = Instant::now() + max_wait;

        loop {
            // Lock only for the check-and-update, never across a wait.
            let next_free = {
                let mut timestamps = self.timestamps.lock().expect("budget lock poisoned");
                let now = Instant::now();
                Self::prune(&mut timestamps, now, self.window);
                if timestamps.len() < self.capacity {
                    timestamps.push_back(now);
                    return Ok(());
                }
                *timestamps.front().expect("window is full") + self.window
            };

            if next_free > deadline {
                return Err(BrokerError::RateLimited(format!(
                    "rate budget exhausted; next slot in {:?}",
                    next_free.saturating_duration_since(Instant::now())
                )));
            }

            // Slots only free as the window slides, so sleeping until the
            // oldest timestamp ages out is the earliest possible wake.
            tokio::time::sleep_until(next_free.into()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_never_exceeds_capacity() {
        let budget = RateBudget::new(3, Duration::from_secs(60));
        for _ in 0..3 {
            assert!(budget.try_acquire());
        }
        assert!(!budget.try_acquire());
        assert_eq!(budget.in_window(), 3);
    }

    #[tokio::test]
    async fn acquire_fails_after_deadline() {
        let budget = RateBudget::new(1, Duration::from_secs(60));
        assert!(budget.try_acquire());

        // The next slot frees in ~60s; a 10ms deadline cannot be met.
        let result = budget.acquire(Duration::from_millis(10)).await;
        assert!(matches!(result, Err(BrokerError::RateLimited(_))));
        // The failed acquire must not have consumed a slot.
        assert_eq!(budget.in_window(), 1);
    }

    #[tokio::test]
    async fn slots_free_as_window_slides() {
        let budget = RateBudget::new(2, Duration::from_millis(50));
        assert!(budget.try_acquire());
        assert!(budget.try_acquire());
        assert!(!budget.try_acquire());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(budget.try_acquire());
    }

    #[tokio::test]
    async fn acquire_waits_for_slot() {
        let budget = RateBudget::new(1, Duration::from_millis(50));
        assert!(budget.try_acquire());

        // A generous deadline lets the acquire outlive the window.
        budget.acquire(Duration::from_secs(5)).await.unwrap();
        assert_eq!(budget.in_window(), 1);
    }
}
