//! Per-backend request and token budgets over fixed 60 second windows.
//!
//! Each backend owns one [`RateLimitTracker`]. Windows roll over lazily whenever the tracker
//! is consulted, so nothing runs in the background and no call ever blocks on the budget.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Length of both the request and the token window.
pub const WINDOW: Duration = Duration::from_secs(60);

/// Time source for window bookkeeping.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to. Clones share the same time.
///
/// ```
/// use std::time::Duration;
/// use llm_relay::ratelimit::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let start = clock.now();
/// clock.advance(Duration::from_secs(61));
/// assert_eq!(clock.now() - start, Duration::from_secs(61));
/// ```
#[derive(Debug, Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + offset
    }
}

/// Shared handle to a clock implementation.
pub type DynClock = Arc<dyn Clock>;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u64,
    resets_at: Instant,
}

impl Window {
    fn starting_at(now: Instant) -> Self {
        Self {
            count: 0,
            resets_at: now + WINDOW,
        }
    }

    fn roll_over(&mut self, now: Instant) {
        if now >= self.resets_at {
            *self = Self::starting_at(now);
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.resets_at.saturating_duration_since(now)
    }
}

#[derive(Debug)]
struct Windows {
    requests: Window,
    tokens: Window,
}

/// Point-in-time view of a tracker, reported by `backends_status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub requests_used: u64,
    pub requests_per_minute: u64,
    pub tokens_used: u64,
    pub tokens_per_minute: u64,
    pub requests_reset_in_ms: u64,
    pub tokens_reset_in_ms: u64,
    pub admissible: bool,
}

/// Fixed-window request and token counters for one backend.
///
/// Admission is `requests < rpm && tokens < tpm`. The counters only grow through
/// [`RateLimitTracker::record_usage`], which the orchestrator calls once per dispatched attempt.
pub struct RateLimitTracker {
    requests_per_minute: u64,
    tokens_per_minute: u64,
    clock: DynClock,
    windows: Mutex<Windows>,
}

impl fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("requests_per_minute", &self.requests_per_minute)
            .field("tokens_per_minute", &self.tokens_per_minute)
            .finish_non_exhaustive()
    }
}

impl RateLimitTracker {
    pub fn new(requests_per_minute: u64, tokens_per_minute: u64, clock: DynClock) -> Self {
        let now = clock.now();
        Self {
            requests_per_minute,
            tokens_per_minute,
            clock,
            windows: Mutex::new(Windows {
                requests: Window::starting_at(now),
                tokens: Window::starting_at(now),
            }),
        }
    }

    /// Tracker on the system clock.
    pub fn with_system_clock(requests_per_minute: u64, tokens_per_minute: u64) -> Self {
        Self::new(requests_per_minute, tokens_per_minute, Arc::new(SystemClock))
    }

    fn lock_rolled(&self) -> (MutexGuard<'_, Windows>, Instant) {
        let now = self.clock.now();
        let mut windows = self.windows.lock().unwrap_or_else(PoisonError::into_inner);
        windows.requests.roll_over(now);
        windows.tokens.roll_over(now);
        (windows, now)
    }

    fn admits(&self, windows: &Windows) -> bool {
        windows.requests.count < self.requests_per_minute
            && windows.tokens.count < self.tokens_per_minute
    }

    /// Whether another request fits in the current windows.
    pub fn can_admit(&self) -> bool {
        let (windows, _) = self.lock_rolled();
        self.admits(&windows)
    }

    /// Counts one request and `tokens` tokens against the current windows.
    pub fn record_usage(&self, tokens: u64) {
        let (mut windows, _) = self.lock_rolled();
        windows.requests.count += 1;
        windows.tokens.count = windows.tokens.count.saturating_add(tokens);
    }

    /// Time until the exhausted window(s) reset, or `None` while admissible.
    pub fn retry_after(&self) -> Option<Duration> {
        let (windows, now) = self.lock_rolled();
        if self.admits(&windows) {
            return None;
        }
        let mut wait = Duration::ZERO;
        if windows.requests.count >= self.requests_per_minute {
            wait = wait.max(windows.requests.remaining(now));
        }
        if windows.tokens.count >= self.tokens_per_minute {
            wait = wait.max(windows.tokens.remaining(now));
        }
        Some(wait)
    }

    pub fn status(&self) -> RateLimitStatus {
        let (windows, now) = self.lock_rolled();
        RateLimitStatus {
            requests_used: windows.requests.count,
            requests_per_minute: self.requests_per_minute,
            tokens_used: windows.tokens.count,
            tokens_per_minute: self.tokens_per_minute,
            requests_reset_in_ms: windows.requests.remaining(now).as_millis() as u64,
            tokens_reset_in_ms: windows.tokens.remaining(now).as_millis() as u64,
            admissible: self.admits(&windows),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(rpm: u64, tpm: u64) -> (RateLimitTracker, ManualClock) {
        let clock = ManualClock::new();
        (RateLimitTracker::new(rpm, tpm, Arc::new(clock.clone())), clock)
    }

    #[test]
    fn blocks_at_rpm_and_recovers_after_window() {
        for rpm in 1..=5u64 {
            let (tracker, clock) = tracker(rpm, u64::MAX);
            for _ in 0..rpm {
                assert!(tracker.can_admit());
                tracker.record_usage(1);
            }
            assert!(!tracker.can_admit(), "rpm {rpm} should be exhausted");

            clock.advance(Duration::from_secs(59));
            assert!(!tracker.can_admit());
            clock.advance(Duration::from_secs(1));
            assert!(tracker.can_admit(), "rpm {rpm} should recover after reset");
        }
    }

    #[test]
    fn token_counter_sums_within_window_and_restarts_after_rollover() {
        let (tracker, clock) = tracker(100, 1_000_000);
        let usages = [17u64, 0, 250, 3, 1_024];
        for usage in usages {
            tracker.record_usage(usage);
        }
        assert_eq!(tracker.status().tokens_used, usages.iter().sum::<u64>());
        assert_eq!(tracker.status().requests_used, usages.len() as u64);

        clock.advance(WINDOW);
        tracker.record_usage(42);
        let status = tracker.status();
        assert_eq!(status.tokens_used, 42);
        assert_eq!(status.requests_used, 1);
    }

    #[test]
    fn token_budget_blocks_admission() {
        let (tracker, clock) = tracker(100, 500);
        tracker.record_usage(499);
        assert!(tracker.can_admit());
        tracker.record_usage(1);
        assert!(!tracker.can_admit());

        clock.advance(Duration::from_secs(15));
        assert_eq!(tracker.retry_after(), Some(Duration::from_secs(45)));
    }

    #[test]
    fn retry_after_is_none_while_admissible() {
        let (tracker, clock) = tracker(1, 1_000);
        assert_eq!(tracker.retry_after(), None);
        tracker.record_usage(10);
        clock.advance(Duration::from_secs(20));

        let status = tracker.status();
        assert!(!status.admissible);
        assert_eq!(status.requests_reset_in_ms, 40_000);
        assert_eq!(tracker.retry_after(), Some(Duration::from_secs(40)));
    }

    #[test]
    fn concurrent_recording_is_not_lost() {
        let (tracker, _) = tracker(10_000, u64::MAX);
        let tracker = Arc::new(tracker);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let tracker = Arc::clone(&tracker);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.record_usage(2);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("thread");
        }
        let status = tracker.status();
        assert_eq!(status.requests_used, 800);
        assert_eq!(status.tokens_used, 1_600);
    }
}
