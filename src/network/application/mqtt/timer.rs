//! Countdown timers over a wrapping millisecond uptime clock.
//!
//! Devices commonly expose uptime as a 32-bit millisecond counter that wraps
//! after roughly 49.7 days. [`Timer`] only ever looks at the difference between
//! two readings, computed with wrapping arithmetic, so a countdown that spans
//! the wrap point behaves like any other.

use std::time::Instant;

/// Source of monotonic uptime in milliseconds.
pub trait Clock: Send + Sync {
    /// Milliseconds since an arbitrary origin. Allowed to wrap.
    fn uptime_ms(&self) -> u32;
}

/// [`Clock`] backed by [`std::time::Instant`].
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    /// Clock whose origin is now.
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn uptime_ms(&self) -> u32 {
        // Truncation is the wrap.
        self.origin.elapsed().as_millis() as u32
    }
}

/// A countdown started at one clock reading and lasting `period_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Timer {
    start: u32,
    period: u32,
}

impl Timer {
    /// Start a countdown of `period_ms` at `now`.
    pub fn new(now: u32, period_ms: u32) -> Self {
        Self {
            start: now,
            period: period_ms,
        }
    }

    /// Restart the countdown at `now` with a new period.
    pub fn countdown(&mut self, now: u32, period_ms: u32) {
        self.start = now;
        self.period = period_ms;
    }

    /// Restart the countdown at `now` keeping the period.
    pub fn restart(&mut self, now: u32) {
        self.start = now;
    }

    /// Milliseconds elapsed since the countdown started.
    pub fn elapsed(&self, now: u32) -> u32 {
        now.wrapping_sub(self.start)
    }

    /// Whether the period has fully elapsed at `now`.
    pub fn is_expired(&self, now: u32) -> bool {
        self.elapsed(now) >= self.period
    }

    /// Milliseconds left until expiry, zero once expired.
    pub fn remaining(&self, now: u32) -> u32 {
        self.period.saturating_sub(self.elapsed(now))
    }

    /// Countdown length.
    pub fn period(&self) -> u32 {
        self.period
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_after_period() {
        let timer = Timer::new(1_000, 500);
        assert!(!timer.is_expired(1_000));
        assert!(!timer.is_expired(1_499));
        assert_eq!(timer.remaining(1_200), 300);
        assert!(timer.is_expired(1_500));
        assert_eq!(timer.remaining(2_000), 0);
    }

    #[test]
    fn survives_clock_wrap() {
        let start = u32::MAX - 100;
        let timer = Timer::new(start, 300);
        assert!(!timer.is_expired(u32::MAX));
        assert!(!timer.is_expired(50));
        assert_eq!(timer.elapsed(50), 151);
        assert_eq!(timer.remaining(50), 149);
        assert!(timer.is_expired(199));
    }

    #[test]
    fn restart_keeps_period() {
        let mut timer = Timer::new(0, 100);
        assert!(timer.is_expired(100));
        timer.restart(100);
        assert!(!timer.is_expired(150));
        timer.countdown(150, 10);
        assert!(timer.is_expired(160));
        assert_eq!(timer.period(), 10);
    }

    #[test]
    fn zero_period_is_immediately_expired() {
        assert!(Timer::new(42, 0).is_expired(42));
    }
}
