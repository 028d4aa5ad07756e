//! A reusable countdown shared by the session expiry, the poll cadence and the
//! dump schedule.
//!
//! Callers pass `now` explicitly so the control loop samples the clock once per
//! tick and tests can drive time by hand.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    /// A deadline `interval` after `now`.
    pub fn armed(now: Instant, interval: Duration) -> Self {
        Self { at: now + interval }
    }

    /// A deadline that has already expired at `now`.
    pub fn expired_at(now: Instant) -> Self {
        Self { at: now }
    }

    pub fn expired(&self, now: Instant) -> bool {
        now >= self.at
    }

    pub fn rearm(&mut self, now: Instant, interval: Duration) {
        self.at = now + interval;
    }

    /// Forces the deadline to be expired from `now` on.
    pub fn expire(&mut self, now: Instant) {
        if self.at > now {
            self.at = now;
        }
    }

    pub fn remaining(&self, now: Instant) -> Duration {
        self.at.saturating_duration_since(now)
    }

    pub fn at(&self) -> Instant {
        self.at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expires_at_interval() {
        let start = Instant::now();
        let deadline = Deadline::armed(start, Duration::from_millis(500));
        assert!(!deadline.expired(start));
        assert!(!deadline.expired(start + Duration::from_millis(499)));
        assert!(deadline.expired(start + Duration::from_millis(500)));
        assert_eq!(
            deadline.remaining(start + Duration::from_millis(200)),
            Duration::from_millis(300)
        );
        assert_eq!(deadline.remaining(start + Duration::from_secs(1)), Duration::ZERO);
    }

    #[test]
    fn rearm_and_expire() {
        let start = Instant::now();
        let mut deadline = Deadline::expired_at(start);
        assert!(deadline.expired(start));

        deadline.rearm(start + Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(deadline.at(), start + Duration::from_secs(11));
        assert!(!deadline.expired(start + Duration::from_secs(10)));

        deadline.expire(start + Duration::from_secs(2));
        assert!(deadline.expired(start + Duration::from_secs(2)));
    }
}
