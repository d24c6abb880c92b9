//! Reconnect pacing.

use std::time::Duration;

/// How long to wait between connection attempts, and how many to make.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base: Duration,
    /// Ceiling for the delay; equal to `base` for a fixed policy.
    pub max: Duration,
    /// Maximum number of failed attempts before giving up; `None` retries forever.
    pub max_attempts: Option<u32>,
}

impl RetryPolicy {
    /// Same delay every time, forever.
    pub const fn fixed(delay: Duration) -> Self {
        Self {
            base: delay,
            max: delay,
            max_attempts: None,
        }
    }

    /// Doubling delay from `base` up to `max`, forever.
    pub const fn exponential(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            max_attempts: None,
        }
    }

    pub const fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(*self)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}

/// Running state of a [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    current: Duration,
    failures: u32,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            current: policy.base,
            failures: 0,
        }
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures = self.failures.saturating_add(1);
        if let Some(cap) = self.policy.max_attempts
            && self.failures >= cap
        {
            return None;
        }
        let delay = self.current;
        let next = self.current.checked_mul(2).unwrap_or(self.policy.max);
        self.current = next.min(self.policy.max);
        Some(delay)
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn reset(&mut self) {
        self.current = self.policy.base;
        self.failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_never_grows_or_stops() {
        let mut b = RetryPolicy::default().backoff();
        for _ in 0..100 {
            assert_eq!(b.next_delay(), Some(Duration::from_secs(5)));
        }
        assert_eq!(b.failures(), 100);
    }

    #[test]
    fn backoff_exponentially_grows() {
        let mut b = RetryPolicy::exponential(Duration::from_millis(10), Duration::from_millis(40))
            .backoff();
        assert_eq!(b.next_delay(), Some(Duration::from_millis(10)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(20)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(40)));
        assert_eq!(b.next_delay(), Some(Duration::from_millis(40)));
    }

    #[test]
    fn cap_stops_after_max_attempts() {
        let mut b = RetryPolicy::fixed(Duration::from_millis(1))
            .with_max_attempts(3)
            .backoff();
        assert!(b.next_delay().is_some());
        assert!(b.next_delay().is_some());
        assert_eq!(b.next_delay(), None);
    }

    #[test]
    fn reset_restarts_sequence() {
        let mut b = RetryPolicy::exponential(Duration::from_millis(10), Duration::from_secs(1))
            .with_max_attempts(2)
            .backoff();
        b.next_delay();
        b.reset();
        assert_eq!(b.failures(), 0);
        assert_eq!(b.next_delay(), Some(Duration::from_millis(10)));
    }
}
