use std::time::Duration;

/// Backoff for store calls that fail because the database is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts per call, including the first one. Never below 1.
    max_attempts: u32,
    /// The delay before the first retry.
    initial_interval: Duration,
    /// Multiplier applied to `initial_interval` for every past retry.
    backoff_coefficient: u32,
    /// Upper bound for a single delay.
    maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        initial_interval: Duration,
        backoff_coefficient: u32,
        maximum_interval: Option<Duration>,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            backoff_coefficient,
            maximum_interval,
        }
    }

    /// A policy that gives up after the first failure.
    pub fn never() -> Self {
        Self::new(1, Duration::ZERO, 1, None)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `attempt + 1`, or `None` when attempts are exhausted.
    /// `attempt` counts from 0 for the first (failed) call.
    pub fn delay_after(&self, attempt: u32) -> Option<Duration> {
        if attempt.saturating_add(1) >= self.max_attempts {
            return None;
        }

        let factor = self.backoff_coefficient.saturating_pow(attempt);
        let candidate = self.initial_interval.saturating_mul(factor);
        Some(match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate, max_interval),
            None => candidate,
        })
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Duration::from_millis(100),
            2,
            Some(Duration::from_secs(5)),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::RetryPolicy;

    #[test]
    fn default_policy_backs_off_exponentially_then_gives_up() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay_after(0), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_after(2), None);
    }

    #[test]
    fn delays_are_capped_by_maximum_interval() {
        let policy = RetryPolicy::new(
            10,
            Duration::from_secs(1),
            10,
            Some(Duration::from_secs(30)),
        );
        assert_eq!(policy.delay_after(1), Some(Duration::from_secs(10)));
        assert_eq!(policy.delay_after(2), Some(Duration::from_secs(30)));
        assert_eq!(policy.delay_after(8), Some(Duration::from_secs(30)));
    }

    #[test]
    fn zero_attempts_is_clamped_to_a_single_try() {
        let policy = RetryPolicy::new(0, Duration::from_millis(5), 2, None);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.delay_after(0), None);
        assert_eq!(RetryPolicy::never().delay_after(0), None);
    }
}
