use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which reconnect schedule applies to a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectContext {
    /// No `open` has been observed yet; the service routinely restarts the
    /// stream while a challenge is being negotiated.
    Pairing,
    /// The session was fully connected at least once.
    SteadyState,
}

pub const DEFAULT_PAIRING_DELAY: Duration = Duration::from_secs(2);
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pairing_delay: Duration,
    base_delay: Duration,
    factor: f64,
    max_delay: Duration,
    max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            pairing_delay: DEFAULT_PAIRING_DELAY,
            base_delay: DEFAULT_BASE_DELAY,
            factor: DEFAULT_BACKOFF_FACTOR,
            max_delay: DEFAULT_MAX_DELAY,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    /// Builds a policy. A factor below 1.0 (or NaN) is clamped to 1.0 and the
    /// base delay is clamped to the cap so the schedule never shrinks.
    pub fn new(
        pairing_delay: Duration,
        base_delay: Duration,
        factor: f64,
        max_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        let factor = if factor.is_nan() || factor < 1.0 {
            1.0
        } else {
            factor
        };
        Self {
            pairing_delay: pairing_delay.min(max_delay),
            base_delay: base_delay.min(max_delay),
            factor,
            max_delay,
            max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn pairing_delay(&self) -> Duration {
        self.pairing_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the reconnect that follows `attempt` prior failures.
    pub fn next_delay(&self, context: ReconnectContext, attempt: u32) -> Duration {
        match context {
            ReconnectContext::Pairing => self.pairing_delay,
            ReconnectContext::SteadyState => {
                let exponent = attempt.min(i32::MAX as u32) as i32;
                let base = self.base_delay.as_nanos() as f64;
                let cap = self.max_delay.as_nanos() as f64;
                let nanos = (base * self.factor.powi(exponent)).min(cap);
                if nanos.is_finite() {
                    Duration::from_nanos(nanos as u64).min(self.max_delay)
                } else {
                    self.max_delay
                }
            }
        }
    }

    pub fn should_give_up(&self, attempt_count: u32) -> bool {
        attempt_count > self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn steady_state_starts_at_base() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next_delay(ReconnectContext::SteadyState, 0),
            DEFAULT_BASE_DELAY
        );
    }

    #[test]
    fn pairing_context_is_fast_and_flat() {
        let policy = ReconnectPolicy::default();
        for attempt in 0..20 {
            let delay = policy.next_delay(ReconnectContext::Pairing, attempt);
            assert_eq!(delay, DEFAULT_PAIRING_DELAY);
            assert!(delay < Duration::from_secs(5));
        }
    }

    #[test]
    fn scales_exponentially() {
        let policy = ReconnectPolicy::new(
            Duration::from_millis(500),
            Duration::from_millis(100),
            2.0,
            Duration::from_secs(10),
            5,
        );
        assert_eq!(
            policy.next_delay(ReconnectContext::SteadyState, 3),
            Duration::from_millis(800)
        );
    }

    #[test]
    fn monotonic_and_capped() {
        let policy = ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_millis(750),
            1.7,
            Duration::from_secs(45),
            10,
        );
        let mut previous = Duration::ZERO;
        for attempt in 0..200 {
            let delay = policy.next_delay(ReconnectContext::SteadyState, attempt);
            assert!(delay >= previous, "delay shrank at attempt {attempt}");
            assert!(delay <= policy.max_delay(), "cap exceeded at {attempt}");
            previous = delay;
        }
        assert_eq!(previous, Duration::from_secs(45));
    }

    #[test]
    fn huge_attempt_counts_stay_at_cap() {
        let policy = ReconnectPolicy::default();
        assert_eq!(
            policy.next_delay(ReconnectContext::SteadyState, u32::MAX),
            DEFAULT_MAX_DELAY
        );
    }

    #[test]
    fn degenerate_factor_is_clamped() {
        let policy = ReconnectPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(3),
            0.25,
            Duration::from_secs(30),
            3,
        );
        assert_eq!(
            policy.next_delay(ReconnectContext::SteadyState, 4),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn gives_up_past_ceiling() {
        let policy = ReconnectPolicy::default();
        assert!(!policy.should_give_up(0));
        assert!(!policy.should_give_up(DEFAULT_MAX_ATTEMPTS));
        assert!(policy.should_give_up(DEFAULT_MAX_ATTEMPTS + 1));
    }
}
