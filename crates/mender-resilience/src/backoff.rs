//! Backoff policies shared by stage retries and service-call retries.

use std::time::Duration;

/// Backoff policy controlling the delay between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffPolicy {
    /// Fixed delay between retries.
    Fixed(Duration),
    /// Delay grows with the attempt number: step * (attempt + 1).
    Linear(Duration),
    /// base * factor^attempt, capped at max.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
    },
    /// No delay between retries.
    None,
}

impl BackoffPolicy {
    /// Compute the delay for a given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        match self {
            BackoffPolicy::Fixed(d) => *d,
            BackoffPolicy::Linear(step) => step.saturating_mul(attempt as u32 + 1),
            BackoffPolicy::Exponential { base, factor, max } => {
                let scaled = base.as_millis() as f64 * factor.powi(attempt as i32);
                if !scaled.is_finite() || scaled >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(scaled as u64)
                }
            }
            BackoffPolicy::None => Duration::ZERO,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffPolicy::Exponential {
            base: Duration::from_millis(1000),
            factor: 2.0,
            max: Duration::from_secs(30),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_constant_delay() {
        let policy = BackoffPolicy::Fixed(Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_millis(200));
    }

    #[test]
    fn linear_backoff_scales_with_attempt() {
        let policy = BackoffPolicy::Linear(Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(500));
    }

    #[test]
    fn exponential_backoff_grows_and_caps() {
        let policy = BackoffPolicy::Exponential {
            base: Duration::from_millis(100),
            factor: 3.0,
            max: Duration::from_millis(1000),
        };
        // attempt 0: 100
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        // attempt 1: 300
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(300));
        // attempt 2: 900
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(900));
        // attempt 3: 2700, capped
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_millis(1000));
    }

    #[test]
    fn none_backoff_zero_delay() {
        assert_eq!(BackoffPolicy::None.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(BackoffPolicy::None.delay_for_attempt(99), Duration::ZERO);
    }

    #[test]
    fn default_backoff_is_exponential() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(20), Duration::from_secs(30));
    }
}
