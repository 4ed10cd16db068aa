//! Bounded exponential backoff for Transient failures.
//!
//! Grounded on `open-agent-sdk-rust::retry::RetryConfig`/`calculate_delay`
//! (builder-style config, jittered exponential backoff); the defaults are
//! pinned to this crate's own budget (base 200ms, factor 2, cap 5s, max 3
//! attempts) rather than the sibling's general-purpose defaults.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_delay_ms = self.initial_delay.as_millis() as f64;
        let exponential_delay = base_delay_ms * self.backoff_multiplier.powi(attempt as i32);
        let capped_delay = exponential_delay.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = rand::random::<f64>() * jitter_range;
        let final_delay = capped_delay + jitter - (jitter_range / 2.0);

        Duration::from_millis(final_delay.max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_with_attempt_and_respects_cap() {
        let policy = RetryPolicy::default();
        let d0 = policy.calculate_delay(0);
        let d5 = policy.calculate_delay(5);
        assert!(d0 <= Duration::from_millis(250));
        assert!(d5 <= policy.max_delay + Duration::from_millis(1));
    }
}
