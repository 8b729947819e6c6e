//! Retry policy for model-provider calls.

use std::time::Duration;

use rand::Rng;

/// Status code the provider uses to signal it is overloaded.
pub const STATUS_OVERLOADED: u16 = 529;

#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter_min: f64,
    pub jitter_max: f64,
}

impl RetryConfig {
    /// Seconds-scale backoff with jitter.
    pub fn production() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(30),
            jitter_min: 0.8,
            jitter_max: 1.2,
        }
    }

    /// Millisecond backoff without jitter, for test harnesses.
    pub fn for_tests() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(20),
            jitter_min: 1.0,
            jitter_max: 1.0,
        }
    }

    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry `k` (zero-based): `min(max, base * 2^k * jitter)`.
    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_with_jitter(retry, self.sample_jitter())
    }

    pub fn backoff_without_jitter(&self, retry: u32) -> Duration {
        self.backoff_with_jitter(retry, 1.0)
    }

    fn backoff_with_jitter(&self, retry: u32, jitter: f64) -> Duration {
        let factor = 2f64.powi(retry.min(30) as i32) * jitter;
        let raw = self.base_backoff.as_secs_f64() * factor;
        let capped = raw.min(self.max_backoff.as_secs_f64());
        Duration::from_secs_f64(capped.max(0.0))
    }

    fn sample_jitter(&self) -> f64 {
        if self.jitter_max > self.jitter_min {
            rand::thread_rng().gen_range(self.jitter_min..self.jitter_max)
        } else {
            self.jitter_min
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::production()
    }
}

/// Whether an HTTP status from the provider is worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | STATUS_OVERLOADED)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_until_capped() {
        let config = RetryConfig::production();
        assert_eq!(config.backoff_without_jitter(0), Duration::from_secs(2));
        assert_eq!(config.backoff_without_jitter(1), Duration::from_secs(4));
        assert_eq!(config.backoff_without_jitter(3), Duration::from_secs(16));
        assert_eq!(config.backoff_without_jitter(4), Duration::from_secs(30));
        assert_eq!(config.backoff_without_jitter(40), Duration::from_secs(30));
    }

    /// Verifies jittered backoff stays within [base*2^k*min, base*2^k*max).
    #[test]
    fn jittered_backoff_stays_in_bounds() {
        let config = RetryConfig {
            max_backoff: Duration::from_secs(3600),
            ..RetryConfig::production()
        };
        for retry in 0..4 {
            let nominal = config.backoff_without_jitter(retry).as_secs_f64();
            for _ in 0..50 {
                let delay = config.backoff(retry).as_secs_f64();
                assert!(delay >= nominal * config.jitter_min - 1e-9, "{delay} too small");
                assert!(delay < nominal * config.jitter_max, "{delay} too large");
            }
        }
    }

    #[test]
    fn test_preset_has_no_jitter() {
        let config = RetryConfig::for_tests();
        for retry in 0..6 {
            assert_eq!(config.backoff(retry), config.backoff_without_jitter(retry));
        }
        assert_eq!(config.backoff(5), Duration::from_millis(20));
        assert_eq!(config.max_attempts(), 4);
    }

    #[test]
    fn classifies_statuses() {
        for status in [429, 500, 502, 503, 504, 529] {
            assert!(is_retryable_status(status), "{status}");
        }
        for status in [200, 400, 401, 403, 404, 413, 501] {
            assert!(!is_retryable_status(status), "{status}");
        }
    }
}
