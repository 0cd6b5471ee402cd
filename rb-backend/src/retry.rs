use rand::Rng;
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_JITTER: Duration = Duration::from_secs(1);
// 2^16 seconds is already far past anything a caller would wait for.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Exponential backoff with uniform jitter.
///
/// After attempt `n` (zero-based) fails, the caller sleeps
/// `2^n * base_delay + uniform(0, max_jitter)` before attempt `n + 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_jitter: DEFAULT_MAX_JITTER,
        }
    }
}

impl RetryPolicy {
    /// Policy with no sleeping at all; the attempt budget is kept.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Deterministic part of the delay after attempt `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let multiplier = 1_u32 << attempt.min(MAX_BACKOFF_EXPONENT);
        self.base_delay.saturating_mul(multiplier)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.backoff(attempt) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        if self.max_jitter.is_zero() {
            return Duration::ZERO;
        }
        let fraction: f64 = rand::rng().random_range(0.0..1.0);
        self.max_jitter.mul_f64(fraction)
    }

    pub(crate) fn is_last(&self, attempt: u32) -> bool {
        attempt + 1 >= self.max_attempts
    }
}
