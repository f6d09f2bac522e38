//! Backoff and jitter policy.
//!
//! One jitter policy everywhere: every delay gets symmetric ±10% jitter.
//! Three schedules share it: send retries (exponential from a configured
//! base), per-envelope redelivery (capped at 5 minutes), and subscriber-loop
//! error backoff (capped at 30 seconds).

use rand::Rng;
use std::time::Duration;

/// Jitter fraction applied to every delay.
const JITTER_FRACTION: f64 = 0.10;

/// Ceiling for per-envelope redelivery delays.
const REDELIVERY_CAP: Duration = Duration::from_secs(300);

/// Ceiling for subscriber-loop error delays.
const LOOP_ERROR_CAP: Duration = Duration::from_secs(30);

/// Apply symmetric ±10% jitter to a delay.
#[must_use]
pub fn with_jitter(delay: Duration) -> Duration {
    let millis = delay.as_millis() as f64;
    if millis <= 0.0 {
        return Duration::ZERO;
    }
    let factor = 1.0 + rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    Duration::from_millis((millis * factor) as u64)
}

/// Delay before send attempt `attempt` (1-based): base × 2^(attempt-1), jittered.
#[must_use]
pub fn send_retry_delay(attempt: u32, base: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(2u32.saturating_pow(exponent));
    with_jitter(delay)
}

/// Delay before redelivering an envelope on its `retry_count`-th retry:
/// min(300s, 2^retry_count seconds), jittered.
#[must_use]
pub fn redelivery_delay(retry_count: u32) -> Duration {
    let secs = 2u64.saturating_pow(retry_count.min(16));
    with_jitter(Duration::from_secs(secs).min(REDELIVERY_CAP))
}

/// Delay before a subscriber loop re-polls after `failures` consecutive
/// errors: min(30s, 0.5 × 2^failures seconds), jittered. Prevents error storms.
#[must_use]
pub fn loop_error_delay(failures: u32) -> Duration {
    let millis = 500u64.saturating_mul(2u64.saturating_pow(failures.min(16)));
    with_jitter(Duration::from_millis(millis).min(LOOP_ERROR_CAP))
}
