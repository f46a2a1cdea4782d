use std::time::Duration;

use rand::Rng;

const BASE_DELAY_MS: u64 = 250;
const MAX_DELAY_MS: u64 = 10_000;

/// Delay before retry number `attempt` (1-based): 250ms * 2^(attempt-1),
/// capped at 10s, plus up to 20% jitter.
#[must_use]
pub fn backoff_delay(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BASE_DELAY_MS
        .saturating_mul(1 << exponent)
        .min(MAX_DELAY_MS);
    let jitter = rand::thread_rng().gen_range(0..=base / 5);
    Duration::from_millis(base + jitter)
}
