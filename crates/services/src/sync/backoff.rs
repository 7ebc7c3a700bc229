use std::time::Duration;

use rand::Rng;

/// Failures before an item is moved to dead letter.
pub(crate) const RETRY_CEILING: u32 = 5;

const BASE_DELAY_MS: u64 = 1_000;
const MAX_DELAY_MS: u64 = 16_000;
const MAX_JITTER_MS: u64 = 500;

/// Delay before the next attempt after `retry_count` failures: exponential
/// from 1s doubling to a 16s ceiling, plus up to 500ms of uniform jitter so
/// clients that lost connectivity together do not retry in lockstep.
pub(crate) fn backoff_delay(retry_count: u32) -> Duration {
    let exponent = retry_count.saturating_sub(1).min(10);
    let base = BASE_DELAY_MS
        .saturating_mul(1_u64 << exponent)
        .min(MAX_DELAY_MS);
    let jitter = rand::rng().random_range(0..=MAX_JITTER_MS);
    Duration::from_millis(base + jitter)
}
