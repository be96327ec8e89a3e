use std::time::Duration;

const BACKOFF_BASE: Duration = Duration::from_millis(1_000);
const BACKOFF_CAP: Duration = Duration::from_millis(10_000);

/// Delay before retry number `retry` (1-based): 1s, 2s, 4s, 8s, then 10s.
pub fn backoff_delay(retry: u32) -> Duration {
  let exponent = retry.saturating_sub(1).min(16);
  BACKOFF_BASE
    .saturating_mul(1u32 << exponent)
    .min(BACKOFF_CAP)
}
