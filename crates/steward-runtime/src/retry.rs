use rand::Rng;
use std::time::Duration;
use steward_core::RetryPolicy;

/// Backoff before the attempt following `attempt`, with random jitter of up
/// to `policy.jitter` of the delay in either direction.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base = policy.delay_after(attempt);
    if policy.jitter <= 0.0 || base.is_zero() {
        return base;
    }
    let spread = policy.jitter.min(1.0);
    let factor = rand::rng().random_range((1.0 - spread)..=(1.0 + spread));
    base.mul_f64(factor)
}
