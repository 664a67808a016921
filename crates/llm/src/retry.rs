use crate::error::{ErrorCategory, ErrorClassification};
use gantry_core::options::RetryPolicy;
use std::time::Duration;

/// Delay before retrying `attempt` (0-based index of the attempt that just
/// failed), or `None` when the failure should surface instead.
///
/// Rate-limit failures honor the provider's `retry_after` hint when one is
/// present; everything else retryable backs off exponentially, clamped to
/// `max_delay`.
pub fn retry_delay(
    policy: &RetryPolicy,
    classification: &ErrorClassification,
    attempt: u32,
) -> Option<Duration> {
    if attempt + 1 >= policy.max_attempts {
        return None;
    }
    match classification.category {
        ErrorCategory::RateLimitRetryable => Some(
            classification
                .retry_after
                .unwrap_or_else(|| backoff(policy, attempt)),
        ),
        ErrorCategory::Transient | ErrorCategory::ServerError => Some(backoff(policy, attempt)),
        _ => None,
    }
}

fn backoff(policy: &RetryPolicy, attempt: u32) -> Duration {
    let delay = policy
        .initial_delay
        .mul_f64(policy.multiplier.powi(attempt as i32));
    delay.min(policy.max_delay)
}
