use gantry_tool_runtime::provider::LlmError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Coarse failure category used by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    /// Malformed request, unprocessable input: retrying cannot help.
    ClientError,
    /// Missing or invalid credentials.
    AuthError,
    /// Rate limited with a realistic chance of succeeding on retry.
    RateLimitRetryable,
    /// Rate limited with no point in retrying (quota exhausted).
    RateLimitTerminal,
    /// Network-level hiccup: connection reset, DNS, truncated stream.
    Transient,
    /// Provider-side 5xx.
    ServerError,
    Unknown,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::RateLimitRetryable | ErrorCategory::Transient | ErrorCategory::ServerError
        )
    }
}

/// What a provider's classifier learned about a failure.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorClassification {
    pub category: ErrorCategory,
    pub status_code: Option<u16>,
    pub retry_after: Option<Duration>,
    pub error_code: Option<String>,
    pub request_id: Option<String>,
}

impl ErrorClassification {
    pub fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            status_code: None,
            retry_after: None,
            error_code: None,
            request_id: None,
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status_code = Some(status);
        self
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }
}

/// Default classifier, used when a provider does not override
/// [`ProviderFeatures::classify`](crate::registry::ProviderFeatures::classify).
pub fn classify(error: &LlmError) -> ErrorClassification {
    match error {
        LlmError::AuthError => ErrorClassification::of(ErrorCategory::AuthError),
        LlmError::RateLimited { retry_after } => {
            ErrorClassification::of(ErrorCategory::RateLimitRetryable)
                .with_status(429)
                .with_retry_after(*retry_after)
        }
        LlmError::ApiError { status, .. } => {
            let category = match status {
                401 | 403 => ErrorCategory::AuthError,
                429 => ErrorCategory::RateLimitRetryable,
                400..=499 => ErrorCategory::ClientError,
                500..=599 => ErrorCategory::ServerError,
                _ => ErrorCategory::Unknown,
            };
            ErrorClassification::of(category).with_status(*status)
        }
        LlmError::NetworkError(_) | LlmError::StreamError(_) => {
            ErrorClassification::of(ErrorCategory::Transient)
        }
        LlmError::InvalidResponse(_) => ErrorClassification::of(ErrorCategory::Unknown),
        LlmError::NotConfigured(_) => ErrorClassification::of(ErrorCategory::ClientError),
        LlmError::Cancelled => ErrorClassification::of(ErrorCategory::Unknown),
        LlmError::Other(_) => ErrorClassification::of(ErrorCategory::Unknown),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_keeps_retry_after_hint() {
        let classification = classify(&LlmError::RateLimited {
            retry_after: Some(Duration::from_millis(250)),
        });
        assert_eq!(classification.category, ErrorCategory::RateLimitRetryable);
        assert_eq!(classification.retry_after, Some(Duration::from_millis(250)));
        assert_eq!(classification.status_code, Some(429));
    }

    #[test]
    fn status_codes_map_to_categories() {
        let cases = [
            (400, ErrorCategory::ClientError),
            (401, ErrorCategory::AuthError),
            (403, ErrorCategory::AuthError),
            (422, ErrorCategory::ClientError),
            (429, ErrorCategory::RateLimitRetryable),
            (500, ErrorCategory::ServerError),
            (503, ErrorCategory::ServerError),
        ];
        for (status, expected) in cases {
            let classification = classify(&LlmError::ApiError {
                status,
                message: String::new(),
            });
            assert_eq!(classification.category, expected, "status {status}");
        }
    }

    #[test]
    fn network_errors_are_transient() {
        let classification = classify(&LlmError::NetworkError("connection reset".to_string()));
        assert_eq!(classification.category, ErrorCategory::Transient);
        assert!(classification.category.is_retryable());
    }

    #[test]
    fn auth_is_not_retryable() {
        assert!(!classify(&LlmError::AuthError).category.is_retryable());
    }
}
