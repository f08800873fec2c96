//! Failure classification and the fixed-delay retry policy.
//!
//! Every category is retried the same way: up to the provider's
//! `max_retries` times, each retry preceded by the same delay. The category
//! is reported in events and in the final error but never changes the
//! decision.

use super::response::ResponseEnvelope;
use crate::error::FailureCategory;
use std::time::Duration;

/// Delay before each retry on the same provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_millis(1000))
    }
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self { delay }
    }

    /// No delay between retries.
    pub fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }
}

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline exceeded"];
const NETWORK_MARKERS: &[&str] = &[
    "connection",
    "network",
    "broken pipe",
    "dns error",
    "connect error",
];
const RATE_LIMIT_KINDS: &[&str] = &["rate_limit", "resource_exhausted", "too_many_requests"];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Classify a failed attempt.
///
/// Transport errors are checked first (timeout, then network), then the
/// error envelope (rate limit, then any other error). Anything else is
/// [`FailureCategory::Unknown`].
pub fn classify(
    transport_error: Option<&str>,
    envelope: Option<&ResponseEnvelope>,
) -> FailureCategory {
    if let Some(err) = transport_error {
        let lower = err.to_lowercase();
        if contains_any(&lower, TIMEOUT_MARKERS) {
            return FailureCategory::Timeout;
        }
        if contains_any(&lower, NETWORK_MARKERS) {
            return FailureCategory::Network;
        }
    }

    if let Some(error) = envelope.and_then(ResponseEnvelope::error) {
        let kind = error.kind_text().to_lowercase();
        let message = error.message().to_lowercase();
        if contains_any(&kind, RATE_LIMIT_KINDS)
            || message.contains("rate limit")
            || message.contains("429")
            || error.code() == Some(429)
        {
            return FailureCategory::RateLimit;
        }
        return FailureCategory::ServerError;
    }

    FailureCategory::Unknown
}

/// The error text recorded for a failed attempt.
pub fn combine_errors(transport_error: Option<&str>, envelope: Option<&ResponseEnvelope>) -> String {
    let api_error = envelope.and_then(ResponseEnvelope::error);
    match (transport_error, api_error) {
        (Some(t), Some(e)) => format!("{t}: {}", e.message()),
        (Some(t), None) => t.to_string(),
        (None, Some(e)) => e.message().to_string(),
        (None, None) => "unknown error".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::response::decode_buffered;

    fn envelope(json: &str) -> ResponseEnvelope {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn deadline_exceeded_is_timeout_regardless_of_envelope() {
        let rate_limited = envelope(r#"{"error":{"message":"rate limit","type":"rate_limit"}}"#);
        for env in [None, Some(&rate_limited)] {
            assert_eq!(
                classify(Some("context deadline exceeded"), env),
                FailureCategory::Timeout
            );
        }
        assert_eq!(
            classify(Some("request timeout: operation timed out"), None),
            FailureCategory::Timeout
        );
    }

    #[test]
    fn connection_errors_are_network() {
        assert_eq!(
            classify(Some("connection failed: Connection refused"), None),
            FailureCategory::Network
        );
        assert_eq!(classify(Some("Network unreachable"), None), FailureCategory::Network);
    }

    #[test]
    fn rate_limit_markers() {
        let cases = [
            r#"{"error":{"message":"slow down","type":"rate_limit_exceeded"}}"#,
            r#"{"error":{"message":"Rate limit reached for model"}}"#,
            r#"{"error":{"message":"quota","status":"RESOURCE_EXHAUSTED"}}"#,
            r#"{"error":{"message":"too many","code":429}}"#,
        ];
        for case in cases {
            assert_eq!(classify(None, Some(&envelope(case))), FailureCategory::RateLimit, "{case}");
        }
        assert_eq!(
            classify(None, Some(&decode_buffered(429, b""))),
            FailureCategory::RateLimit
        );
    }

    #[test]
    fn other_envelopes_are_server_errors() {
        let env = envelope(r#"{"error":{"message":"model overloaded","type":"server_error"}}"#);
        assert_eq!(classify(None, Some(&env)), FailureCategory::ServerError);
        assert_eq!(
            classify(None, Some(&decode_buffered(502, b"bad gateway"))),
            FailureCategory::ServerError
        );
        assert_eq!(
            classify(Some("invalid header value"), Some(&env)),
            FailureCategory::ServerError
        );
    }

    #[test]
    fn nothing_recognizable_is_unknown() {
        assert_eq!(classify(None, None), FailureCategory::Unknown);
        assert_eq!(classify(Some("builder error"), None), FailureCategory::Unknown);
        let empty = envelope(r#"{"error":{"message":""}}"#);
        assert_eq!(classify(None, Some(&empty)), FailureCategory::Unknown);
    }

    #[test]
    fn classification_is_deterministic() {
        let env = envelope(r#"{"error":{"message":"Rate limit"}}"#);
        let first = classify(Some("eof"), Some(&env));
        for _ in 0..10 {
            assert_eq!(classify(Some("eof"), Some(&env)), first);
        }
    }

    #[test]
    fn combined_error_text() {
        let env = envelope(r#"{"error":{"message":"overloaded"}}"#);
        assert_eq!(combine_errors(Some("eof"), Some(&env)), "eof: overloaded");
        assert_eq!(combine_errors(None, Some(&env)), "overloaded");
        assert_eq!(combine_errors(None, None), "unknown error");
    }
}
