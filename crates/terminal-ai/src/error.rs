//! Failure taxonomy for provider dispatch.
//!
//! Per-attempt failures are classified into a [`FailureCategory`] and
//! recovered inside the dispatcher. Only the variants of [`DispatchError`]
//! ever reach the caller.

use crate::api::dispatch::DispatchReport;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified cause of a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    Timeout,
    Network,
    RateLimit,
    ServerError,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::Timeout => "timeout",
            FailureCategory::Network => "network",
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::ServerError => "server_error",
            FailureCategory::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload for `provider` could not be serialized. Never retried.
    #[error("build_error: failed to serialize request for {provider}: {message}")]
    Build { provider: String, message: String },

    /// The candidate list was empty, or every candidate lacked a credential.
    /// `report.skipped` lists the candidates that were passed over.
    #[error("no eligible provider: every candidate is disabled or has no API key")]
    NoEligibleProvider { report: DispatchReport },

    /// A provider named by the caller is not configured.
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Every candidate used up its retry budget.
    #[error(
        "all providers failed after {} attempt(s). Last error: provider {provider} ({category}): {message}",
        .report.attempts.len()
    )]
    Exhausted {
        provider: String,
        category: FailureCategory,
        message: String,
        report: DispatchReport,
    },

    /// A stream failed after it had started. Partial output may already
    /// have been delivered, so this is never retried or failed over.
    #[error("stream from {provider} failed: {message}")]
    Stream {
        provider: String,
        message: String,
        report: DispatchReport,
    },

    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// The classified category of the final failure, if there was one.
    pub fn category(&self) -> Option<FailureCategory> {
        match self {
            DispatchError::Exhausted { category, .. } => Some(*category),
            DispatchError::Build { .. } => Some(FailureCategory::Unknown),
            _ => None,
        }
    }

    /// The provider the error is attributed to, if any.
    pub fn provider(&self) -> Option<&str> {
        match self {
            DispatchError::Build { provider, .. }
            | DispatchError::Exhausted { provider, .. }
            | DispatchError::Stream { provider, .. } => Some(provider),
            DispatchError::UnknownProvider(name) => Some(name),
            DispatchError::NoEligibleProvider { .. } | DispatchError::Cancelled => None,
        }
    }

    /// [`DispatchError::NoEligibleProvider`] before any candidate was looked at.
    pub fn no_eligible_provider() -> Self {
        DispatchError::NoEligibleProvider {
            report: DispatchReport::default(),
        }
    }

    /// Attempts and skips made before the dispatch gave up.
    pub fn report(&self) -> Option<&DispatchReport> {
        match self {
            DispatchError::NoEligibleProvider { report }
            | DispatchError::Exhausted { report, .. }
            | DispatchError::Stream { report, .. } => Some(report),
            _ => None,
        }
    }

    /// Number of attempts made, or 0 when none were recorded.
    pub fn attempts(&self) -> usize {
        self.report().map_or(0, |r| r.attempts.len())
    }
}
