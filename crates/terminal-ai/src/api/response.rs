//! Buffered response envelopes.

use serde::Deserialize;
use tracing::warn;

/// Upper bound on how much of a non-JSON error body is kept.
const MAX_ERROR_BODY_CHARS: usize = 500;

/// Provider error record.
///
/// OpenAI-style providers report `type`; Google reports `status`. Either may
/// carry the rate-limit marker, and `code` is a number or a string.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ApiError {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub code: Option<serde_json::Value>,
}

impl ApiError {
    /// A synthesized record for a failed HTTP status.
    pub fn from_status(status: u16, body: &str) -> Self {
        let body: String = body.trim().chars().take(MAX_ERROR_BODY_CHARS).collect();
        Self {
            message: Some(format!("HTTP {status}: {body}")),
            kind: None,
            status: None,
            code: Some(serde_json::Value::from(status)),
        }
    }

    pub fn message(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    /// Numeric code, whether sent as a number or a string.
    pub fn code(&self) -> Option<i64> {
        match self.code.as_ref()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// `type` and `status`, joined.
    pub fn kind_text(&self) -> String {
        [self.kind.as_deref(), self.status.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// An error record with an empty message does not count as a failure.
    pub fn is_empty(&self) -> bool {
        self.message().is_empty()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ChoiceMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct Choice {
    #[serde(default)]
    pub message: ChoiceMessage,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

/// A decoded buffered response: candidate completions or an error record.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub error: Option<ApiError>,
}

impl ResponseEnvelope {
    /// The error record, unless absent or empty.
    pub fn error(&self) -> Option<&ApiError> {
        self.error.as_ref().filter(|e| !e.is_empty())
    }

    pub fn is_success(&self) -> bool {
        self.error().is_none()
    }

    /// Content of the first choice.
    pub fn content(&self) -> Option<&str> {
        self.choices.first()?.message.content.as_deref()
    }
}

/// Decode a whole response body.
///
/// A body that is not a JSON envelope decodes to an empty envelope, which
/// the dispatcher reports as "no content" rather than a failure. A non-2xx
/// status without an error record gets one synthesized from the status and
/// body.
pub fn decode_buffered(status: u16, body: &[u8]) -> ResponseEnvelope {
    let mut envelope = match serde_json::from_slice::<ResponseEnvelope>(body) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Failed to parse response body ({} bytes): {e}", body.len());
            ResponseEnvelope::default()
        }
    };
    if !(200..300).contains(&status) && envelope.error().is_none() {
        envelope.error = Some(ApiError::from_status(status, &String::from_utf8_lossy(body)));
    }
    envelope
}
