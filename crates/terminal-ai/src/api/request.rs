//! Wire payloads and auth headers for provider requests.

use crate::error::DispatchError;
use crate::registry::{ProviderIdentity, RoutingMode};
use crate::{AGGREGATOR_PROVIDER, APP_REFERER, APP_TITLE, ChatRequest, Message};
use serde::Serialize;

/// How a provider expects its credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <key>`.
    Bearer,
    /// Bearer plus the `HTTP-Referer` and `X-Title` identification headers.
    BearerWithAppHeaders,
    /// `x-goog-api-key: <key>`.
    GoogleApiKey,
}

impl AuthScheme {
    /// The auth scheme for a provider name. Unlisted providers use
    /// [`AuthScheme::Bearer`].
    pub fn for_provider(name: &str) -> Self {
        match name {
            AGGREGATOR_PROVIDER => AuthScheme::BearerWithAppHeaders,
            "gemini" => AuthScheme::GoogleApiKey,
            _ => AuthScheme::Bearer,
        }
    }

    fn headers(self, credential: &str) -> Vec<(&'static str, String)> {
        match self {
            AuthScheme::Bearer => vec![("Authorization", format!("Bearer {credential}"))],
            AuthScheme::BearerWithAppHeaders => vec![
                ("Authorization", format!("Bearer {credential}")),
                ("HTTP-Referer", APP_REFERER.to_string()),
                ("X-Title", APP_TITLE.to_string()),
            ],
            AuthScheme::GoogleApiKey => vec![("x-goog-api-key", credential.to_string())],
        }
    }
}

/// Upstream preferences attached to an aggregator request.
#[derive(Serialize, Debug)]
pub struct ProviderPreferences<'a> {
    pub allow_fallbacks: bool,
    pub order: &'a [String],
}

#[derive(Serialize, Debug)]
struct WirePayload<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<ProviderPreferences<'a>>,
}

const SENSITIVE_HEADERS: &[&str] = &["Authorization", "x-goog-api-key"];

/// A serialized request, ready for a [`Transport`](super::transport::Transport).
#[derive(Clone)]
pub struct BuiltRequest {
    pub provider: String,
    pub url: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Vec<u8>,
    pub stream: bool,
}

impl BuiltRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

impl std::fmt::Debug for BuiltRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let headers: Vec<(&str, &str)> = self
            .headers
            .iter()
            .map(|(key, value)| {
                if SENSITIVE_HEADERS.contains(key) {
                    (*key, "<redacted>")
                } else {
                    (*key, value.as_str())
                }
            })
            .collect();
        f.debug_struct("BuiltRequest")
            .field("provider", &self.provider)
            .field("url", &self.url)
            .field("headers", &headers)
            .field("body_len", &self.body.len())
            .field("stream", &self.stream)
            .finish()
    }
}

/// Serialize `request` for `identity`.
///
/// The model is `request.model` when set, otherwise the identity's model.
/// With [`RoutingMode::AggregatedWithOrder`] the payload also carries the
/// upstream order and fallback flag verbatim.
pub fn build_request(
    request: &ChatRequest,
    identity: &ProviderIdentity,
    routing: &RoutingMode,
) -> Result<BuiltRequest, DispatchError> {
    let provider = match routing {
        RoutingMode::Direct => None,
        RoutingMode::AggregatedWithOrder(route) => Some(ProviderPreferences {
            allow_fallbacks: route.allow_fallback_to_shared,
            order: &route.order,
        }),
    };
    let payload = WirePayload {
        model: request.model.as_deref().unwrap_or(&identity.model),
        messages: &request.messages,
        stream: request.stream,
        provider,
    };
    let body = serde_json::to_vec(&payload).map_err(|e| DispatchError::Build {
        provider: identity.name.clone(),
        message: e.to_string(),
    })?;

    let mut headers = vec![("Content-Type", "application/json".to_string())];
    if request.stream {
        headers.push(("Accept", "text/event-stream".to_string()));
    }
    headers.extend(AuthScheme::for_provider(&identity.name).headers(&identity.credential));

    Ok(BuiltRequest {
        provider: identity.name.clone(),
        url: identity.endpoint.clone(),
        headers,
        body,
        stream: request.stream,
    })
}
