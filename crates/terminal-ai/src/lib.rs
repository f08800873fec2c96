//! Multi-provider chat dispatch for a terminal LLM assistant.
//!
//! `terminal-ai` sends a conversation to one of several interchangeable
//! OpenAI-compatible chat completion providers and returns the reply, either
//! as one buffered JSON envelope or as incremental text deltas decoded from a
//! Server-Sent Events stream. Providers are tried in priority order with a
//! bounded number of fixed-delay retries each; when one provider's budget is
//! exhausted the next one takes over.
//!
//! # Getting started
//!
//! ```ignore
//! use terminal_ai::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let file = ProviderConfigFile::load_or_create(&config::providers_path()?)?;
//!     let registry = file.to_registry(&ProcessEnv::from_env());
//!     let transport = HttpTransport::new()?;
//!
//!     let request = ChatRequest::new(vec![Message::user("Hello!")]);
//!     let completion = Dispatcher::new(&registry, &transport)
//!         .with_retry_policy(file.retry_policy())
//!         .dispatch(&request, &DispatchOptions::default())
//!         .await
//!         .map_err(|e| e.to_string())?;
//!
//!     println!("{}", completion.content().unwrap_or_default());
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Provider identities, priorities and BYOK routing:** see
//!   [`ProviderRegistry`](registry::ProviderRegistry) and
//!   [`RoutingMode`](registry::RoutingMode).
//! - **Loading configuration from disk and the environment:** see
//!   [`ProviderConfigFile`](config::ProviderConfigFile).
//! - **Sending a request with retry and fallback:** see
//!   [`Dispatcher`](api::dispatch::Dispatcher).
//! - **Observing retries, skips and streamed text:** implement
//!   [`EventHandler`](events::EventHandler).
//! - **Wire formats:** [`api::request`] builds payloads and auth headers,
//!   [`api::response`] and [`api::streaming`] decode replies.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`registry`] | Provider identities, policies, priority resolution, BYOK management |
//! | [`config`] | `providers.json` persistence, env/secret resolution |
//! | [`api`] | Request building, transport, classification, decoding, dispatch |
//! | [`events`] | Dispatch lifecycle events and handlers |
//! | [`error`] | Failure categories and the dispatch error type |

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod prelude;
pub mod registry;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use error::{DispatchError, FailureCategory};

// ── Constants ──────────────────────────────────────────────────────

/// The aggregator provider: the only provider that accepts BYOK routing.
pub const AGGREGATOR_PROVIDER: &str = "openrouter";

pub const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";
pub const GEMINI_URL: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai/chat/completions";
pub const GROQ_URL: &str = "https://api.groq.com/openai/v1/chat/completions";

/// Model used for the aggregator when `OPENROUTER_MODEL` is unset.
pub const DEFAULT_MODEL: &str = "openai/gpt-4o-mini";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-2.0-flash";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";

/// `HTTP-Referer` identification header sent to the aggregator.
pub const APP_REFERER: &str = "https://terminal-ai.local";
/// `X-Title` identification header sent to the aggregator.
pub const APP_TITLE: &str = "Terminal AI CLI";

/// Per-attempt HTTP timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Built-in endpoint for a stock provider, if it has one.
pub fn default_endpoint(provider: &str) -> Option<&'static str> {
    match provider {
        "openrouter" => Some(OPENROUTER_URL),
        "gemini" => Some(GEMINI_URL),
        "groq" => Some(GROQ_URL),
        _ => None,
    }
}

/// Built-in model for a stock provider, if it has one.
pub fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "openrouter" => Some(DEFAULT_MODEL),
        "gemini" => Some(DEFAULT_GEMINI_MODEL),
        "groq" => Some(DEFAULT_GROQ_MODEL),
        _ => None,
    }
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageRole::System => write!(f, "system"),
            MessageRole::User => write!(f, "user"),
            MessageRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
        }
    }
}

// ── Request types ──────────────────────────────────────────────────

/// A logical chat request, independent of any provider's wire format.
///
/// Messages are sent in the order given. When `model` is `None` each
/// provider receives its own configured model; set it to pin one slug for
/// every attempt (for example a BYOK model override).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatRequest {
    pub model: Option<String>,
    pub messages: Vec<Message>,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    /// Pin the model slug for every attempt.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors() {
        let sys = Message::system("hello");
        assert_eq!(sys.role, MessageRole::System);
        assert_eq!(sys.content, "hello");

        let user = Message::user("world");
        assert_eq!(user.role, MessageRole::User);

        let assist = Message::assistant("prefill");
        assert_eq!(assist.role, MessageRole::Assistant);
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_value(Message::assistant("hi")).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(MessageRole::User.to_string(), "user");
    }

    #[test]
    fn chat_request_builders() {
        let req = ChatRequest::new(vec![Message::user("hi")])
            .with_model("groq/llama")
            .with_stream(true);
        assert_eq!(req.model.as_deref(), Some("groq/llama"));
        assert!(req.stream);
        assert_eq!(req.messages.len(), 1);
    }

    #[test]
    fn stock_provider_defaults() {
        assert_eq!(default_endpoint("openrouter"), Some(OPENROUTER_URL));
        assert_eq!(default_model("groq"), Some(DEFAULT_GROQ_MODEL));
        assert!(default_endpoint("custom").is_none());
    }
}
