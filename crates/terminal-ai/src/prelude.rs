//! Convenience re-exports for common `terminal-ai` types.
//!
//! ```ignore
//! use terminal_ai::prelude::*;
//! ```
//!
//! Covers what a caller needs to load providers and dispatch a request.
//! Wire-level types (payloads, envelopes, stream events) stay in their
//! modules under [`api`](crate::api).

// ── Core types ──────────────────────────────────────────────────────
pub use crate::{ChatRequest, DispatchError, FailureCategory, Message, MessageRole};

// ── Providers ───────────────────────────────────────────────────────
pub use crate::config::{self, ProcessEnv, ProviderConfigFile, SecretSource};
pub use crate::registry::{
    ByokRoute, ProviderIdentity, ProviderPolicy, ProviderRegistry, RoutingMode, SharedRegistry,
};

// ── Dispatch ────────────────────────────────────────────────────────
pub use crate::api::{
    Completion, DispatchOptions, DispatchReport, Dispatcher, HttpTransport, Reply, RetryPolicy,
    StreamedReply, Transport,
};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    CompositeEventHandler, DispatchEvent, EventHandler, FnEventHandler, LoggingHandler,
    NoopHandler,
};
