//! Events and handlers for the [`Dispatcher`](crate::api::dispatch::Dispatcher).
//!
//! The dispatcher reports every decision it makes (skipped providers,
//! classified failures, scheduled retries) through [`DispatchEvent`] values. Streamed text fragments arrive the same way as
//! [`DispatchEvent::TextDelta`], in arrival order.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Tests or fire-and-forget dispatches |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures for simple callbacks |
//! | [`CompositeEventHandler`] | Compose multiple handlers in order |

use crate::error::FailureCategory;
use std::time::Duration;
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

/// Why a candidate provider was passed over without an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The provider has no credential.
    MissingCredential,
    /// The provider has a policy but no identity.
    NotConfigured,
}

/// Events emitted by the dispatcher during one dispatch.
#[derive(Debug)]
pub enum DispatchEvent<'a> {
    /// A candidate was skipped. Does not consume any retry budget.
    ProviderSkipped {
        provider: &'a str,
        reason: SkipReason,
    },
    /// An attempt on `provider` is about to be sent. `attempt` is 1-based.
    AttemptStarted {
        provider: &'a str,
        priority: i32,
        attempt: u32,
        max_attempts: u32,
    },
    /// The request carries an ordered upstream list for the aggregator.
    ByokRouting {
        provider: &'a str,
        order: &'a [String],
    },
    /// An attempt failed and was classified.
    AttemptFailed {
        provider: &'a str,
        attempt: u32,
        category: FailureCategory,
        error: &'a str,
    },
    /// The dispatcher is waiting `delay` before retrying the same provider.
    RetryScheduled {
        provider: &'a str,
        retry: u32,
        max_retries: u32,
        delay: Duration,
    },
    /// `provider` used up its retry budget; the next candidate follows.
    ProviderExhausted { provider: &'a str, attempts: u32 },
    /// An incremental text fragment from a streamed reply.
    TextDelta(&'a str),
    /// A reply was obtained from `provider`.
    Succeeded { provider: &'a str, attempts: u32 },
}

/// Handler for dispatch events.
pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        let _ = event;
    }
}

/// A handler that ignores every event.
pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let DispatchEvent::TextDelta(text) = event {
///         print!("{text}");
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&DispatchEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &DispatchEvent<'_>) {
        (self.0)(event)
    }
}

/// Delegates each event to every inner handler, in registration order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs every event through `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &DispatchEvent<'_>) {
        match event {
            DispatchEvent::ProviderSkipped { provider, reason } => {
                warn!(provider = *provider, ?reason, "Skipping provider");
            }
            DispatchEvent::AttemptStarted {
                provider,
                priority,
                attempt,
                max_attempts,
            } => {
                info!("Attempting provider {provider} (priority {priority}), attempt {attempt}/{max_attempts}");
            }
            DispatchEvent::ByokRouting { provider, order } => {
                debug!("{provider}: BYOK upstream order {order:?}");
            }
            DispatchEvent::AttemptFailed {
                provider,
                attempt,
                category,
                error,
            } => {
                warn!(provider = *provider, attempt = *attempt, %category, "Attempt failed: {error}");
            }
            DispatchEvent::RetryScheduled {
                provider,
                retry,
                max_retries,
                delay,
            } => {
                debug!("{provider}: retry {retry}/{max_retries} in {}ms", delay.as_millis());
            }
            DispatchEvent::ProviderExhausted { provider, attempts } => {
                warn!("{provider}: retry budget exhausted after {attempts} attempt(s), falling back");
            }
            DispatchEvent::TextDelta(_) => {}
            DispatchEvent::Succeeded { provider, attempts } => {
                info!("Success with provider {provider} after {attempts} attempt(s)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn fn_handler_receives_events() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = FnEventHandler::new(move |event| {
            if let DispatchEvent::TextDelta(text) = event {
                sink.lock().unwrap().push(text.to_string());
            }
        });
        handler.on_event(&DispatchEvent::TextDelta("a"));
        handler.on_event(&DispatchEvent::Succeeded {
            provider: "groq",
            attempts: 1,
        });
        handler.on_event(&DispatchEvent::TextDelta("b"));
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn composite_calls_all_handlers_in_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let first = order.clone();
        let second = order.clone();
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |_| first.lock().unwrap().push(1)))
            .with(FnEventHandler::new(move |_| second.lock().unwrap().push(2)));
        handler.on_event(&DispatchEvent::TextDelta("x"));
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
    }
}
