//! Retry and fallback across providers.
//!
//! A dispatch walks the candidate list in order. Each candidate without a
//! credential is skipped; every other candidate gets its first attempt plus
//! `max_retries` retries, each retry after the policy's fixed delay. The
//! first success ends the dispatch. When the last candidate's budget runs
//! out the dispatch fails with [`DispatchError::Exhausted`].
//!
//! Attempts are strictly sequential. The network call, every body read and
//! every retry delay are raced against the dispatcher's
//! [`CancellationToken`].
//!
//! ```ignore
//! let reply = Dispatcher::new(&registry, &transport)
//!     .with_retry_policy(RetryPolicy::fixed(Duration::from_millis(500)))
//!     .with_event_handler(&LoggingHandler)
//!     .dispatch_stream(&request, &DispatchOptions::default())
//!     .await?;
//! ```

use super::request::build_request;
use super::response::{ResponseEnvelope, decode_buffered};
use super::retry::{RetryPolicy, classify, combine_errors};
use super::streaming::{StreamFailure, StreamOutcome, event_stream, fold_events};
use super::transport::{BodyStream, Transport, TransportResponse};
use crate::error::{DispatchError, FailureCategory};
use crate::events::{DispatchEvent, EventHandler, NoopHandler, SkipReason};
use crate::registry::{ProviderRegistry, RoutingMode};
use crate::ChatRequest;
use std::borrow::Cow;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

// ── Options & results ──────────────────────────────────────────────

/// Per-dispatch choices made by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchOptions {
    /// Tried first. Without fallback, the only provider tried.
    pub preferred: Option<String>,
    /// Whether to move on to other providers after the first is exhausted.
    pub fallback_enabled: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            preferred: None,
            fallback_enabled: true,
        }
    }
}

impl DispatchOptions {
    pub fn prefer(provider: impl Into<String>) -> Self {
        Self {
            preferred: Some(provider.into()),
            ..Default::default()
        }
    }

    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }
}

/// One attempt against one provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub provider: String,
    /// 1-based within the provider.
    pub attempt: u32,
    pub succeeded: bool,
    pub category: Option<FailureCategory>,
    /// Transport and provider error text, combined. Empty on success.
    pub error: String,
}

/// Everything that happened during a dispatch, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub attempts: Vec<AttemptOutcome>,
    pub skipped: Vec<(String, SkipReason)>,
}

impl DispatchReport {
    pub fn attempts_on(&self, provider: &str) -> usize {
        self.attempts.iter().filter(|a| a.provider == provider).count()
    }

    pub fn last_failure(&self) -> Option<&AttemptOutcome> {
        self.attempts.iter().rev().find(|a| !a.succeeded)
    }
}

/// A buffered reply.
#[derive(Debug, Clone)]
pub struct Completion {
    pub provider: String,
    pub envelope: ResponseEnvelope,
    pub report: DispatchReport,
}

impl Completion {
    /// Content of the first choice. `None` when the provider produced no
    /// content.
    pub fn content(&self) -> Option<&str> {
        self.envelope.content()
    }
}

/// A streamed reply. Every fragment was already delivered as a
/// [`DispatchEvent::TextDelta`].
#[derive(Debug, Clone)]
pub struct StreamedReply {
    pub provider: String,
    pub outcome: StreamOutcome,
    pub report: DispatchReport,
}

impl StreamedReply {
    pub fn text(&self) -> &str {
        &self.outcome.text
    }
}

/// Either kind of reply, as chosen by [`ChatRequest::stream`].
#[derive(Debug, Clone)]
pub enum Reply {
    Buffered(Completion),
    Streamed(StreamedReply),
}

impl Reply {
    pub fn provider(&self) -> &str {
        match self {
            Reply::Buffered(c) => &c.provider,
            Reply::Streamed(s) => &s.provider,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            Reply::Buffered(c) => c.content(),
            Reply::Streamed(s) => Some(s.text()),
        }
    }

    pub fn report(&self) -> &DispatchReport {
        match self {
            Reply::Buffered(c) => &c.report,
            Reply::Streamed(s) => &s.report,
        }
    }
}

// ── Dispatcher ─────────────────────────────────────────────────────

/// An attempt after its response was opened.
enum Attempt<T> {
    Opened(T),
    Failed {
        category: FailureCategory,
        message: String,
    },
}

/// The provider that opened a usable response, and the attempt that did.
struct Opened<T> {
    provider: String,
    attempt: u32,
    value: T,
    report: DispatchReport,
}

/// Sends a [`ChatRequest`] to the first provider that answers.
pub struct Dispatcher<'a> {
    registry: &'a ProviderRegistry,
    transport: &'a dyn Transport,
    retry: RetryPolicy,
    cancel: CancellationToken,
    handler: &'a dyn EventHandler,
}

impl<'a> Dispatcher<'a> {
    pub fn new(registry: &'a ProviderRegistry, transport: &'a dyn Transport) -> Self {
        Self {
            registry,
            transport,
            retry: RetryPolicy::default(),
            cancel: CancellationToken::new(),
            handler: &NoopHandler,
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Abort the dispatch when `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_event_handler(mut self, handler: &'a dyn EventHandler) -> Self {
        self.handler = handler;
        self
    }

    /// Providers to try, in order.
    ///
    /// Without fallback this is the preferred provider (or the default) on
    /// its own, enabled or not. With fallback it is the resolved priority
    /// order, with an enabled preferred provider moved to the front.
    pub fn candidates(&self, options: &DispatchOptions) -> Result<Vec<String>, DispatchError> {
        if let Some(name) = &options.preferred
            && !self.registry.contains(name)
        {
            return Err(DispatchError::UnknownProvider(name.clone()));
        }

        if !options.fallback_enabled {
            let name = options
                .preferred
                .as_deref()
                .or_else(|| self.registry.default_provider())
                .ok_or_else(DispatchError::no_eligible_provider)?;
            if !self.registry.contains(name) {
                return Err(DispatchError::UnknownProvider(name.to_string()));
            }
            return Ok(vec![name.to_string()]);
        }

        let mut order = self.registry.resolve_order();
        if let Some(name) = &options.preferred
            && let Some(pos) = order.iter().position(|n| n == name)
        {
            let preferred = order.remove(pos);
            order.insert(0, preferred);
        }
        if order.is_empty() {
            return Err(DispatchError::no_eligible_provider());
        }
        Ok(order)
    }

    /// Dispatch in the mode chosen by `request.stream`.
    pub async fn send(
        &self,
        request: &ChatRequest,
        options: &DispatchOptions,
    ) -> Result<Reply, DispatchError> {
        if request.stream {
            self.dispatch_stream(request, options).await.map(Reply::Streamed)
        } else {
            self.dispatch(request, options).await.map(Reply::Buffered)
        }
    }

    /// Dispatch and read each reply as one JSON envelope.
    pub async fn dispatch(
        &self,
        request: &ChatRequest,
        options: &DispatchOptions,
    ) -> Result<Completion, DispatchError> {
        let Opened {
            provider,
            attempt,
            value: envelope,
            mut report,
        } = self
            .run(request, options, false, |response| self.open_buffered(response))
            .await?;
        if envelope.content().is_none() {
            debug!("{provider}: reply carried no content");
        }
        self.succeed(&mut report, &provider, attempt);
        Ok(Completion {
            provider,
            envelope,
            report,
        })
    }

    /// Dispatch with `stream: true`, forwarding fragments as
    /// [`DispatchEvent::TextDelta`] while they arrive.
    ///
    /// Failures before the stream starts (including non-2xx statuses) are
    /// retried and failed over like buffered ones. Once a stream has
    /// started, any error ends the dispatch with [`DispatchError::Stream`].
    /// The attempt only counts as succeeded once the stream has ended.
    pub async fn dispatch_stream(
        &self,
        request: &ChatRequest,
        options: &DispatchOptions,
    ) -> Result<StreamedReply, DispatchError> {
        let Opened {
            provider,
            attempt,
            value: body,
            mut report,
        } = self
            .run(request, options, true, |response| self.open_stream(response))
            .await?;

        let failure = match self.fold(body).await {
            Ok(outcome) => {
                self.succeed(&mut report, &provider, attempt);
                return Ok(StreamedReply {
                    provider,
                    outcome,
                    report,
                });
            }
            Err(failure) => failure,
        };
        let message = failure.to_string();
        let category = match failure {
            StreamFailure::Cancelled => return Err(DispatchError::Cancelled),
            StreamFailure::Transport(e) => classify(Some(&e), None),
            StreamFailure::Envelope(error) => {
                let envelope = ResponseEnvelope {
                    choices: Vec::new(),
                    error: Some(error),
                };
                classify(None, Some(&envelope))
            }
        };
        self.fail(&mut report, &provider, attempt, category, &message);
        Err(DispatchError::Stream {
            provider,
            message,
            report,
        })
    }

    /// The retry and fallback loop. `open` turns a response into the
    /// mode's reply body, or into a classified failure.
    async fn run<T, F, Fut>(
        &self,
        request: &ChatRequest,
        options: &DispatchOptions,
        stream: bool,
        open: F,
    ) -> Result<Opened<T>, DispatchError>
    where
        F: Fn(TransportResponse) -> Fut,
        Fut: Future<Output = Result<Attempt<T>, DispatchError>>,
    {
        let request = if request.stream == stream {
            Cow::Borrowed(request)
        } else {
            Cow::Owned(request.clone().with_stream(stream))
        };
        let candidates = self.candidates(options)?;
        let mut report = DispatchReport::default();
        let mut last_error: Option<(String, FailureCategory, String)> = None;

        for name in &candidates {
            let (Some(identity), Some(policy)) =
                (self.registry.identity(name), self.registry.policy(name))
            else {
                self.skip(&mut report, name, SkipReason::NotConfigured);
                continue;
            };
            if !identity.has_credential() {
                self.skip(&mut report, name, SkipReason::MissingCredential);
                continue;
            }

            let routing = self.registry.routing_for(name);
            let built = match build_request(&request, identity, &routing) {
                Ok(built) => built,
                Err(e) => {
                    let message = e.to_string();
                    self.fail(&mut report, name, 1, FailureCategory::Unknown, &message);
                    last_error = Some((name.clone(), FailureCategory::Unknown, message));
                    continue;
                }
            };
            if let RoutingMode::AggregatedWithOrder(route) = &routing {
                self.handler.on_event(&DispatchEvent::ByokRouting {
                    provider: name,
                    order: &route.order,
                });
            }

            let max_attempts = policy.max_retries.saturating_add(1);
            for attempt in 1..=max_attempts {
                if self.cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled);
                }
                self.handler.on_event(&DispatchEvent::AttemptStarted {
                    provider: name,
                    priority: policy.priority,
                    attempt,
                    max_attempts,
                });

                let sent = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
                    sent = self.transport.send(&built) => sent,
                };
                let result = match sent {
                    Ok(response) => open(response).await?,
                    Err(e) => transport_failure(&e),
                };
                let (category, message) = match result {
                    Attempt::Opened(value) => {
                        return Ok(Opened {
                            provider: name.clone(),
                            attempt,
                            value,
                            report,
                        });
                    }
                    Attempt::Failed { category, message } => (category, message),
                };
                self.fail(&mut report, name, attempt, category, &message);
                last_error = Some((name.clone(), category, message));

                if attempt < max_attempts {
                    let delay = self.retry.delay;
                    self.handler.on_event(&DispatchEvent::RetryScheduled {
                        provider: name,
                        retry: attempt,
                        max_retries: policy.max_retries,
                        delay,
                    });
                    self.pause(delay).await?;
                }
            }
            self.handler.on_event(&DispatchEvent::ProviderExhausted {
                provider: name,
                attempts: max_attempts,
            });
        }

        match last_error {
            Some((provider, category, message)) => Err(DispatchError::Exhausted {
                provider,
                category,
                message,
                report,
            }),
            None => Err(DispatchError::NoEligibleProvider { report }),
        }
    }

    /// Read a whole response body and decode it.
    async fn read_envelope(
        &self,
        response: TransportResponse,
    ) -> Result<Result<ResponseEnvelope, String>, DispatchError> {
        let status = response.status;
        let body = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DispatchError::Cancelled),
            body = response.into_bytes() => body,
        };
        Ok(body.map(|body| {
            debug!("HTTP {status}: read {} byte body", body.len());
            decode_buffered(status, &body)
        }))
    }

    async fn open_buffered(
        &self,
        response: TransportResponse,
    ) -> Result<Attempt<ResponseEnvelope>, DispatchError> {
        Ok(match self.read_envelope(response).await? {
            Ok(envelope) if envelope.is_success() => Attempt::Opened(envelope),
            Ok(envelope) => rejected(&envelope),
            Err(e) => transport_failure(&e),
        })
    }

    /// A 2xx body is handed on unread; any other status is read as an
    /// error envelope.
    async fn open_stream(
        &self,
        response: TransportResponse,
    ) -> Result<Attempt<BodyStream>, DispatchError> {
        if response.is_success() {
            return Ok(Attempt::Opened(response.body));
        }
        Ok(match self.read_envelope(response).await? {
            Ok(envelope) => rejected(&envelope),
            Err(e) => transport_failure(&e),
        })
    }

    async fn pause(&self, delay: Duration) -> Result<(), DispatchError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(DispatchError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn fold(&self, body: BodyStream) -> Result<StreamOutcome, StreamFailure> {
        let handler = self.handler;
        fold_events(event_stream(body), &self.cancel, |text| {
            handler.on_event(&DispatchEvent::TextDelta(text));
        })
        .await
    }

    fn skip(&self, report: &mut DispatchReport, name: &str, reason: SkipReason) {
        self.handler.on_event(&DispatchEvent::ProviderSkipped {
            provider: name,
            reason,
        });
        report.skipped.push((name.to_string(), reason));
    }

    fn fail(
        &self,
        report: &mut DispatchReport,
        name: &str,
        attempt: u32,
        category: FailureCategory,
        message: &str,
    ) {
        self.handler.on_event(&DispatchEvent::AttemptFailed {
            provider: name,
            attempt,
            category,
            error: message,
        });
        report.attempts.push(AttemptOutcome {
            provider: name.to_string(),
            attempt,
            succeeded: false,
            category: Some(category),
            error: message.to_string(),
        });
    }

    fn succeed(&self, report: &mut DispatchReport, name: &str, attempt: u32) {
        report.attempts.push(AttemptOutcome {
            provider: name.to_string(),
            attempt,
            succeeded: true,
            category: None,
            error: String::new(),
        });
        self.handler.on_event(&DispatchEvent::Succeeded {
            provider: name,
            attempts: attempt,
        });
    }
}

fn transport_failure<T>(error: &str) -> Attempt<T> {
    Attempt::Failed {
        category: classify(Some(error), None),
        message: combine_errors(Some(error), None),
    }
}

fn rejected<T>(envelope: &ResponseEnvelope) -> Attempt<T> {
    Attempt::Failed {
        category: classify(None, Some(envelope)),
        message: combine_errors(None, Some(envelope)),
    }
}
