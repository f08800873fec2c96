//! The HTTP seam between the dispatcher and providers.
//!
//! [`Transport`] is a boxed-future trait so the dispatcher can be driven by
//! [`HttpTransport`] in production and by an in-memory double in tests.

use super::request::BuiltRequest;
use crate::REQUEST_TIMEOUT;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;

/// Response body as a stream of chunks. Errors are already described for
/// classification.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>>;

/// Future returned by [`Transport::send`].
pub type TransportFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TransportResponse, String>> + Send + 'a>>;

/// Status and unread body of an HTTP response.
pub struct TransportResponse {
    pub status: u16,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn new(status: u16, body: BodyStream) -> Self {
        Self { status, body }
    }

    /// A response whose body is already in memory.
    pub fn full(status: u16, body: impl Into<Bytes>) -> Self {
        let body: Bytes = body.into();
        Self::new(status, Box::pin(futures::stream::iter([Ok::<Bytes, String>(body)])))
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Read the whole body.
    pub async fn into_bytes(self) -> Result<Vec<u8>, String> {
        self.body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok::<_, String>(acc)
            })
            .await
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Sends one built request. Errors are human-readable text that the
/// classifier inspects for timeout and connection markers.
pub trait Transport: Send + Sync {
    fn send<'a>(&'a self, request: &'a BuiltRequest) -> TransportFuture<'a>;
}

/// [`Transport`] over `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout: Duration,
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

impl HttpTransport {
    pub fn new() -> Result<Self, String> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    /// `timeout` bounds a whole buffered request, and each read of a
    /// streamed one.
    pub fn with_timeout(timeout: Duration) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("terminal-ai/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .read_timeout(timeout)
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self { client, timeout })
    }
}

fn describe(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        format!("request timeout: {e}")
    } else if e.is_connect() {
        format!("connection failed: {e}")
    } else if e.is_body() || e.is_decode() {
        format!("failed to read response: {e}")
    } else {
        format!("request failed: {e}")
    }
}

impl Transport for HttpTransport {
    fn send<'a>(&'a self, request: &'a BuiltRequest) -> TransportFuture<'a> {
        Box::pin(async move {
            debug!(
                "{}: POST {} ({} bytes, stream={})",
                request.provider,
                request.url,
                request.body.len(),
                request.stream
            );
            let mut builder = self.client.post(&request.url).body(request.body.clone());
            for (name, value) in &request.headers {
                builder = builder.header(*name, value);
            }
            if !request.stream {
                builder = builder.timeout(self.timeout);
            }

            let start = Instant::now();
            let resp = builder.send().await.map_err(|e| describe(&e))?;
            let status = resp.status().as_u16();
            debug!(
                "{}: HTTP {status} after {:.1}s",
                request.provider,
                start.elapsed().as_secs_f64()
            );

            let body = resp.bytes_stream().map(|chunk| chunk.map_err(|e| describe(&e)));
            Ok(TransportResponse::new(status, Box::pin(body)))
        })
    }
}
