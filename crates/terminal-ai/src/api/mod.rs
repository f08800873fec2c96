//! Provider interaction layer: everything between a [`ChatRequest`](crate::ChatRequest)
//! and a reply.
//!
//! - [`request`] serializes payloads and picks auth headers per provider,
//!   including the ordered-upstream shape used for BYOK routing.
//! - [`transport`] is the [`Transport`] seam and its `reqwest` implementation.
//! - [`response`] decodes buffered JSON envelopes.
//! - [`streaming`] decodes Server-Sent Events incrementally.
//! - [`retry`] classifies failed attempts and holds the fixed retry delay.
//! - [`dispatch`] runs the retry and fallback loop over all of the above.

pub mod dispatch;
pub mod request;
pub mod response;
pub mod retry;
pub mod streaming;
pub mod transport;

pub use dispatch::{
    AttemptOutcome, Completion, DispatchOptions, DispatchReport, Dispatcher, Reply, StreamedReply,
};
pub use retry::{RetryPolicy, classify};
pub use transport::{HttpTransport, Transport};
