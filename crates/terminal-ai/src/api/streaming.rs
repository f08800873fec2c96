//! Server-Sent Events decoding for streamed chat completions.
//!
//! A response body arrives as arbitrarily split byte chunks. [`LineDecoder`]
//! reassembles complete lines, [`decode_line`] turns one line into a
//! [`LineEvent`], and [`event_stream`] lazily chains the two over a body
//! stream. [`fold_events`] consumes the result, forwarding each text
//! fragment and accumulating the full reply.
//!
//! The stream ends at the `[DONE]` sentinel or at end of input; both are a
//! normal finish. A data line carrying an error record ends it with that
//! error.

use super::response::ApiError;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// The literal end-of-stream marker.
pub const SENTINEL: &str = "[DONE]";

/// One decoded stream event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A non-empty text fragment.
    Delta(String),
    /// An error record; nothing after it is read.
    Error(ApiError),
    /// The sentinel was seen.
    Done,
}

/// The result of decoding a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum LineEvent {
    /// Blank, comment, non-data, empty-delta or unparseable line.
    Skip,
    Event(StreamEvent),
}

#[derive(Deserialize, Debug, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<ApiError>,
}

#[derive(Deserialize, Debug, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Decode one complete line (without its terminator).
pub fn decode_line(line: &str) -> LineEvent {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        if !line.is_empty() {
            trace!("Ignoring non-data line: {line}");
        }
        return LineEvent::Skip;
    };
    let data = data.trim_start();
    if data == SENTINEL {
        return LineEvent::Event(StreamEvent::Done);
    }
    if data.is_empty() {
        return LineEvent::Skip;
    }

    let chunk = match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse SSE chunk: {e}");
            trace!("Unparseable SSE data: {data}");
            return LineEvent::Skip;
        }
    };
    if let Some(error) = chunk.error {
        return LineEvent::Event(StreamEvent::Error(error));
    }
    match chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
    {
        Some(text) if !text.is_empty() => LineEvent::Event(StreamEvent::Delta(text)),
        _ => LineEvent::Skip,
    }
}

/// Reassembles `\n`-terminated lines across chunk boundaries.
///
/// Works on bytes so a multi-byte character split between chunks is only
/// decoded once the whole line has arrived.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            lines.push(Self::to_text(&line));
        }
        lines
    }

    /// The unterminated tail left at end of input, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.buffer.is_empty() {
            return None;
        }
        let tail = std::mem::take(&mut self.buffer);
        Some(Self::to_text(&tail))
    }

    fn to_text(line: &[u8]) -> String {
        let text = String::from_utf8_lossy(line);
        text.trim_end_matches(['\n', '\r']).to_string()
    }
}

struct DecodeState<S> {
    body: S,
    lines: LineDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Lazily decode a body stream into [`StreamEvent`]s.
///
/// The sequence is finite and not restartable. It ends after
/// [`StreamEvent::Done`], after [`StreamEvent::Error`], after a body read
/// error (yielded as `Err`), or at end of input.
pub fn event_stream<S>(body: S) -> impl Stream<Item = Result<StreamEvent, String>>
where
    S: Stream<Item = Result<Bytes, String>> + Unpin,
{
    let state = DecodeState {
        body,
        lines: LineDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures::stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            while let Some(line) = state.pending.pop_front() {
                if let LineEvent::Event(event) = decode_line(&line) {
                    if matches!(event, StreamEvent::Done | StreamEvent::Error(_)) {
                        state.finished = true;
                    }
                    return Some((Ok(event), state));
                }
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    trace!("SSE chunk: {} bytes", chunk.len());
                    let lines = state.lines.push(&chunk);
                    state.pending.extend(lines);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((Err(e), state));
                }
                None => match state.lines.finish() {
                    Some(tail) => state.pending.push_back(tail),
                    None => return None,
                },
            }
        }
    })
}

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOutcome {
    /// Every fragment, concatenated in arrival order.
    pub text: String,
    pub fragments: usize,
    /// `false` when the body ended without the sentinel.
    pub saw_sentinel: bool,
}

/// Why a stream stopped early. Fragments already forwarded stay forwarded.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFailure {
    /// The provider sent an error record.
    Envelope(ApiError),
    /// Reading the body failed.
    Transport(String),
    Cancelled,
}

impl std::fmt::Display for StreamFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamFailure::Envelope(error) if error.is_empty() => match error.code() {
                Some(code) => write!(f, "error record without a message (code {code})"),
                None => f.write_str("error record without a message"),
            },
            StreamFailure::Envelope(error) => write!(f, "{error}"),
            StreamFailure::Transport(message) => write!(f, "{message}"),
            StreamFailure::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// Drain `events`, calling `on_delta` for every fragment.
///
/// Cancellation stops the next read and drops `events`, releasing the
/// underlying connection.
pub async fn fold_events<E>(
    events: E,
    cancel: &CancellationToken,
    mut on_delta: impl FnMut(&str),
) -> Result<StreamOutcome, StreamFailure>
where
    E: Stream<Item = Result<StreamEvent, String>>,
{
    let mut events = std::pin::pin!(events);
    let mut outcome = StreamOutcome {
        text: String::new(),
        fragments: 0,
        saw_sentinel: false,
    };
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StreamFailure::Cancelled),
            next = events.next() => next,
        };
        match next {
            Some(Ok(StreamEvent::Delta(text))) => {
                on_delta(&text);
                outcome.text.push_str(&text);
                outcome.fragments += 1;
            }
            Some(Ok(StreamEvent::Done)) => {
                outcome.saw_sentinel = true;
                break;
            }
            Some(Ok(StreamEvent::Error(error))) => return Err(StreamFailure::Envelope(error)),
            Some(Err(e)) => return Err(StreamFailure::Transport(e)),
            None => {
                debug!("Stream ended without sentinel");
                break;
            }
        }
    }
    debug!(
        "Stream completed: {} fragment(s), {} chars",
        outcome.fragments,
        outcome.text.len()
    );
    Ok(outcome)
}
