//! Integration tests for dispatch over real HTTP.
//!
//! Each fake provider is an axum server on a random port that replays a
//! scripted list of responses and records what it received.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use terminal_ai::prelude::*;
use terminal_ai::registry::ByokState;

#[derive(Clone)]
struct Scripted {
    status: u16,
    content_type: &'static str,
    body: String,
}

fn json(status: u16, body: &str) -> Scripted {
    Scripted {
        status,
        content_type: "application/json",
        body: body.to_string(),
    }
}

fn sse(events: &[&str]) -> Scripted {
    let body = events.iter().map(|e| format!("data: {e}\n\n")).collect();
    Scripted {
        status: 200,
        content_type: "text/event-stream",
        body,
    }
}

struct Received {
    headers: HeaderMap,
    body: serde_json::Value,
}

#[derive(Default)]
struct FakeState {
    script: Mutex<Vec<Scripted>>,
    received: Mutex<Vec<Received>>,
}

/// Replays the script in order; the last response repeats.
async fn completions(
    State(state): State<Arc<FakeState>>,
    headers: HeaderMap,
    body: String,
) -> impl IntoResponse {
    let body = serde_json::from_str(&body).unwrap_or(serde_json::Value::Null);
    state.received.lock().unwrap().push(Received { headers, body });

    let reply = {
        let mut script = state.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    };
    (
        StatusCode::from_u16(reply.status).unwrap(),
        [(header::CONTENT_TYPE, reply.content_type)],
        reply.body,
    )
}

struct FakeProvider {
    addr: SocketAddr,
    state: Arc<FakeState>,
}

impl FakeProvider {
    async fn spawn(script: Vec<Scripted>) -> Self {
        let state = Arc::new(FakeState {
            script: Mutex::new(script),
            ..Default::default()
        });
        let app = Router::new()
            .route("/v1/chat/completions", post(completions))
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    fn url(&self) -> String {
        format!("http://{}/v1/chat/completions", self.addr)
    }

    fn calls(&self) -> usize {
        self.state.received.lock().unwrap().len()
    }

    fn header(&self, call: usize, name: &str) -> Option<String> {
        self.state.received.lock().unwrap()[call]
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    fn body(&self, call: usize) -> serde_json::Value {
        self.state.received.lock().unwrap()[call].body.clone()
    }
}

fn provider(name: &str, url: &str, key: &str) -> ProviderIdentity {
    ProviderIdentity::new(name, url, format!("{name}-model"), key)
}

fn user(text: &str) -> ChatRequest {
    ChatRequest::new(vec![Message::user(text)])
}

const OK_REPLY: &str = r#"{"choices":[{"message":{"role":"assistant","content":"hi there"},"finish_reason":"stop"}]}"#;
const RATE_LIMITED: &str = r#"{"error":{"message":"Rate limit exceeded","code":429}}"#;

// ── Buffered ─────────────────────────────────────────────────────────

#[tokio::test]
async fn buffered_reply_with_bearer_auth() {
    let groq = FakeProvider::spawn(vec![json(200, OK_REPLY)]).await;
    let registry = ProviderRegistry::new()
        .with_provider(provider("groq", &groq.url(), "gk-123"), ProviderPolicy::default());
    let transport = HttpTransport::new().unwrap();

    let completion = Dispatcher::new(&registry, &transport)
        .dispatch(&user("hello"), &DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(completion.provider, "groq");
    assert_eq!(completion.content(), Some("hi there"));
    assert_eq!(groq.calls(), 1);
    assert_eq!(groq.header(0, "authorization").as_deref(), Some("Bearer gk-123"));
    assert!(groq.header(0, "content-type").unwrap().starts_with("application/json"));

    let body = groq.body(0);
    assert_eq!(body["model"], "groq-model");
    assert_eq!(body["messages"][0]["role"], "user");
    assert_eq!(body["messages"][0]["content"], "hello");
    assert!(body.get("stream").is_none());
    assert!(body.get("provider").is_none());
}

#[tokio::test]
async fn rate_limited_aggregator_falls_back_to_gemini() {
    let openrouter = FakeProvider::spawn(vec![json(429, RATE_LIMITED)]).await;
    let gemini = FakeProvider::spawn(vec![json(200, OK_REPLY)]).await;
    let registry = ProviderRegistry::new()
        .with_provider(
            provider("openrouter", &openrouter.url(), "or-key"),
            ProviderPolicy::with_priority(1).max_retries(1),
        )
        .with_provider(
            provider("gemini", &gemini.url(), "gm-key"),
            ProviderPolicy::with_priority(2),
        );
    let transport = HttpTransport::new().unwrap();

    let completion = Dispatcher::new(&registry, &transport)
        .with_retry_policy(RetryPolicy::immediate())
        .dispatch(&user("hello"), &DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(completion.provider, "gemini");
    assert_eq!(openrouter.calls(), 2);
    assert_eq!(gemini.calls(), 1);
    assert_eq!(completion.report.attempts_on("openrouter"), 2);
    assert!(
        completion.report.attempts[..2]
            .iter()
            .all(|a| a.category == Some(FailureCategory::RateLimit))
    );

    assert_eq!(openrouter.header(0, "authorization").as_deref(), Some("Bearer or-key"));
    assert!(openrouter.header(0, "http-referer").is_some());
    assert!(openrouter.header(0, "x-title").is_some());
    assert_eq!(gemini.header(0, "x-goog-api-key").as_deref(), Some("gm-key"));
    assert!(gemini.header(0, "authorization").is_none());
}

#[tokio::test]
async fn plain_text_server_error_is_retried_then_exhausted() {
    let flaky = FakeProvider::spawn(vec![Scripted {
        status: 502,
        content_type: "text/plain",
        body: "bad gateway".to_string(),
    }])
    .await;
    let registry = ProviderRegistry::new().with_provider(
        provider("groq", &flaky.url(), "k"),
        ProviderPolicy::default().max_retries(1),
    );
    let transport = HttpTransport::new().unwrap();

    let err = Dispatcher::new(&registry, &transport)
        .with_retry_policy(RetryPolicy::immediate())
        .dispatch(&user("hello"), &DispatchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(flaky.calls(), 2);
    match err {
        DispatchError::Exhausted {
            provider,
            category,
            message,
            report,
        } => {
            assert_eq!(provider, "groq");
            assert_eq!(category, FailureCategory::ServerError);
            assert!(message.contains("502"), "{message}");
            assert_eq!(report.attempts.len(), 2);
            assert!(report.attempts.iter().all(|a| !a.succeeded));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn refused_connection_is_a_network_failure() {
    let addr = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    };
    let url = format!("http://{addr}/v1/chat/completions");
    let registry = ProviderRegistry::new().with_provider(
        provider("groq", &url, "k"),
        ProviderPolicy::default().max_retries(0),
    );
    let transport = HttpTransport::new().unwrap();

    let err = Dispatcher::new(&registry, &transport)
        .dispatch(&user("hello"), &DispatchOptions::default())
        .await
        .unwrap_err();

    assert_eq!(err.category(), Some(FailureCategory::Network));
}

// ── BYOK ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn byok_route_is_sent_to_the_aggregator() {
    let openrouter = FakeProvider::spawn(vec![json(200, OK_REPLY)]).await;
    let route = ByokRoute {
        order: vec!["Cerebras".to_string(), "Groq".to_string()],
        allow_fallback_to_shared: false,
        ..Default::default()
    };
    let registry = ProviderRegistry::new().with_provider(
        provider("openrouter", &openrouter.url(), "or-key"),
        ProviderPolicy::default().byok(ByokState::Enabled(route)),
    );
    let transport = HttpTransport::new().unwrap();

    Dispatcher::new(&registry, &transport)
        .dispatch(&user("hello"), &DispatchOptions::default())
        .await
        .unwrap();

    let body = openrouter.body(0);
    assert_eq!(body["provider"]["order"], serde_json::json!(["Cerebras", "Groq"]));
    assert_eq!(body["provider"]["allow_fallbacks"], false);
}

// ── Streaming ────────────────────────────────────────────────────────

fn delta(text: &str) -> String {
    serde_json::json!({"choices": [{"delta": {"content": text}}]}).to_string()
}

#[tokio::test]
async fn streamed_fragments_arrive_in_order() {
    let (a, b, c) = (delta("Hel"), delta("lo, "), delta("world"));
    let groq = FakeProvider::spawn(vec![sse(&[&a, &b, &c, "[DONE]"])]).await;
    let registry = ProviderRegistry::new()
        .with_provider(provider("groq", &groq.url(), "k"), ProviderPolicy::default());
    let transport = HttpTransport::new().unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler = FnEventHandler::new(move |event| {
        if let DispatchEvent::TextDelta(text) = event {
            sink.lock().unwrap().push(text.to_string());
        }
    });

    let reply = Dispatcher::new(&registry, &transport)
        .with_event_handler(&handler)
        .dispatch_stream(&user("hello").with_stream(true), &DispatchOptions::default())
        .await
        .unwrap();

    assert_eq!(reply.text(), "Hello, world");
    assert_eq!(*seen.lock().unwrap(), ["Hel", "lo, ", "world"]);
    assert!(reply.outcome.saw_sentinel);
    assert_eq!(groq.header(0, "accept").as_deref(), Some("text/event-stream"));
    assert_eq!(groq.body(0)["stream"], true);
}

#[tokio::test]
async fn error_inside_stream_is_terminal() {
    let error = r#"{"error":{"message":"upstream overloaded"}}"#;
    let first = delta("partial");
    let groq = FakeProvider::spawn(vec![sse(&[&first, error])]).await;
    let gemini = FakeProvider::spawn(vec![json(200, OK_REPLY)]).await;
    let registry = ProviderRegistry::new()
        .with_provider(provider("groq", &groq.url(), "k"), ProviderPolicy::with_priority(1))
        .with_provider(provider("gemini", &gemini.url(), "k"), ProviderPolicy::with_priority(2));
    let transport = HttpTransport::new().unwrap();

    let err = Dispatcher::new(&registry, &transport)
        .with_retry_policy(RetryPolicy::immediate())
        .dispatch_stream(&user("hello").with_stream(true), &DispatchOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Stream { ref provider, .. } if provider == "groq"));
    assert_eq!(groq.calls(), 1);
    assert_eq!(gemini.calls(), 0);
}
