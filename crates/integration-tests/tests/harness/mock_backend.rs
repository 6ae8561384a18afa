//! Mock OpenAI-compatible backend for integration tests
//!
//! Answers chat completions with fixed usage, can be switched to reject the
//! API key or report overload, and serves a credit balance endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router, routing};
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

pub const PROMPT_TOKENS: u32 = 12;
pub const COMPLETION_TOKENS: u32 = 8;

/// How the backend answers completions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Answer,
    RejectKey,
    Overloaded,
}

struct MockState {
    behavior: Mutex<Behavior>,
    balance: Mutex<f64>,
    completions: AtomicU32,
    last_model: Mutex<Option<String>>,
}

pub struct MockBackend {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<MockState>,
}

impl MockBackend {
    pub async fn start() -> anyhow::Result<Self> {
        let state = Arc::new(MockState {
            behavior: Mutex::new(Behavior::Answer),
            balance: Mutex::new(100.0),
            completions: AtomicU32::new(0),
            last_model: Mutex::new(None),
        });

        let app = Router::new()
            .route("/v1/chat/completions", routing::post(chat_completions))
            .route("/v1/dashboard/billing/credit_grants", routing::get(credit_grants))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shutdown_clone = shutdown.clone();

        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    shutdown_clone.cancelled().await;
                })
                .await
                .ok();
        });

        Ok(Self { addr, shutdown, state })
    }

    /// Base URL including `/v1`
    pub fn base_url(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn set_balance(&self, balance: f64) {
        *self.state.balance.lock().unwrap() = balance;
    }

    pub fn completion_count(&self) -> u32 {
        self.state.completions.load(Ordering::Relaxed)
    }

    /// Model named in the most recent completion request
    pub fn last_model(&self) -> Option<String> {
        self.state.last_model.lock().unwrap().clone()
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn chat_completions(State(state): State<Arc<MockState>>, Json(request): Json<Value>) -> Response {
    state.completions.fetch_add(1, Ordering::Relaxed);
    let model = request["model"].as_str().unwrap_or("unknown").to_owned();
    *state.last_model.lock().unwrap() = Some(model.clone());

    let behavior = *state.behavior.lock().unwrap();
    match behavior {
        Behavior::RejectKey => (
            StatusCode::UNAUTHORIZED,
            Json(json!({
                "error": {
                    "message": "Incorrect API key provided",
                    "type": "invalid_request_error",
                    "code": "invalid_api_key"
                }
            })),
        )
            .into_response(),
        Behavior::Overloaded => (StatusCode::SERVICE_UNAVAILABLE, "upstream overloaded").into_response(),
        Behavior::Answer if request["stream"].as_bool().unwrap_or(false) => stream_answer(&model),
        Behavior::Answer => Json(json!({
            "id": "chatcmpl-mock",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "Hello there"},
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": PROMPT_TOKENS,
                "completion_tokens": COMPLETION_TOKENS,
                "total_tokens": PROMPT_TOKENS + COMPLETION_TOKENS
            }
        }))
        .into_response(),
    }
}

fn stream_answer(model: &str) -> Response {
    let chunks = [
        json!({"model": model, "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hello"}}]}),
        json!({"model": model, "choices": [{"index": 0, "delta": {"content": " there"}}]}),
        json!({
            "model": model,
            "choices": [],
            "usage": {"prompt_tokens": PROMPT_TOKENS, "completion_tokens": COMPLETION_TOKENS}
        }),
    ];

    let mut body: String = chunks.iter().map(|chunk| format!("data: {chunk}\n\n")).collect();
    body.push_str("data: [DONE]\n\n");

    ([(header::CONTENT_TYPE, "text/event-stream")], body).into_response()
}

async fn credit_grants(State(state): State<Arc<MockState>>) -> Json<Value> {
    let balance = *state.balance.lock().unwrap();
    Json(json!({ "object": "credit_summary", "total_available": balance }))
}
