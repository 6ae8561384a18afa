//! Normalized request shapes shared by the pipeline and adaptors

use std::time::Instant;

use relaymeter_core::{Channel, Quota, UserId};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Endpoint family of a relayed request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
}

impl RelayMode {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ChatCompletions => "chat_completions",
            Self::Completions => "completions",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// Plain string or an array of content parts
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_owned(),
            content: Value::String(text.into()),
            name: None,
        }
    }

    /// Concatenated text of the message, ignoring non-text parts
    pub fn text(&self) -> String {
        text_of(&self.content)
    }
}

/// OpenAI-style request body as received from the caller
///
/// Unknown fields are kept in `extra` and forwarded untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<ChatMessage>,
    /// Prompt of a legacy completions request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl ChatRequest {
    pub fn chat(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            prompt: None,
            stream: false,
            max_tokens: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Text of the legacy `prompt` field
    pub fn prompt_text(&self) -> String {
        self.prompt.as_ref().map(text_of).unwrap_or_default()
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part {
                Value::String(text) => Some(text.as_str()),
                Value::Object(object) => object.get("text").and_then(Value::as_str),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Token usage parsed from a backend response
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Flat quota for tool invocations billed by the backend
    pub tools_cost: Quota,
}

/// Per-request context handed to the adaptor
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub mode: RelayMode,
    pub channel: Channel,
    /// `None` for synthetic probe traffic
    pub user_id: Option<UserId>,
    pub token_name: String,
    /// Model name the caller asked for
    pub origin_model: String,
    /// Model name after channel mapping
    pub actual_model: String,
    pub is_stream: bool,
    /// Locally counted prompt tokens
    pub prompt_tokens: u32,
    pub started_at: Instant,
}
