//! OpenAI-compatible adaptor
//!
//! Serves any backend speaking the `/v1/chat/completions` protocol. Streaming
//! responses are re-emitted as SSE `data:` lines while usage is collected;
//! when the backend reports no usage the completion is counted locally.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use eventsource_stream::Eventsource;
use futures_util::StreamExt;
use http::header::CONTENT_TYPE;
use relaymeter_core::{Channel, UpstreamError};
use relaymeter_pricing::{ModelPrice, PricingSource};
use reqwest::Client;
use secrecy::ExposeSecret;
use serde::Deserialize;
use serde_json::{Value, json};

use crate::adaptor::{Adaptor, RawResponse, ResponseSink};
use crate::error::AdaptorError;
use crate::tokens::count_text_tokens;
use crate::types::{ChatRequest, RelayMode, RequestMeta, Usage};

/// Default `OpenAI` API base URL
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Model ratio and completion ratio; ratio 1 is $0.002 per 1K prompt tokens
const DEFAULT_PRICING: &[(&str, f64, f64)] = &[
    ("gpt-4o", 1.25, 4.0),
    ("gpt-4o-mini", 0.075, 4.0),
    ("gpt-4.1", 1.0, 4.0),
    ("gpt-4.1-mini", 0.2, 4.0),
    ("gpt-4.1-nano", 0.05, 4.0),
    ("gpt-3.5-turbo", 0.25, 3.0),
    ("o3-mini", 0.55, 4.0),
    ("text-embedding-3-small", 0.01, 1.0),
];

#[derive(Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

#[derive(Deserialize)]
struct WireText {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct WireChoice {
    #[serde(default)]
    message: Option<WireText>,
    #[serde(default)]
    delta: Option<WireText>,
    /// Legacy completions
    #[serde(default)]
    text: Option<String>,
}

impl WireChoice {
    fn text(&self) -> Option<&str> {
        self.message
            .as_ref()
            .or(self.delta.as_ref())
            .and_then(|t| t.content.as_deref())
            .or(self.text.as_deref())
    }
}

#[derive(Deserialize)]
struct WireBody {
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct WireCreditGrants {
    total_available: f64,
}

/// OpenAI-compatible adaptor
pub struct OpenAiAdaptor {
    client: Client,
    pricing: HashMap<String, ModelPrice>,
}

impl OpenAiAdaptor {
    pub fn new(client: Client) -> Self {
        let pricing = DEFAULT_PRICING
            .iter()
            .map(|&(model, ratio, completion)| (model.to_owned(), ModelPrice::new(ratio, completion)))
            .collect();
        Self { client, pricing }
    }

    fn base_url(channel: &Channel) -> &str {
        channel
            .base_url
            .as_deref()
            .filter(|url| !url.is_empty())
            .unwrap_or(DEFAULT_BASE_URL)
            .trim_end_matches('/')
    }

    fn request_url(meta: &RequestMeta) -> String {
        let path = match meta.mode {
            RelayMode::ChatCompletions => "chat/completions",
            RelayMode::Completions => "completions",
        };
        format!("{}/{path}", Self::base_url(&meta.channel))
    }

    fn with_auth(builder: reqwest::RequestBuilder, channel: &Channel) -> reqwest::RequestBuilder {
        match &channel.api_key {
            Some(key) => builder.bearer_auth(key.expose_secret()),
            None => builder,
        }
    }

    async fn stream_response(
        response: RawResponse,
        meta: &RequestMeta,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage, UpstreamError> {
        let mut events = response.body.eventsource();
        let mut completion = String::new();
        let mut reported = None;
        let mut connected = true;

        while let Some(event) = events.next().await {
            let event = event.map_err(|e| UpstreamError::transport(format!("stream interrupted: {e}")))?;
            let data = event.data.trim();
            if data == "[DONE]" {
                break;
            }

            match serde_json::from_str::<WireBody>(data) {
                Ok(chunk) => {
                    if chunk.usage.is_some() {
                        reported = chunk.usage;
                    }
                    for choice in &chunk.choices {
                        if let Some(text) = choice.text() {
                            completion.push_str(text);
                        }
                    }
                }
                Err(e) => tracing::debug!(request_id = %meta.request_id, error = %e, "skipping unparsable stream chunk"),
            }

            if connected && !sink.send(Bytes::from(format!("data: {data}\n\n"))).await {
                connected = false;
                tracing::debug!(request_id = %meta.request_id, "client disconnected, draining upstream stream");
            }
        }

        if connected {
            sink.send(Bytes::from_static(b"data: [DONE]\n\n")).await;
        }

        Ok(usage_or_count(reported, &completion, meta))
    }

    async fn buffered_response(
        response: RawResponse,
        meta: &RequestMeta,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage, UpstreamError> {
        let status = response.status;
        let body = response.collect().await?;

        let parsed: WireBody = serde_json::from_slice(&body)
            .map_err(|e| UpstreamError::transport(format!("failed to parse response: {e}")))?;
        if parsed.error.is_some() {
            return Err(UpstreamError::from_response(status, &body));
        }

        let completion: String = parsed.choices.iter().filter_map(WireChoice::text).collect();
        let usage = usage_or_count(parsed.usage, &completion, meta);
        sink.send(body).await;
        Ok(usage)
    }
}

/// Backend-reported usage, or a local count when the backend sent none
fn usage_or_count(reported: Option<WireUsage>, completion: &str, meta: &RequestMeta) -> Usage {
    match reported {
        Some(usage) if usage.prompt_tokens > 0 || usage.completion_tokens > 0 => Usage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            tools_cost: 0,
        },
        _ => Usage {
            prompt_tokens: meta.prompt_tokens,
            completion_tokens: count_text_tokens(completion),
            tools_cost: 0,
        },
    }
}

impl PricingSource for OpenAiAdaptor {
    fn default_model_pricing(&self) -> HashMap<String, ModelPrice> {
        self.pricing.clone()
    }

    fn model_ratio(&self, model: &str) -> Option<f64> {
        self.pricing.get(model).map(|price| price.model_ratio)
    }

    fn completion_ratio(&self, model: &str) -> Option<f64> {
        self.pricing.get(model).map(|price| price.completion_ratio)
    }
}

#[async_trait]
impl Adaptor for OpenAiAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn convert_request(&self, mode: RelayMode, request: &ChatRequest, meta: &RequestMeta) -> Result<Value, AdaptorError> {
        match mode {
            RelayMode::ChatCompletions if request.messages.is_empty() => {
                return Err(AdaptorError::InvalidRequest("messages must not be empty".to_owned()));
            }
            RelayMode::Completions if request.prompt.is_none() => {
                return Err(AdaptorError::InvalidRequest("prompt is required".to_owned()));
            }
            _ => {}
        }

        let mut payload = serde_json::to_value(request)?;
        let Some(object) = payload.as_object_mut() else {
            return Err(AdaptorError::InvalidRequest("request must be a JSON object".to_owned()));
        };
        object.insert("model".to_owned(), Value::String(meta.actual_model.clone()));
        if meta.is_stream {
            object.insert("stream_options".to_owned(), json!({ "include_usage": true }));
        }

        Ok(payload)
    }

    async fn do_request(&self, meta: &RequestMeta, body: Bytes) -> Result<RawResponse, UpstreamError> {
        let builder = self
            .client
            .post(Self::request_url(meta))
            .header(CONTENT_TYPE, "application/json")
            .body(body);

        let response = Self::with_auth(builder, &meta.channel).send().await.map_err(|e| {
            tracing::warn!(channel_id = %meta.channel.id, error = %e, "upstream request failed");
            UpstreamError::transport(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.bytes().await.unwrap_or_default();
            tracing::warn!(channel_id = %meta.channel.id, status = %status, "upstream returned error");
            return Err(UpstreamError::from_response(status.as_u16(), &body));
        }

        Ok(RawResponse {
            status: status.as_u16(),
            body: Box::pin(
                response
                    .bytes_stream()
                    .map(|chunk| chunk.map_err(|e| UpstreamError::transport(e.to_string()))),
            ),
        })
    }

    async fn do_response(
        &self,
        response: RawResponse,
        meta: &RequestMeta,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage, UpstreamError> {
        if meta.is_stream {
            Self::stream_response(response, meta, sink).await
        } else {
            Self::buffered_response(response, meta, sink).await
        }
    }

    async fn fetch_balance(&self, channel: &Channel) -> Result<Option<f64>, UpstreamError> {
        let url = format!("{}/dashboard/billing/credit_grants", Self::base_url(channel));
        let response = Self::with_auth(self.client.get(url), channel)
            .send()
            .await
            .map_err(|e| UpstreamError::transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::transport(e.to_string()))?;
        if !status.is_success() {
            return Err(UpstreamError::from_response(status.as_u16(), &body));
        }

        let grants: WireCreditGrants = serde_json::from_slice(&body)
            .map_err(|e| UpstreamError::transport(format!("failed to parse balance: {e}")))?;
        Ok(Some(grants.total_available))
    }
}

impl std::fmt::Debug for OpenAiAdaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiAdaptor")
            .field("models", &self.pricing.len())
            .finish_non_exhaustive()
    }
}
