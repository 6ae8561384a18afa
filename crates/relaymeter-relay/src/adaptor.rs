//! Backend adaptor contract
//!
//! An adaptor translates the normalized request for one backend family,
//! performs the network call and parses usage out of the response. The
//! pipeline only ever talks to `dyn Adaptor`.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use relaymeter_core::{Channel, UpstreamError};
use relaymeter_pricing::PricingSource;
use serde_json::Value;

use crate::error::AdaptorError;
use crate::types::{ChatRequest, RelayMode, RequestMeta, Usage};

/// Response body as it arrives from the backend
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>;

/// Successful backend response, body not yet consumed
pub struct RawResponse {
    pub status: u16,
    pub body: ByteStream,
}

impl RawResponse {
    /// Response with a body that is already in memory
    pub fn from_bytes(status: u16, body: impl Into<Bytes>) -> Self {
        let body = body.into();
        Self {
            status,
            body: Box::pin(futures_util::stream::once(async move { Ok(body) })),
        }
    }

    /// Read the whole body
    pub async fn collect(self) -> Result<Bytes, UpstreamError> {
        let mut body = Vec::new();
        let mut stream = self.body;
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk?);
        }
        Ok(Bytes::from(body))
    }
}

impl std::fmt::Debug for RawResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Destination of response bytes bound for the caller
#[async_trait]
pub trait ResponseSink: Send {
    /// Forward one chunk; `false` once the caller has gone away
    async fn send(&mut self, chunk: Bytes) -> bool;
}

/// Keeps every chunk in memory
#[derive(Debug, Default)]
pub struct BufferedSink {
    chunks: Vec<Bytes>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// All chunks joined
    pub fn to_bytes(&self) -> Bytes {
        Bytes::from(self.chunks.concat())
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    async fn send(&mut self, chunk: Bytes) -> bool {
        self.chunks.push(chunk);
        true
    }
}

/// Drops everything; used for probes
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

#[async_trait]
impl ResponseSink for DiscardSink {
    async fn send(&mut self, _chunk: Bytes) -> bool {
        true
    }
}

#[async_trait]
impl ResponseSink for tokio::sync::mpsc::Sender<Bytes> {
    async fn send(&mut self, chunk: Bytes) -> bool {
        tokio::sync::mpsc::Sender::send(self, chunk).await.is_ok()
    }
}

/// Capability contract of one backend family
#[async_trait]
pub trait Adaptor: PricingSource {
    /// Registry name, e.g. `openai`
    fn name(&self) -> &'static str;

    /// Prepare for one request
    fn init(&self, meta: &RequestMeta) {
        tracing::trace!(adaptor = self.name(), request_id = %meta.request_id, "adaptor initialised");
    }

    /// Translate the normalized request into the backend payload
    fn convert_request(&self, mode: RelayMode, request: &ChatRequest, meta: &RequestMeta) -> Result<Value, AdaptorError>;

    /// Send the payload; non-success statuses are returned as errors
    async fn do_request(&self, meta: &RequestMeta, body: Bytes) -> Result<RawResponse, UpstreamError>;

    /// Forward the response to `sink` and extract usage
    async fn do_response(
        &self,
        response: RawResponse,
        meta: &RequestMeta,
        sink: &mut dyn ResponseSink,
    ) -> Result<Usage, UpstreamError>;

    /// Provider account balance, `None` when the backend cannot report one
    async fn fetch_balance(&self, _channel: &Channel) -> Result<Option<f64>, UpstreamError> {
        Ok(None)
    }
}
