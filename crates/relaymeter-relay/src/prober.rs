//! Synthetic channel probes driven through the adaptor contract

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use relaymeter_config::HealthConfig;
use relaymeter_core::{Channel, LogKind, UpstreamError, UsageLogEntry, unix_now};
use relaymeter_health::{ProbeReport, Prober};
use relaymeter_ledger::UsageLogRecorder;
use relaymeter_pricing::{PricingResolver, PricingSource, RateCard};
use uuid::Uuid;

use crate::adaptor::{Adaptor, DiscardSink};
use crate::registry::AdaptorRegistry;
use crate::tokens::count_prompt_tokens;
use crate::types::{ChatMessage, ChatRequest, RelayMode, RequestMeta, Usage};

/// Request sent by every probe
#[derive(Debug, Clone)]
pub struct ProbeSettings {
    /// Used when the channel lists no models
    pub model: String,
    pub prompt: String,
    pub max_tokens: u32,
}

impl ProbeSettings {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            model: config.test_model.clone(),
            prompt: config.test_prompt.clone(),
            max_tokens: config.test_max_tokens,
        }
    }
}

/// [`Prober`] that sends one small completion through the channel's adaptor
///
/// A probe that returns usage writes a test entry to the usage log with the
/// quota it would have cost; nothing is debited.
pub struct AdaptorProber {
    registry: Arc<AdaptorRegistry>,
    recorder: UsageLogRecorder,
    pricing: PricingResolver,
    settings: ProbeSettings,
}

impl AdaptorProber {
    pub const fn new(
        registry: Arc<AdaptorRegistry>,
        recorder: UsageLogRecorder,
        pricing: PricingResolver,
        settings: ProbeSettings,
    ) -> Self {
        Self {
            registry,
            recorder,
            pricing,
            settings,
        }
    }

    fn adaptor(&self, channel: &Channel) -> Result<Arc<dyn Adaptor>, UpstreamError> {
        self.registry.get(&channel.channel_type).ok_or_else(|| {
            UpstreamError::transport(format!("no adaptor for channel type '{}'", channel.channel_type))
        })
    }

    async fn run(&self, channel: &Channel, started: Instant) -> Result<(), UpstreamError> {
        let adaptor = self.adaptor(channel)?;
        let model = channel
            .models
            .first()
            .cloned()
            .unwrap_or_else(|| self.settings.model.clone());

        let mut body = ChatRequest::chat(model.clone(), vec![ChatMessage::user(self.settings.prompt.clone())]);
        body.max_tokens = Some(self.settings.max_tokens);

        let meta = RequestMeta {
            request_id: format!("probe-{}", Uuid::new_v4().simple()),
            mode: RelayMode::ChatCompletions,
            channel: channel.clone(),
            user_id: None,
            token_name: String::new(),
            actual_model: channel.map_model(&model).to_owned(),
            origin_model: model,
            is_stream: false,
            prompt_tokens: count_prompt_tokens(&body, RelayMode::ChatCompletions),
            started_at: started,
        };

        adaptor.init(&meta);
        let payload = adaptor
            .convert_request(meta.mode, &body, &meta)
            .map_err(|e| UpstreamError::transport(e.to_string()))?;
        let encoded = serde_json::to_vec(&payload).map_err(|e| UpstreamError::transport(e.to_string()))?;

        let response = adaptor.do_request(&meta, Bytes::from(encoded)).await?;
        let usage = adaptor.do_response(response, &meta, &mut DiscardSink).await?;

        self.record(&meta, adaptor.as_ref(), usage, started).await;
        Ok(())
    }

    async fn record(&self, meta: &RequestMeta, adaptor: &dyn Adaptor, usage: Usage, started: Instant) {
        if usage.prompt_tokens == 0 && usage.completion_tokens == 0 {
            return;
        }

        let source: &dyn PricingSource = adaptor;
        let price = self
            .pricing
            .resolve(&meta.actual_model, &meta.channel.pricing, Some(source));
        let rate = RateCard {
            model_ratio: price.model_ratio,
            group_ratio: 1.0,
            completion_ratio: price.completion_ratio,
        };

        let entry = UsageLogEntry {
            kind: LogKind::Test,
            request_id: meta.request_id.clone(),
            user_id: None,
            channel_id: meta.channel.id,
            token_name: String::new(),
            model_name: meta.actual_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            quota: rate.charge(usage.prompt_tokens, usage.completion_tokens, usage.tools_cost),
            elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            is_stream: false,
            created_at: unix_now(),
            content: format!("channel test, {rate}"),
        };

        // failures are logged by the recorder and never fail the probe
        let _ = self.recorder.record(entry).await;
    }
}

#[async_trait]
impl Prober for AdaptorProber {
    async fn probe(&self, channel: &Channel) -> ProbeReport {
        let started = Instant::now();
        let result = self.run(channel, started).await;
        ProbeReport {
            result,
            latency: started.elapsed(),
        }
    }

    async fn balance(&self, channel: &Channel) -> Result<Option<f64>, UpstreamError> {
        match self.registry.get(&channel.channel_type) {
            Some(adaptor) => adaptor.fetch_balance(channel).await,
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for AdaptorProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptorProber")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
