//! Per-request orchestration
//!
//! Reservation and pricing failures stop the request before any network
//! call. Once quota is reserved, every failure refunds it before the error
//! is returned. After a usable response the commit runs on the ledger's
//! task pool with its own deadline, detached from the caller.
//!
//! A caller that drops the relay future after the reservation still gets it
//! refunded: the reservation is held by a `ReservationGuard` until the
//! commit or refund has been handed to the task pool.

use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use relaymeter_config::{LedgerConfig, parse_duration};
use relaymeter_core::{Channel, ChannelId, ChannelStatus, Quota, TokenId, UpstreamError};
use relaymeter_health::{HealthMonitor, Observation, Source};
use relaymeter_ledger::{Commit, Ledger, Reservation, StoreError};
use relaymeter_pricing::{GroupRatios, PricingResolver, PricingSource, RateCard, estimate_reservation};
use relaymeter_telemetry::{Counter, Histogram, KeyValue, metrics};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::adaptor::{Adaptor, ResponseSink};
use crate::error::{AdaptorError, RelayError};
use crate::registry::AdaptorRegistry;
use crate::tokens::count_prompt_tokens;
use crate::types::{ChatRequest, RelayMode, RequestMeta, Usage};

#[derive(Debug, Clone)]
pub struct RelayOptions {
    /// Deadline of the detached billing commit
    pub billing_timeout: Duration,
    /// Tokens added to every reservation estimate
    pub pre_consumed_tokens: u32,
}

impl Default for RelayOptions {
    fn default() -> Self {
        Self {
            billing_timeout: Duration::from_secs(30),
            pre_consumed_tokens: 500,
        }
    }
}

impl RelayOptions {
    pub fn from_config(config: &LedgerConfig) -> Result<Self, RelayError> {
        Ok(Self {
            billing_timeout: parse_duration(&config.billing_timeout)
                .map_err(|e| RelayError::Config(format!("ledger.billing_timeout: {e}")))?,
            pre_consumed_tokens: config.pre_consumed_tokens,
        })
    }
}

/// One authenticated request routed to a channel
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub token_id: TokenId,
    pub channel_id: ChannelId,
    pub mode: RelayMode,
    pub body: ChatRequest,
    /// Generated when absent
    pub request_id: Option<String>,
}

/// Result of a relayed request whose response reached the sink
#[derive(Debug)]
pub struct RelayOutcome {
    pub request_id: String,
    pub usage: Usage,
    /// Quota the commit will charge
    pub quota: Quota,
    /// Detached billing commit; `None` output when the pool dropped it
    pub billing: JoinHandle<Option<()>>,
}

struct RelayMetrics {
    requests: Counter<u64>,
    duration: Histogram<f64>,
    tokens: Counter<u64>,
    billing_timeouts: Counter<u64>,
}

impl RelayMetrics {
    fn new() -> Self {
        let meter = metrics::meter();
        Self {
            requests: meter
                .u64_counter(metrics::RELAY_REQUEST_COUNT)
                .with_description("Relayed requests")
                .build(),
            duration: meter
                .f64_histogram(metrics::RELAY_REQUEST_DURATION)
                .with_unit("s")
                .with_description("Relayed request duration")
                .build(),
            tokens: meter
                .u64_counter(metrics::RELAY_TOKEN_USAGE)
                .with_description("Tokens reported by backends")
                .build(),
            billing_timeouts: meter
                .u64_counter(metrics::BILLING_TIMEOUT_COUNT)
                .with_description("Billing commits abandoned after their deadline")
                .build(),
        }
    }
}

/// Holds a reservation until its settlement is submitted
///
/// Dropping an armed guard submits a refund to the ledger's task pool.
struct ReservationGuard {
    ledger: Arc<Ledger>,
    reservation: Option<Reservation>,
    deadline: Duration,
}

impl ReservationGuard {
    fn arm(ledger: &Arc<Ledger>, reservation: Reservation, deadline: Duration) -> Self {
        Self {
            ledger: Arc::clone(ledger),
            reservation: Some(reservation),
            deadline,
        }
    }

    /// Called once the commit or refund has been submitted
    fn disarm(mut self) {
        self.reservation = None;
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::error!(
                reservation = %reservation.id,
                amount = reservation.amount,
                "reservation dropped outside a runtime, quota stays reserved"
            );
            return;
        }

        tracing::warn!(
            reservation = %reservation.id,
            amount = reservation.amount,
            "request dropped before settlement, refunding reservation"
        );
        spawn_refund(&self.ledger, reservation, self.deadline);
    }
}

fn spawn_refund(ledger: &Arc<Ledger>, reservation: Reservation, deadline: Duration) -> JoinHandle<Option<()>> {
    let task_ledger = Arc::clone(ledger);
    ledger
        .tasks()
        .spawn_with_deadline("reservation_refund", deadline, async move {
            if let Err(e) = task_ledger.refund(&reservation).await {
                tracing::error!(reservation = %reservation.id, error = %e, "failed to refund reservation");
            }
        })
}

/// Why a dispatch produced no usable response
enum DispatchFailure {
    Convert(AdaptorError),
    Upstream { error: UpstreamError, latency: Duration },
}

/// Shared relay orchestrator
pub struct RelayPipeline {
    ledger: Arc<Ledger>,
    health: Arc<HealthMonitor>,
    registry: Arc<AdaptorRegistry>,
    pricing: PricingResolver,
    groups: GroupRatios,
    options: RelayOptions,
    metrics: RelayMetrics,
}

impl RelayPipeline {
    pub fn new(
        ledger: Arc<Ledger>,
        health: Arc<HealthMonitor>,
        registry: Arc<AdaptorRegistry>,
        pricing: PricingResolver,
        groups: GroupRatios,
        options: RelayOptions,
    ) -> Self {
        Self {
            ledger,
            health,
            registry,
            pricing,
            groups,
            options,
            metrics: RelayMetrics::new(),
        }
    }

    pub const fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Relay one request, streaming the response into `sink`
    pub async fn relay(&self, request: RelayRequest, sink: &mut dyn ResponseSink) -> Result<RelayOutcome, RelayError> {
        let started = Instant::now();
        let model = request.body.model.clone();
        let mode = request.mode;

        let result = self.run(request, sink, started).await;

        let status = if result.is_ok() { "success" } else { "error" };
        let attributes = [
            KeyValue::new("model", model),
            KeyValue::new("mode", mode.as_str()),
            KeyValue::new("status", status),
        ];
        self.metrics.requests.add(1, &attributes);
        metrics::record_duration(&self.metrics.duration, started, &attributes);

        result
    }

    async fn run(
        &self,
        request: RelayRequest,
        sink: &mut dyn ResponseSink,
        started: Instant,
    ) -> Result<RelayOutcome, RelayError> {
        let request_id = request
            .request_id
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

        let (token, user) = self.ledger.authorize(request.token_id, &request.body.model).await?;
        let channel = self.channel(request.channel_id).await?;
        let adaptor = self
            .registry
            .get(&channel.channel_type)
            .ok_or_else(|| RelayError::NoAdaptor(channel.channel_type.clone()))?;
        let actual_model = channel.map_model(&request.body.model).to_owned();

        let source: &dyn PricingSource = &*adaptor;
        let price = self.pricing.resolve(&actual_model, &channel.pricing, Some(source));
        let rate = RateCard {
            model_ratio: price.model_ratio,
            group_ratio: self.groups.get(&user.group),
            completion_ratio: price.completion_ratio,
        };

        let prompt_tokens = count_prompt_tokens(&request.body, request.mode);
        let estimate = estimate_reservation(
            prompt_tokens,
            request.body.max_tokens.unwrap_or(0),
            self.options.pre_consumed_tokens,
            rate.ratio(),
        );
        let reservation = self.ledger.pre_consume(token.id, estimate).await?;
        let guard = ReservationGuard::arm(&self.ledger, reservation.clone(), self.options.billing_timeout);

        let meta = RequestMeta {
            request_id,
            mode: request.mode,
            channel,
            user_id: Some(user.id),
            token_name: token.name,
            origin_model: request.body.model.clone(),
            actual_model,
            is_stream: request.body.stream,
            prompt_tokens,
            started_at: started,
        };

        tracing::debug!(
            request_id = %meta.request_id,
            channel_id = %meta.channel.id,
            model = %meta.actual_model,
            prompt_tokens,
            reserved = estimate,
            "relaying request"
        );

        let (usage, latency) = match Self::dispatch(adaptor.as_ref(), &meta, &request.body, sink).await {
            Ok(dispatched) => dispatched,
            Err(failure) => return Err(self.abandon(guard, reservation, &meta, failure).await),
        };

        let quota = rate.charge(usage.prompt_tokens, usage.completion_tokens, usage.tools_cost);
        let mut content = rate.to_string();
        if usage.tools_cost > 0 {
            let _ = write!(content, ", tools cost {}", usage.tools_cost);
        }

        self.metrics.tokens.add(
            u64::from(usage.prompt_tokens) + u64::from(usage.completion_tokens),
            &[KeyValue::new("model", meta.actual_model.clone())],
        );

        let commit = Commit {
            total_charged: quota,
            channel_id: meta.channel.id,
            model_name: meta.actual_model.clone(),
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            content,
            is_stream: meta.is_stream,
            elapsed: started.elapsed(),
            request_id: meta.request_id.clone(),
        };
        let billing = self.spawn_commit(reservation, commit);
        guard.disarm();

        self.observe(&meta.channel, Observation::success(Source::Relay, latency))
            .await;

        Ok(RelayOutcome {
            request_id: meta.request_id,
            usage,
            quota,
            billing,
        })
    }

    async fn channel(&self, id: ChannelId) -> Result<Channel, RelayError> {
        let channel = match self.ledger.store().channel(id).await {
            Ok(channel) => channel,
            Err(StoreError::NotFound { .. }) => return Err(RelayError::ChannelNotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if channel.status != ChannelStatus::Enabled {
            return Err(RelayError::ChannelDisabled(id));
        }
        Ok(channel)
    }

    /// Convert, send and read the response; latency is time to the first answer
    async fn dispatch(
        adaptor: &dyn Adaptor,
        meta: &RequestMeta,
        body: &ChatRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<(Usage, Duration), DispatchFailure> {
        adaptor.init(meta);

        let payload = adaptor
            .convert_request(meta.mode, body, meta)
            .map_err(DispatchFailure::Convert)?;
        let encoded = serde_json::to_vec(&payload).map_err(|e| DispatchFailure::Convert(e.into()))?;

        let sent = Instant::now();
        let response = adaptor
            .do_request(meta, Bytes::from(encoded))
            .await
            .map_err(|error| DispatchFailure::Upstream {
                error,
                latency: sent.elapsed(),
            })?;
        let latency = sent.elapsed();

        let usage = adaptor
            .do_response(response, meta, sink)
            .await
            .map_err(|error| DispatchFailure::Upstream { error, latency })?;

        Ok((usage, latency))
    }

    /// Refund the reservation and report the failure
    async fn abandon(
        &self,
        guard: ReservationGuard,
        reservation: Reservation,
        meta: &RequestMeta,
        failure: DispatchFailure,
    ) -> RelayError {
        let refund = spawn_refund(&self.ledger, reservation, self.options.billing_timeout);
        guard.disarm();
        match refund.await {
            Ok(Some(())) => {}
            Ok(None) => tracing::error!(request_id = %meta.request_id, "refund abandoned after deadline"),
            Err(e) => tracing::error!(request_id = %meta.request_id, error = %e, "refund task failed"),
        }

        match failure {
            DispatchFailure::Convert(e) => {
                tracing::warn!(request_id = %meta.request_id, error = %e, "failed to convert request");
                RelayError::ConvertRequest(e)
            }
            DispatchFailure::Upstream { error, latency } => {
                tracing::warn!(
                    request_id = %meta.request_id,
                    channel_id = %meta.channel.id,
                    error = %error,
                    "upstream dispatch failed"
                );
                self.observe(&meta.channel, Observation::failure(Source::Relay, error.clone(), latency))
                    .await;
                RelayError::Upstream(error)
            }
        }
    }

    async fn observe(&self, channel: &Channel, observation: Observation) {
        if let Err(e) = self.health.observe(channel, &observation).await {
            tracing::warn!(channel_id = %channel.id, error = %e, "failed to record channel health");
        }
    }

    fn spawn_commit(&self, reservation: Reservation, commit: Commit) -> JoinHandle<Option<()>> {
        let ledger = Arc::clone(&self.ledger);
        let deadline = self.options.billing_timeout;
        let timeouts = self.metrics.billing_timeouts.clone();

        self.ledger.tasks().spawn("billing_commit", async move {
            let request_id = commit.request_id.clone();
            let model = commit.model_name.clone();
            let quota = commit.total_charged;

            match tokio::time::timeout(deadline, ledger.post_consume(&reservation, commit)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(
                    request_id = %request_id,
                    reservation = %reservation.id,
                    error = %e,
                    "billing commit failed"
                ),
                Err(_) => {
                    tracing::error!(
                        request_id = %request_id,
                        model = %model,
                        user_id = %reservation.user_id,
                        quota,
                        deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                        "CRITICAL billing timeout"
                    );
                    timeouts.add(1, &[KeyValue::new("model", model)]);
                }
            }
        })
    }
}

impl std::fmt::Debug for RelayPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayPipeline")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use relaymeter_core::{LogKind, TaskPool, Token, TokenStatus, UsageLogEntry, User, UserId};
    use relaymeter_health::{HealthPolicy, ProbeReport, Prober};
    use relaymeter_ledger::{LedgerError, LedgerOptions, MemoryStore, QuotaStore, UsageLogSink};
    use relaymeter_pricing::ModelPrice;
    use serde_json::{Value, json};

    use super::*;
    use crate::adaptor::{BufferedSink, RawResponse};
    use crate::types::ChatMessage;

    struct ScriptedAdaptor {
        usage: Usage,
        failure: Option<UpstreamError>,
        delay: Option<Duration>,
        calls: AtomicUsize,
    }

    impl ScriptedAdaptor {
        fn answering(prompt_tokens: u32, completion_tokens: u32) -> Self {
            Self {
                usage: Usage {
                    prompt_tokens,
                    completion_tokens,
                    tools_cost: 0,
                },
                failure: None,
                delay: None,
                calls: AtomicUsize::new(0),
            }
        }

        fn answering_after(delay: Duration) -> Self {
            Self {
                delay: Some(delay),
                ..Self::answering(10, 5)
            }
        }

        fn failing(error: UpstreamError) -> Self {
            Self {
                failure: Some(error),
                ..Self::answering(0, 0)
            }
        }
    }

    impl PricingSource for ScriptedAdaptor {
        fn default_model_pricing(&self) -> HashMap<String, ModelPrice> {
            HashMap::from([("upstream-model".to_owned(), ModelPrice::new(3.0, 1.0))])
        }
    }

    #[async_trait]
    impl Adaptor for ScriptedAdaptor {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn convert_request(&self, _mode: RelayMode, _request: &ChatRequest, meta: &RequestMeta) -> Result<Value, AdaptorError> {
            Ok(json!({ "model": meta.actual_model }))
        }

        async fn do_request(&self, _meta: &RequestMeta, _body: Bytes) -> Result<RawResponse, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            match &self.failure {
                Some(error) => Err(error.clone()),
                None => Ok(RawResponse::from_bytes(200, "{\"ok\":true}")),
            }
        }

        async fn do_response(
            &self,
            response: RawResponse,
            _meta: &RequestMeta,
            sink: &mut dyn ResponseSink,
        ) -> Result<Usage, UpstreamError> {
            sink.send(response.collect().await?).await;
            Ok(self.usage)
        }
    }

    struct IdleProber;

    #[async_trait]
    impl Prober for IdleProber {
        async fn probe(&self, _channel: &Channel) -> ProbeReport {
            ProbeReport {
                result: Ok(()),
                latency: Duration::ZERO,
            }
        }

        async fn balance(&self, _channel: &Channel) -> Result<Option<f64>, UpstreamError> {
            Ok(None)
        }
    }

    /// Usage log whose appends outlive any billing deadline
    struct StalledLog;

    #[async_trait]
    impl UsageLogSink for StalledLog {
        async fn append(&self, _entry: UsageLogEntry) -> Result<(), StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }

        async fn entries(&self) -> Result<Vec<UsageLogEntry>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn seeded(group: &str, token_quota: i64) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User {
            id: UserId(1),
            group: group.to_owned(),
            quota: 100_000,
            used_quota: 0,
            request_count: 0,
        });
        store.insert_token(Token {
            id: TokenId(1),
            user_id: UserId(1),
            name: "default".to_owned(),
            status: TokenStatus::Enabled,
            remaining_quota: token_quota,
            unlimited: false,
            used_quota: 0,
            expires_at: None,
            models: None,
            subnet: None,
        });

        let mut channel = Channel::new(ChannelId(1), "primary", "scripted");
        channel.pricing.model_ratio.insert("m".to_owned(), 1.0);
        channel.pricing.completion_ratio.insert("m".to_owned(), 2.0);
        channel
            .model_mapping
            .insert("alias".to_owned(), "upstream-model".to_owned());
        store.insert_channel(channel);
        store
    }

    fn pipeline_with_log(
        store: &Arc<MemoryStore>,
        usage_log: Arc<dyn UsageLogSink>,
        adaptor: Arc<ScriptedAdaptor>,
        groups: GroupRatios,
        options: RelayOptions,
    ) -> RelayPipeline {
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            usage_log,
            TaskPool::new(8),
            LedgerOptions {
                batch_enabled: false,
                ..LedgerOptions::default()
            },
        ));
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            Arc::new(IdleProber),
            HealthPolicy::default(),
        ));
        let mut registry = AdaptorRegistry::new();
        registry.register("scripted", adaptor);

        RelayPipeline::new(
            ledger,
            health,
            Arc::new(registry),
            PricingResolver::default(),
            groups,
            options,
        )
    }

    fn pipeline(store: &Arc<MemoryStore>, adaptor: Arc<ScriptedAdaptor>) -> RelayPipeline {
        pipeline_with_log(
            store,
            store.clone(),
            adaptor,
            GroupRatios::default(),
            RelayOptions::default(),
        )
    }

    fn request(model: &str) -> RelayRequest {
        RelayRequest {
            token_id: TokenId(1),
            channel_id: ChannelId(1),
            mode: RelayMode::ChatCompletions,
            body: ChatRequest::chat(model, vec![ChatMessage::user("hello")]),
            request_id: Some("req-1".to_owned()),
        }
    }

    async fn balances(store: &MemoryStore) -> (i64, i64) {
        (
            store.token(TokenId(1)).await.unwrap().remaining_quota,
            store.user(UserId(1)).await.unwrap().quota,
        )
    }

    #[tokio::test]
    async fn successful_relay_charges_actual_usage() {
        let store = seeded("default", 100_000);
        let pipeline = pipeline(&store, Arc::new(ScriptedAdaptor::answering(10, 5)));
        let mut sink = BufferedSink::new();

        let outcome = pipeline.relay(request("m"), &mut sink).await.unwrap();
        assert_eq!(outcome.quota, 20);
        assert_eq!(sink.to_bytes(), Bytes::from_static(b"{\"ok\":true}"));

        assert_eq!(outcome.billing.await.unwrap(), Some(()));
        assert_eq!(balances(&store).await, (100_000 - 20, 100_000 - 20));

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LogKind::Consume);
        assert_eq!(entries[0].quota, 20);
        assert_eq!(entries[0].request_id, "req-1");
        assert_eq!(
            entries[0].content,
            "model rate 1.00, group rate 1.00, completion rate 2.00"
        );
        assert_eq!(pipeline.ledger().in_flight(), 0);
    }

    #[tokio::test]
    async fn mapped_model_uses_backend_price_and_group_ratio() {
        let store = seeded("vip", 100_000);
        let groups = GroupRatios::new([("vip".to_owned(), 0.5)].into_iter().collect());
        let pipeline = pipeline_with_log(
            &store,
            store.clone(),
            Arc::new(ScriptedAdaptor::answering(10, 10)),
            groups,
            RelayOptions::default(),
        );

        let outcome = pipeline
            .relay(request("alias"), &mut BufferedSink::new())
            .await
            .unwrap();
        // (10 + 10 * 1.0) * 3.0 * 0.5
        assert_eq!(outcome.quota, 30);
        outcome.billing.await.unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries[0].model_name, "upstream-model");
    }

    #[tokio::test]
    async fn dispatch_failure_refunds_and_disables_channel() {
        let store = seeded("default", 100_000);
        let error = UpstreamError::from_response(401, br#"{"error":{"message":"invalid key","code":"invalid_api_key"}}"#);
        let pipeline = pipeline(&store, Arc::new(ScriptedAdaptor::failing(error)));

        let err = pipeline
            .relay(request("m"), &mut BufferedSink::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Upstream(_)));

        assert_eq!(balances(&store).await, (100_000, 100_000));
        assert!(store.entries().await.unwrap().is_empty());
        assert_eq!(pipeline.ledger().in_flight(), 0);

        let channel = store.channel(ChannelId(1)).await.unwrap();
        assert_eq!(channel.status, ChannelStatus::Disabled);
        assert!(channel.disable_reason.is_some());
    }

    #[tokio::test]
    async fn transient_failure_keeps_channel_enabled() {
        let store = seeded("default", 100_000);
        let error = UpstreamError::from_response(503, b"overloaded");
        let pipeline = pipeline(&store, Arc::new(ScriptedAdaptor::failing(error)));

        assert!(pipeline.relay(request("m"), &mut BufferedSink::new()).await.is_err());
        assert_eq!(
            store.channel(ChannelId(1)).await.unwrap().status,
            ChannelStatus::Enabled
        );
        assert_eq!(balances(&store).await, (100_000, 100_000));
    }

    #[tokio::test]
    async fn insufficient_quota_never_dispatches() {
        let store = seeded("default", 10);
        let adaptor = Arc::new(ScriptedAdaptor::answering(10, 5));
        let pipeline = pipeline(&store, adaptor.clone());

        let err = pipeline
            .relay(request("m"), &mut BufferedSink::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RelayError::Ledger(LedgerError::InsufficientTokenQuota { remaining: 10, .. })
        ));
        assert_eq!(adaptor.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disabled_channel_is_rejected_before_reservation() {
        let store = seeded("default", 100_000);
        store
            .compare_and_set_channel_status(
                ChannelId(1),
                ChannelStatus::Enabled,
                ChannelStatus::Disabled,
                Some("manual"),
            )
            .await
            .unwrap();
        let pipeline = pipeline(&store, Arc::new(ScriptedAdaptor::answering(1, 1)));

        let err = pipeline
            .relay(request("m"), &mut BufferedSink::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelDisabled(ChannelId(1))));
        assert_eq!(balances(&store).await, (100_000, 100_000));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_commit_is_abandoned_after_deadline() {
        let store = seeded("default", 100_000);
        let pipeline = pipeline_with_log(
            &store,
            Arc::new(StalledLog),
            Arc::new(ScriptedAdaptor::answering(10, 5)),
            GroupRatios::default(),
            RelayOptions {
                billing_timeout: Duration::from_secs(5),
                ..RelayOptions::default()
            },
        );

        let outcome = pipeline
            .relay(request("m"), &mut BufferedSink::new())
            .await
            .unwrap();
        assert_eq!(outcome.billing.await.unwrap(), Some(()));

        // settlement delta landed before the log write stalled
        assert_eq!(balances(&store).await, (100_000 - 20, 100_000 - 20));
        assert_eq!(pipeline.ledger().in_flight(), 0);
        assert_eq!(store.user(UserId(1)).await.unwrap().request_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_request_refunds_reservation() {
        let store = seeded("default", 100_000);
        let adaptor = Arc::new(ScriptedAdaptor::answering_after(Duration::from_secs(60)));
        let pipeline = pipeline(&store, adaptor.clone());

        let mut sink = BufferedSink::new();
        let relayed = tokio::time::timeout(Duration::from_secs(1), pipeline.relay(request("m"), &mut sink)).await;
        assert!(relayed.is_err());
        assert_eq!(adaptor.calls.load(Ordering::SeqCst), 1);

        pipeline.ledger().tasks().drain().await;
        assert_eq!(balances(&store).await, (100_000, 100_000));
        assert_eq!(pipeline.ledger().in_flight(), 0);
        assert!(store.entries().await.unwrap().is_empty());
    }
}
