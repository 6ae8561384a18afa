//! In-process ledger, health monitor and relay pipeline wired to a backend

use std::sync::Arc;
use std::time::Duration;

use relaymeter_core::{Channel, ChannelId, TaskPool, Token, TokenId, TokenStatus, User, UserId};
use relaymeter_health::{HealthMonitor, HealthPolicy};
use relaymeter_ledger::{Ledger, LedgerOptions, MemoryStore};
use relaymeter_pricing::{GroupRatios, PricingResolver};
use relaymeter_relay::{
    AdaptorProber, AdaptorRegistry, ChatMessage, ChatRequest, ProbeSettings, RelayMode, RelayOptions, RelayPipeline,
    RelayRequest,
};
use secrecy::SecretString;

pub const MODEL: &str = "mock-model";
pub const USER_QUOTA: i64 = 1_000_000;
pub const TOKEN_QUOTA: i64 = 500_000;
/// `PROMPT_TOKENS + COMPLETION_TOKENS * 2.0` at model ratio 1.0
pub const CHARGE: i64 = 28;

pub struct Gateway {
    pub store: Arc<MemoryStore>,
    pub ledger: Arc<Ledger>,
    pub health: Arc<HealthMonitor>,
    pub pipeline: RelayPipeline,
}

impl Gateway {
    /// Gateway writing every delta directly
    pub fn start(backend_url: &str) -> Self {
        Self::build(backend_url, false)
    }

    /// Gateway routing commit deltas through the batch accumulator
    pub fn start_batched(backend_url: &str) -> Self {
        Self::build(backend_url, true)
    }

    fn build(backend_url: &str, batch_enabled: bool) -> Self {
        let store = Arc::new(MemoryStore::new());
        seed(&store, backend_url);

        let ledger = Arc::new(Ledger::new(
            store.clone(),
            store.clone(),
            TaskPool::new(16),
            LedgerOptions {
                batch_enabled,
                ..LedgerOptions::default()
            },
        ));

        let registry = Arc::new(AdaptorRegistry::with_defaults(reqwest::Client::new()));
        let prober = AdaptorProber::new(
            Arc::clone(&registry),
            ledger.recorder().clone(),
            PricingResolver::default(),
            ProbeSettings {
                model: MODEL.to_owned(),
                prompt: "ping".to_owned(),
                max_tokens: 4,
            },
        );
        let health = Arc::new(HealthMonitor::new(
            store.clone(),
            Arc::new(prober),
            HealthPolicy {
                probe_interval: Duration::ZERO,
                ..HealthPolicy::default()
            },
        ));

        let pipeline = RelayPipeline::new(
            Arc::clone(&ledger),
            Arc::clone(&health),
            registry,
            PricingResolver::default(),
            GroupRatios::default(),
            RelayOptions::default(),
        );

        Self {
            store,
            ledger,
            health,
            pipeline,
        }
    }
}

fn seed(store: &MemoryStore, backend_url: &str) {
    store.insert_user(User {
        id: UserId(1),
        group: "default".to_owned(),
        quota: USER_QUOTA,
        used_quota: 0,
        request_count: 0,
    });
    store.insert_token(Token {
        id: TokenId(1),
        user_id: UserId(1),
        name: "integration".to_owned(),
        status: TokenStatus::Enabled,
        remaining_quota: TOKEN_QUOTA,
        unlimited: false,
        used_quota: 0,
        expires_at: None,
        models: None,
        subnet: None,
    });

    let mut channel = Channel::new(ChannelId(1), "mock", "openai");
    channel.base_url = Some(backend_url.to_owned());
    channel.api_key = Some(SecretString::from("sk-integration"));
    channel.models = vec![MODEL.to_owned()];
    channel.pricing.model_ratio.insert(MODEL.to_owned(), 1.0);
    channel.pricing.completion_ratio.insert(MODEL.to_owned(), 2.0);
    store.insert_channel(channel);
}

pub fn chat(stream: bool) -> RelayRequest {
    let mut body = ChatRequest::chat(MODEL, vec![ChatMessage::user("Hello")]);
    body.stream = stream;

    RelayRequest {
        token_id: TokenId(1),
        channel_id: ChannelId(1),
        mode: RelayMode::ChatCompletions,
        body,
        request_id: None,
    }
}
