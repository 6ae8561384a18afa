//! Persisted entities shared by the ledger, the health monitor and the relay

use std::collections::HashMap;
use std::fmt;

use secrecy::SecretString;
use serde::{Deserialize, Serialize};

macro_rules! entity_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }
    };
}

entity_id!(
    /// Identifier of a user wallet
    UserId
);
entity_id!(
    /// Identifier of an API token
    TokenId
);
entity_id!(
    /// Identifier of a backend channel
    ChannelId
);

/// Quota amounts in the smallest billing unit
pub type Quota = i64;

/// Owner of a quota wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Pricing group used to look up the group ratio
    #[serde(default = "default_group")]
    pub group: String,
    /// Spendable balance
    pub quota: Quota,
    /// Cumulative charged quota
    #[serde(default)]
    pub used_quota: Quota,
    #[serde(default)]
    pub request_count: i64,
}

fn default_group() -> String {
    "default".to_owned()
}

/// Lifecycle state of a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenStatus {
    Enabled,
    Disabled,
    Expired,
    Exhausted,
}

impl TokenStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
            Self::Expired => "expired",
            Self::Exhausted => "exhausted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            "expired" => Some(Self::Expired),
            "exhausted" => Some(Self::Exhausted),
            _ => None,
        }
    }
}

impl fmt::Display for TokenStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// API key bound to one user, with its own spending limit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub id: TokenId,
    pub user_id: UserId,
    pub name: String,
    pub status: TokenStatus,
    /// Remaining quota; ignored when `unlimited` is set
    pub remaining_quota: Quota,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub used_quota: Quota,
    /// Expiry as unix seconds, `None` never expires
    #[serde(default)]
    pub expires_at: Option<i64>,
    /// Allowed models, `None` allows every model
    #[serde(default)]
    pub models: Option<Vec<String>>,
    /// Allowed client subnet (enforced by the auth layer)
    #[serde(default)]
    pub subnet: Option<String>,
}

impl Token {
    /// Whether the expiry timestamp is in the past at `now`
    pub fn is_expired_at(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| at < now)
    }

    /// Whether this token may be used for `model`
    pub fn allows_model(&self, model: &str) -> bool {
        self.models
            .as_ref()
            .is_none_or(|models| models.iter().any(|m| m == model))
    }
}

/// Routing state of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Enabled,
    Disabled,
}

impl ChannelStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Enabled => "enabled",
            Self::Disabled => "disabled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "enabled" => Some(Self::Enabled),
            "disabled" => Some(Self::Disabled),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-channel pricing overrides, resolved field by field
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelPricing {
    #[serde(default)]
    pub model_ratio: HashMap<String, f64>,
    #[serde(default)]
    pub completion_ratio: HashMap<String, f64>,
}

/// A registered backend credential and endpoint
#[derive(Debug, Clone)]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    /// Adaptor registry key, e.g. `openai`
    pub channel_type: String,
    pub status: ChannelStatus,
    pub base_url: Option<String>,
    pub api_key: Option<SecretString>,
    /// Models served by this channel; the first one is used for probes
    pub models: Vec<String>,
    /// Requested model name to upstream model name
    pub model_mapping: HashMap<String, String>,
    pub pricing: ChannelPricing,
    /// Last provider-reported balance
    pub balance: f64,
    pub used_quota: Quota,
    /// Latency of the last probe in milliseconds
    pub response_time_ms: i64,
    pub disable_reason: Option<String>,
    /// Unix seconds of the last status transition
    pub status_changed_at: Option<i64>,
}

impl Channel {
    /// Create an enabled channel with no overrides
    pub fn new(id: ChannelId, name: impl Into<String>, channel_type: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            channel_type: channel_type.into(),
            status: ChannelStatus::Enabled,
            base_url: None,
            api_key: None,
            models: Vec::new(),
            model_mapping: HashMap::new(),
            pricing: ChannelPricing::default(),
            balance: 0.0,
            used_quota: 0,
            response_time_ms: 0,
            disable_reason: None,
            status_changed_at: None,
        }
    }

    /// Upstream model name for a requested model
    pub fn map_model<'a>(&'a self, requested: &'a str) -> &'a str {
        self.model_mapping
            .get(requested)
            .filter(|mapped| !mapped.is_empty())
            .map_or(requested, String::as_str)
    }
}

/// Kind of usage log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogKind {
    /// A relayed request that was charged
    Consume,
    /// A health probe; the quota is informational only
    Test,
}

/// Immutable record of one charged request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageLogEntry {
    pub kind: LogKind,
    pub request_id: String,
    pub user_id: Option<UserId>,
    pub channel_id: ChannelId,
    pub token_name: String,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub quota: Quota,
    pub elapsed_ms: u64,
    pub is_stream: bool,
    /// Unix seconds
    pub created_at: i64,
    /// Rates applied, free text
    pub content: String,
}

/// Current time as unix seconds
pub fn unix_now() -> i64 {
    jiff::Timestamp::now().as_second()
}
