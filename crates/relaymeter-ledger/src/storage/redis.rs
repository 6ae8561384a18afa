//! Redis-backed store
//!
//! Rows live in hashes under `{prefix}:user:{id}`, `{prefix}:token:{id}` and
//! `{prefix}:channel:{id}`; channel ids are indexed in the `{prefix}:channels`
//! set and the usage log is a list of JSON lines. Every row mutation runs as
//! a Lua script, so the existence check and the write are one atomic step on
//! the server and a missing row is never recreated by a stray `HINCRBY`.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use relaymeter_core::{
    Channel, ChannelId, ChannelPricing, ChannelStatus, Quota, Token, TokenId, TokenStatus, UsageLogEntry, User,
    UserId, unix_now,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::store::{QuotaStore, ReserveOutcome, UsageLogSink};

const RESERVE_SCRIPT: &str = r"
local amount = tonumber(ARGV[1])
if redis.call('EXISTS', KEYS[2]) == 0 then return {-3, 0} end
if ARGV[2] == '0' then
  if redis.call('EXISTS', KEYS[1]) == 0 then return {-4, 0} end
  local remaining = tonumber(redis.call('HGET', KEYS[1], 'remaining_quota') or '0')
  if remaining < amount then return {-1, remaining} end
end
local balance = tonumber(redis.call('HGET', KEYS[2], 'quota') or '0')
if balance < amount then return {-2, balance} end
if ARGV[2] == '0' then
  redis.call('HINCRBY', KEYS[1], 'remaining_quota', -amount)
  redis.call('HINCRBY', KEYS[1], 'used_quota', amount)
end
redis.call('HINCRBY', KEYS[2], 'quota', -amount)
return {1, balance}
";

const CHANNEL_CAS_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return -1 end
if redis.call('HGET', KEYS[1], 'status') ~= ARGV[1] then return 0 end
redis.call('HSET', KEYS[1], 'status', ARGV[2], 'status_changed_at', ARGV[4])
if ARGV[3] == '' then
  redis.call('HDEL', KEYS[1], 'disable_reason')
else
  redis.call('HSET', KEYS[1], 'disable_reason', ARGV[3])
end
return 1
";

/// `HINCRBY` each `(field, delta)` pair in ARGV, only if the row exists
const ROW_INCR_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
for i = 1, #ARGV, 2 do
  redis.call('HINCRBY', KEYS[1], ARGV[i], ARGV[i + 1])
end
return 1
";

/// `HSET` one field, only if the row exists
const ROW_SET_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return 0 end
redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
return 1
";

/// Add ARGV[1] to the user balance without taking it below zero
const USER_ADJUST_SCRIPT: &str = r"
if redis.call('EXISTS', KEYS[1]) == 0 then return {0, 0} end
local delta = tonumber(ARGV[1])
local balance = tonumber(redis.call('HGET', KEYS[1], 'quota') or '0')
if delta < 0 and balance + delta < 0 then
  delta = -math.max(balance, 0)
end
redis.call('HINCRBY', KEYS[1], 'quota', delta)
return {1, delta}
";

/// Map a row script status to `NotFound` when the row was missing
fn row_written(status: i64, entity: &'static str, id: i64) -> Result<(), StoreError> {
    match status {
        1 => Ok(()),
        0 => Err(StoreError::NotFound { entity, id }),
        other => Err(StoreError::Redis(format!("unexpected {entity} write result {other}"))),
    }
}

/// Static channel settings, stored as one JSON field
#[derive(Serialize, Deserialize)]
struct ChannelSettings {
    name: String,
    channel_type: String,
    #[serde(default)]
    base_url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    models: Vec<String>,
    #[serde(default)]
    model_mapping: HashMap<String, String>,
    #[serde(default)]
    pricing: ChannelPricing,
}

/// Quota store backed by Redis hashes
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    prefix: String,
    reserve: redis::Script,
    channel_cas: redis::Script,
    row_incr: redis::Script,
    row_set: redis::Script,
    user_adjust: redis::Script,
}

impl RedisStore {
    /// Connect to Redis at `url`
    pub async fn connect(url: &str, prefix: impl Into<String>) -> Result<Self, StoreError> {
        let client =
            redis::Client::open(url).map_err(|e| StoreError::Redis(format!("failed to open Redis client: {e}")))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| StoreError::Redis(format!("failed to connect to Redis: {e}")))?;

        Ok(Self {
            conn,
            prefix: prefix.into(),
            reserve: redis::Script::new(RESERVE_SCRIPT),
            channel_cas: redis::Script::new(CHANNEL_CAS_SCRIPT),
            row_incr: redis::Script::new(ROW_INCR_SCRIPT),
            row_set: redis::Script::new(ROW_SET_SCRIPT),
            user_adjust: redis::Script::new(USER_ADJUST_SCRIPT),
        })
    }

    fn key(&self, entity: &str, id: i64) -> String {
        format!("{}:{entity}:{id}", self.prefix)
    }

    fn channel_index_key(&self) -> String {
        format!("{}:channels", self.prefix)
    }

    fn usage_log_key(&self) -> String {
        format!("{}:usage_log", self.prefix)
    }

    async fn row(&self, entity: &'static str, id: i64) -> Result<HashMap<String, String>, StoreError> {
        let mut conn = self.conn.clone();
        let row: HashMap<String, String> = conn.hgetall(self.key(entity, id)).await?;
        if row.is_empty() {
            return Err(StoreError::NotFound { entity, id });
        }
        Ok(row)
    }

    async fn incr(&self, entity: &'static str, id: i64, fields: &[(&str, i64)]) -> Result<(), StoreError> {
        let mut invocation = self.row_incr.key(self.key(entity, id));
        for (field, delta) in fields {
            invocation.arg(*field).arg(*delta);
        }

        let mut conn = self.conn.clone();
        let status: i64 = invocation.invoke_async(&mut conn).await?;
        row_written(status, entity, id)
    }

    async fn set_field(&self, entity: &'static str, id: i64, field: &str, value: String) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let status: i64 = self
            .row_set
            .key(self.key(entity, id))
            .arg(field)
            .arg(value)
            .invoke_async(&mut conn)
            .await?;
        row_written(status, entity, id)
    }

    /// Create or replace a user row
    pub async fn put_user(&self, user: &User) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let fields = [
            ("group", user.group.clone()),
            ("quota", user.quota.to_string()),
            ("used_quota", user.used_quota.to_string()),
            ("request_count", user.request_count.to_string()),
        ];
        let _: () = conn.hset_multiple(self.key("user", user.id.0), &fields).await?;
        Ok(())
    }

    /// Create or replace a token row
    pub async fn put_token(&self, token: &Token) -> Result<(), StoreError> {
        let models = token
            .models
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| decode("token", &e))?;

        let key = self.key("token", token.id.0);
        let mut fields = vec![
            ("user_id", token.user_id.0.to_string()),
            ("name", token.name.clone()),
            ("status", token.status.as_str().to_owned()),
            ("remaining_quota", token.remaining_quota.to_string()),
            ("unlimited", u8::from(token.unlimited).to_string()),
            ("used_quota", token.used_quota.to_string()),
        ];
        if let Some(at) = token.expires_at {
            fields.push(("expires_at", at.to_string()));
        }
        if let Some(models) = models {
            fields.push(("models", models));
        }
        if let Some(ref subnet) = token.subnet {
            fields.push(("subnet", subnet.clone()));
        }

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .hset_multiple(&key, &fields)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Create or replace a channel row and index it
    pub async fn put_channel(&self, channel: &Channel) -> Result<(), StoreError> {
        let settings = ChannelSettings {
            name: channel.name.clone(),
            channel_type: channel.channel_type.clone(),
            base_url: channel.base_url.clone(),
            api_key: channel.api_key.as_ref().map(|key| key.expose_secret().to_owned()),
            models: channel.models.clone(),
            model_mapping: channel.model_mapping.clone(),
            pricing: channel.pricing.clone(),
        };
        let settings = serde_json::to_string(&settings).map_err(|e| decode("channel", &e))?;

        let key = self.key("channel", channel.id.0);
        let mut fields = vec![
            ("settings", settings),
            ("status", channel.status.as_str().to_owned()),
            ("balance", channel.balance.to_string()),
            ("used_quota", channel.used_quota.to_string()),
            ("response_time_ms", channel.response_time_ms.to_string()),
        ];
        if let Some(ref reason) = channel.disable_reason {
            fields.push(("disable_reason", reason.clone()));
        }
        if let Some(at) = channel.status_changed_at {
            fields.push(("status_changed_at", at.to_string()));
        }

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(&key)
            .hset_multiple(&key, &fields)
            .sadd(self.channel_index_key(), channel.id.0)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn decode(entity: &'static str, error: &dyn std::fmt::Display) -> StoreError {
    StoreError::Decode {
        entity,
        message: error.to_string(),
    }
}

fn field<T: std::str::FromStr>(row: &HashMap<String, String>, entity: &'static str, name: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    let raw = row.get(name).ok_or_else(|| StoreError::Decode {
        entity,
        message: format!("missing field '{name}'"),
    })?;
    raw.parse().map_err(|e| StoreError::Decode {
        entity,
        message: format!("field '{name}': {e}"),
    })
}

fn optional_field<T: std::str::FromStr>(
    row: &HashMap<String, String>,
    entity: &'static str,
    name: &str,
) -> Result<Option<T>, StoreError>
where
    T::Err: std::fmt::Display,
{
    if row.contains_key(name) {
        field(row, entity, name).map(Some)
    } else {
        Ok(None)
    }
}

fn user_from_row(id: UserId, row: &HashMap<String, String>) -> Result<User, StoreError> {
    Ok(User {
        id,
        group: row.get("group").cloned().unwrap_or_else(|| "default".to_owned()),
        quota: field(row, "user", "quota")?,
        used_quota: optional_field(row, "user", "used_quota")?.unwrap_or(0),
        request_count: optional_field(row, "user", "request_count")?.unwrap_or(0),
    })
}

fn token_from_row(id: TokenId, row: &HashMap<String, String>) -> Result<Token, StoreError> {
    let status = row
        .get("status")
        .map(String::as_str)
        .and_then(TokenStatus::parse)
        .ok_or_else(|| StoreError::Decode {
            entity: "token",
            message: "invalid status".to_owned(),
        })?;
    let models = row
        .get("models")
        .map(|raw| serde_json::from_str::<Vec<String>>(raw))
        .transpose()
        .map_err(|e| decode("token", &e))?;

    Ok(Token {
        id,
        user_id: UserId(field(row, "token", "user_id")?),
        name: row.get("name").cloned().unwrap_or_default(),
        status,
        remaining_quota: field(row, "token", "remaining_quota")?,
        unlimited: row.get("unlimited").is_some_and(|raw| raw == "1"),
        used_quota: optional_field(row, "token", "used_quota")?.unwrap_or(0),
        expires_at: optional_field(row, "token", "expires_at")?,
        models,
        subnet: row.get("subnet").cloned(),
    })
}

fn channel_from_row(id: ChannelId, row: &HashMap<String, String>) -> Result<Channel, StoreError> {
    let settings: ChannelSettings = row
        .get("settings")
        .map(|raw| serde_json::from_str(raw))
        .transpose()
        .map_err(|e| decode("channel", &e))?
        .ok_or_else(|| StoreError::Decode {
            entity: "channel",
            message: "missing field 'settings'".to_owned(),
        })?;
    let status = row
        .get("status")
        .map(String::as_str)
        .and_then(ChannelStatus::parse)
        .ok_or_else(|| StoreError::Decode {
            entity: "channel",
            message: "invalid status".to_owned(),
        })?;

    let mut channel = Channel::new(id, settings.name, settings.channel_type);
    channel.status = status;
    channel.base_url = settings.base_url;
    channel.api_key = settings.api_key.map(SecretString::from);
    channel.models = settings.models;
    channel.model_mapping = settings.model_mapping;
    channel.pricing = settings.pricing;
    channel.balance = optional_field(row, "channel", "balance")?.unwrap_or(0.0);
    channel.used_quota = optional_field(row, "channel", "used_quota")?.unwrap_or(0);
    channel.response_time_ms = optional_field(row, "channel", "response_time_ms")?.unwrap_or(0);
    channel.disable_reason = row.get("disable_reason").cloned();
    channel.status_changed_at = optional_field(row, "channel", "status_changed_at")?;
    Ok(channel)
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn token(&self, id: TokenId) -> Result<Token, StoreError> {
        let row = self.row("token", id.0).await?;
        token_from_row(id, &row)
    }

    async fn user(&self, id: UserId) -> Result<User, StoreError> {
        let row = self.row("user", id.0).await?;
        user_from_row(id, &row)
    }

    async fn channel(&self, id: ChannelId) -> Result<Channel, StoreError> {
        let row = self.row("channel", id.0).await?;
        channel_from_row(id, &row)
    }

    async fn channels(&self) -> Result<Vec<Channel>, StoreError> {
        let mut conn = self.conn.clone();
        let mut ids: Vec<i64> = conn.smembers(self.channel_index_key()).await?;
        ids.sort_unstable();

        let mut channels = Vec::with_capacity(ids.len());
        for id in ids {
            match self.channel(ChannelId(id)).await {
                Ok(channel) => channels.push(channel),
                Err(StoreError::NotFound { .. }) => {
                    tracing::debug!(channel_id = id, "indexed channel row is missing, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(channels)
    }

    async fn reserve(
        &self,
        token_id: TokenId,
        user_id: UserId,
        amount: Quota,
        unlimited: bool,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut conn = self.conn.clone();
        let (code, value): (i64, i64) = self
            .reserve
            .key(self.key("token", token_id.0))
            .key(self.key("user", user_id.0))
            .arg(amount)
            .arg(u8::from(unlimited))
            .invoke_async(&mut conn)
            .await?;

        match code {
            1 => Ok(ReserveOutcome::Reserved {
                user_quota_before: value,
            }),
            -1 => Ok(ReserveOutcome::InsufficientToken { remaining: value }),
            -2 => Ok(ReserveOutcome::InsufficientUser { balance: value }),
            -3 => Err(StoreError::NotFound {
                entity: "user",
                id: user_id.0,
            }),
            -4 => Err(StoreError::NotFound {
                entity: "token",
                id: token_id.0,
            }),
            other => Err(StoreError::Redis(format!("unexpected reserve result {other}"))),
        }
    }

    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<(), StoreError> {
        self.incr("token", id.0, &[("remaining_quota", delta), ("used_quota", -delta)])
            .await
    }

    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota, StoreError> {
        let mut conn = self.conn.clone();
        let (status, applied): (i64, Quota) = self
            .user_adjust
            .key(self.key("user", id.0))
            .arg(delta)
            .invoke_async(&mut conn)
            .await?;
        row_written(status, "user", id.0)?;
        Ok(applied)
    }

    async fn add_user_used_quota(&self, id: UserId, amount: Quota) -> Result<(), StoreError> {
        self.incr("user", id.0, &[("used_quota", amount)]).await
    }

    async fn add_user_request_count(&self, id: UserId, count: i64) -> Result<(), StoreError> {
        self.incr("user", id.0, &[("request_count", count)]).await
    }

    async fn add_channel_used_quota(&self, id: ChannelId, amount: Quota) -> Result<(), StoreError> {
        self.incr("channel", id.0, &[("used_quota", amount)]).await
    }

    async fn set_token_status(&self, id: TokenId, status: TokenStatus) -> Result<(), StoreError> {
        self.set_field("token", id.0, "status", status.as_str().to_owned())
            .await
    }

    async fn compare_and_set_channel_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let reason = match new {
            ChannelStatus::Disabled => reason.unwrap_or_default(),
            ChannelStatus::Enabled => "",
        };

        let mut conn = self.conn.clone();
        let swapped: i64 = self
            .channel_cas
            .key(self.key("channel", id.0))
            .arg(expected.as_str())
            .arg(new.as_str())
            .arg(reason)
            .arg(unix_now())
            .invoke_async(&mut conn)
            .await?;

        match swapped {
            -1 => Err(StoreError::NotFound {
                entity: "channel",
                id: id.0,
            }),
            n => Ok(n == 1),
        }
    }

    async fn update_channel_response_time(&self, id: ChannelId, millis: i64) -> Result<(), StoreError> {
        self.set_field("channel", id.0, "response_time_ms", millis.to_string())
            .await
    }

    async fn update_channel_balance(&self, id: ChannelId, balance: f64) -> Result<(), StoreError> {
        self.set_field("channel", id.0, "balance", balance.to_string())
            .await
    }
}

#[async_trait]
impl UsageLogSink for RedisStore {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(&entry).map_err(|e| decode("usage log entry", &e))?;
        let mut conn = self.conn.clone();
        let _: i64 = conn.rpush(self.usage_log_key(), line).await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<UsageLogEntry>, StoreError> {
        let mut conn = self.conn.clone();
        let lines: Vec<String> = conn.lrange(self.usage_log_key(), 0, -1).await?;
        lines
            .iter()
            .map(|line| serde_json::from_str(line).map_err(|e| decode("usage log entry", &e)))
            .collect()
    }
}
