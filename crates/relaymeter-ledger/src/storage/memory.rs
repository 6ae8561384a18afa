use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use relaymeter_core::{
    Channel, ChannelId, ChannelStatus, Quota, Token, TokenId, TokenStatus, UsageLogEntry, User, UserId, unix_now,
};

use crate::error::StoreError;
use crate::store::{QuotaStore, ReserveOutcome, UsageLogSink};

/// In-process store backed by `DashMap` rows
///
/// Each row update holds that row's shard lock, which gives the same
/// single-row atomicity as a conditional SQL update.
#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<UserId, User>,
    tokens: DashMap<TokenId, Token>,
    channels: DashMap<ChannelId, Channel>,
    usage_log: Mutex<Vec<UsageLogEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_user(&self, user: User) {
        self.users.insert(user.id, user);
    }

    pub fn insert_token(&self, token: Token) {
        self.tokens.insert(token.id, token);
    }

    pub fn insert_channel(&self, channel: Channel) {
        self.channels.insert(channel.id, channel);
    }
}

const fn not_found(entity: &'static str, id: i64) -> StoreError {
    StoreError::NotFound { entity, id }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn token(&self, id: TokenId) -> Result<Token, StoreError> {
        self.tokens
            .get(&id)
            .map(|row| row.clone())
            .ok_or(not_found("token", id.0))
    }

    async fn user(&self, id: UserId) -> Result<User, StoreError> {
        self.users
            .get(&id)
            .map(|row| row.clone())
            .ok_or(not_found("user", id.0))
    }

    async fn channel(&self, id: ChannelId) -> Result<Channel, StoreError> {
        self.channels
            .get(&id)
            .map(|row| row.clone())
            .ok_or(not_found("channel", id.0))
    }

    async fn channels(&self) -> Result<Vec<Channel>, StoreError> {
        let mut channels: Vec<Channel> = self.channels.iter().map(|row| row.clone()).collect();
        channels.sort_by_key(|channel| channel.id);
        Ok(channels)
    }

    async fn reserve(
        &self,
        token_id: TokenId,
        user_id: UserId,
        amount: Quota,
        unlimited: bool,
    ) -> Result<ReserveOutcome, StoreError> {
        if !self.users.contains_key(&user_id) {
            return Err(not_found("user", user_id.0));
        }

        if !unlimited {
            let mut token = self.tokens.get_mut(&token_id).ok_or(not_found("token", token_id.0))?;
            if token.remaining_quota < amount {
                return Ok(ReserveOutcome::InsufficientToken {
                    remaining: token.remaining_quota,
                });
            }
            token.remaining_quota -= amount;
            token.used_quota += amount;
        }

        let outcome = {
            let mut user = self.users.get_mut(&user_id).ok_or(not_found("user", user_id.0))?;
            if user.quota < amount {
                ReserveOutcome::InsufficientUser { balance: user.quota }
            } else {
                let before = user.quota;
                user.quota -= amount;
                ReserveOutcome::Reserved {
                    user_quota_before: before,
                }
            }
        };

        if !unlimited && matches!(outcome, ReserveOutcome::InsufficientUser { .. }) {
            self.adjust_token_quota(token_id, amount).await?;
        }

        Ok(outcome)
    }

    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<(), StoreError> {
        let mut token = self.tokens.get_mut(&id).ok_or(not_found("token", id.0))?;
        token.remaining_quota += delta;
        token.used_quota -= delta;
        Ok(())
    }

    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota, StoreError> {
        let mut user = self.users.get_mut(&id).ok_or(not_found("user", id.0))?;
        let applied = if delta < 0 { delta.max(-user.quota.max(0)) } else { delta };
        user.quota += applied;
        Ok(applied)
    }

    async fn add_user_used_quota(&self, id: UserId, amount: Quota) -> Result<(), StoreError> {
        let mut user = self.users.get_mut(&id).ok_or(not_found("user", id.0))?;
        user.used_quota += amount;
        Ok(())
    }

    async fn add_user_request_count(&self, id: UserId, count: i64) -> Result<(), StoreError> {
        let mut user = self.users.get_mut(&id).ok_or(not_found("user", id.0))?;
        user.request_count += count;
        Ok(())
    }

    async fn add_channel_used_quota(&self, id: ChannelId, amount: Quota) -> Result<(), StoreError> {
        let mut channel = self.channels.get_mut(&id).ok_or(not_found("channel", id.0))?;
        channel.used_quota += amount;
        Ok(())
    }

    async fn set_token_status(&self, id: TokenId, status: TokenStatus) -> Result<(), StoreError> {
        let mut token = self.tokens.get_mut(&id).ok_or(not_found("token", id.0))?;
        token.status = status;
        Ok(())
    }

    async fn compare_and_set_channel_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError> {
        let mut channel = self.channels.get_mut(&id).ok_or(not_found("channel", id.0))?;
        if channel.status != expected {
            return Ok(false);
        }

        channel.status = new;
        channel.status_changed_at = Some(unix_now());
        channel.disable_reason = match new {
            ChannelStatus::Disabled => reason.map(str::to_owned),
            ChannelStatus::Enabled => None,
        };
        Ok(true)
    }

    async fn update_channel_response_time(&self, id: ChannelId, millis: i64) -> Result<(), StoreError> {
        let mut channel = self.channels.get_mut(&id).ok_or(not_found("channel", id.0))?;
        channel.response_time_ms = millis;
        Ok(())
    }

    async fn update_channel_balance(&self, id: ChannelId, balance: f64) -> Result<(), StoreError> {
        let mut channel = self.channels.get_mut(&id).ok_or(not_found("channel", id.0))?;
        channel.balance = balance;
        Ok(())
    }
}

#[async_trait]
impl UsageLogSink for MemoryStore {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), StoreError> {
        self.usage_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<UsageLogEntry>, StoreError> {
        Ok(self
            .usage_log
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone())
    }
}
