//! Durable state ports used by the ledger and the health monitor

use async_trait::async_trait;
use relaymeter_core::{
    Channel, ChannelId, ChannelStatus, Quota, Token, TokenId, TokenStatus, UsageLogEntry, User, UserId,
};

use crate::error::StoreError;

/// Result of a conditional reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    /// Both rows were decremented
    Reserved {
        /// User balance before the decrement
        user_quota_before: Quota,
    },
    /// Token remaining quota was below the amount; nothing changed
    InsufficientToken { remaining: Quota },
    /// User balance was below the amount; nothing changed
    InsufficientUser { balance: Quota },
}

/// Durable token, user and channel rows
///
/// Every mutation is a single-row atomic update. No operation spans rows
/// except [`QuotaStore::reserve`], which rolls back its token decrement when
/// the user decrement fails.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    async fn token(&self, id: TokenId) -> Result<Token, StoreError>;

    async fn user(&self, id: UserId) -> Result<User, StoreError>;

    async fn channel(&self, id: ChannelId) -> Result<Channel, StoreError>;

    async fn channels(&self) -> Result<Vec<Channel>, StoreError>;

    /// Conditionally decrement the token (unless `unlimited`) and then the user by `amount`
    async fn reserve(
        &self,
        token_id: TokenId,
        user_id: UserId,
        amount: Quota,
        unlimited: bool,
    ) -> Result<ReserveOutcome, StoreError>;

    /// `remaining_quota += delta`, `used_quota -= delta`
    async fn adjust_token_quota(&self, id: TokenId, delta: Quota) -> Result<(), StoreError>;

    /// `quota += delta`, never taking the balance below zero
    ///
    /// Returns the delta actually applied. It differs from `delta` only when a
    /// debit was larger than the balance.
    async fn adjust_user_quota(&self, id: UserId, delta: Quota) -> Result<Quota, StoreError>;

    async fn add_user_used_quota(&self, id: UserId, amount: Quota) -> Result<(), StoreError>;

    async fn add_user_request_count(&self, id: UserId, count: i64) -> Result<(), StoreError>;

    async fn add_channel_used_quota(&self, id: ChannelId, amount: Quota) -> Result<(), StoreError>;

    async fn set_token_status(&self, id: TokenId, status: TokenStatus) -> Result<(), StoreError>;

    /// Swap the channel status only if it currently equals `expected`
    ///
    /// A disable records `reason`; an enable clears it. Returns whether the
    /// swap happened.
    async fn compare_and_set_channel_status(
        &self,
        id: ChannelId,
        expected: ChannelStatus,
        new: ChannelStatus,
        reason: Option<&str>,
    ) -> Result<bool, StoreError>;

    async fn update_channel_response_time(&self, id: ChannelId, millis: i64) -> Result<(), StoreError>;

    async fn update_channel_balance(&self, id: ChannelId, balance: f64) -> Result<(), StoreError>;
}

/// Append-only usage log
#[async_trait]
pub trait UsageLogSink: Send + Sync {
    async fn append(&self, entry: UsageLogEntry) -> Result<(), StoreError>;

    /// Every entry in append order
    async fn entries(&self) -> Result<Vec<UsageLogEntry>, StoreError>;
}
