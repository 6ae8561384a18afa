//! Quota reservations and their settlement
//!
//! A request reserves an estimate with [`Ledger::pre_consume`], then settles
//! the returned [`Reservation`] exactly once with [`Ledger::post_consume`] or
//! [`Ledger::refund`]. Any later settlement of the same reservation is
//! rejected with [`LedgerError::ReservationSettled`].
//!
//! Reservations always hit the store through its conditional decrement. When
//! batching is enabled, the settlement deltas and usage counters are summed
//! in the [`BatchAccumulator`] and written by [`Ledger::flush`].
//!
//! A commit larger than its reservation debits the difference from the user
//! balance, which stops at zero. The uncollected remainder is logged as an
//! overdraft; the token row and the usage log still carry the full charge.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use relaymeter_config::{BatchConfig, LedgerConfig, parse_duration};
use relaymeter_core::{
    ChannelId, LogKind, Quota, TaskPool, Token, TokenId, TokenStatus, UsageLogEntry, User, UserId, unix_now,
};
use relaymeter_telemetry::{Counter, Histogram, KeyValue, metrics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::batch::{BatchAccumulator, DeltaKind};
use crate::error::{LedgerError, StoreError};
use crate::notify::{LogNotifier, QuotaNotice, QuotaNotifier};
use crate::recorder::UsageLogRecorder;
use crate::store::{QuotaStore, ReserveOutcome, UsageLogSink};

/// Runtime ledger settings
#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub quota_remind_threshold: Quota,
    pub notify_timeout: Duration,
    pub consume_log_enabled: bool,
    pub batch_enabled: bool,
    pub flush_interval: Duration,
    /// Age at which an unsettled reservation is reported by the audit
    pub stale_reservation_after: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            quota_remind_threshold: 1000,
            notify_timeout: Duration::from_secs(10),
            consume_log_enabled: true,
            batch_enabled: true,
            flush_interval: Duration::from_secs(5),
            stale_reservation_after: Duration::from_secs(15 * 60),
        }
    }
}

impl LedgerOptions {
    pub fn from_config(ledger: &LedgerConfig, batch: &BatchConfig) -> Result<Self, LedgerError> {
        let duration = |field: &str, raw: &str| {
            parse_duration(raw).map_err(|e| LedgerError::Config(format!("{field}: {e}")))
        };

        Ok(Self {
            quota_remind_threshold: ledger.quota_remind_threshold,
            notify_timeout: duration("ledger.notify_timeout", &ledger.notify_timeout)?,
            consume_log_enabled: ledger.consume_log_enabled,
            batch_enabled: batch.enabled,
            flush_interval: duration("batch.interval", &batch.interval)?,
            stale_reservation_after: duration("ledger.stale_reservation_after", &ledger.stale_reservation_after)?,
        })
    }
}

/// Quota held for one in-flight request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub id: Uuid,
    pub token_id: TokenId,
    pub user_id: UserId,
    pub token_name: String,
    pub amount: Quota,
    pub unlimited: bool,
}

/// Ledger-side record of an unsettled reservation
#[derive(Debug, Clone, Copy)]
struct PendingReservation {
    amount: Quota,
    created_at: tokio::time::Instant,
}

/// Unsettled reservation past the audit age
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleReservation {
    pub id: Uuid,
    pub amount: Quota,
    pub age: Duration,
}

/// Final accounting of a request with a usable response
#[derive(Debug, Clone)]
pub struct Commit {
    /// Quota actually owed for the request
    pub total_charged: Quota,
    pub channel_id: ChannelId,
    pub model_name: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    /// Rates applied, written to the usage log
    pub content: String,
    pub is_stream: bool,
    pub elapsed: Duration,
    pub request_id: String,
}

/// Outcome of one flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Per-id deltas written
    pub applied: usize,
    /// Per-id deltas that failed; retryable ones are queued again
    pub failed: usize,
}

struct LedgerMetrics {
    flush_duration: Histogram<f64>,
    billing_errors: Counter<u64>,
    quota_charged: Counter<u64>,
}

impl LedgerMetrics {
    fn new() -> Self {
        let meter = metrics::meter();
        Self {
            flush_duration: meter
                .f64_histogram(metrics::BATCH_FLUSH_DURATION)
                .with_unit("s")
                .with_description("Time spent writing batched deltas")
                .build(),
            billing_errors: meter
                .u64_counter(metrics::BILLING_ERROR_COUNT)
                .with_description("Failed billing writes")
                .build(),
            quota_charged: meter
                .u64_counter(metrics::BILLING_QUOTA_CHARGED)
                .with_description("Quota charged by settled commits")
                .build(),
        }
    }

    fn billing_error(&self, kind: &'static str) {
        self.billing_errors.add(1, &[KeyValue::new("kind", kind)]);
    }
}

/// Owner of every quota mutation
pub struct Ledger {
    store: Arc<dyn QuotaStore>,
    recorder: UsageLogRecorder,
    batch: Option<Arc<BatchAccumulator>>,
    notifier: Arc<dyn QuotaNotifier>,
    tasks: TaskPool,
    options: LedgerOptions,
    pending: DashMap<Uuid, PendingReservation>,
    metrics: LedgerMetrics,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        usage_log: Arc<dyn UsageLogSink>,
        tasks: TaskPool,
        options: LedgerOptions,
    ) -> Self {
        Self {
            store,
            recorder: UsageLogRecorder::new(usage_log, options.consume_log_enabled),
            batch: options.batch_enabled.then(|| Arc::new(BatchAccumulator::new())),
            notifier: Arc::new(LogNotifier),
            tasks,
            options,
            pending: DashMap::new(),
            metrics: LedgerMetrics::new(),
        }
    }

    /// Replace the default logging notifier
    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn QuotaNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn store(&self) -> &Arc<dyn QuotaStore> {
        &self.store
    }

    pub fn recorder(&self) -> &UsageLogRecorder {
        &self.recorder
    }

    /// Pool that runs billing commits and notifications
    pub const fn tasks(&self) -> &TaskPool {
        &self.tasks
    }

    pub const fn options(&self) -> &LedgerOptions {
        &self.options
    }

    /// Accumulator in front of the store, `None` when batching is off
    pub fn batch(&self) -> Option<&Arc<BatchAccumulator>> {
        self.batch.as_ref()
    }

    /// Number of reservations not yet committed or refunded
    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    /// Unsettled reservations at least `older_than` old, oldest first
    pub fn stale_reservations(&self, older_than: Duration) -> Vec<StaleReservation> {
        let mut stale: Vec<StaleReservation> = self
            .pending
            .iter()
            .filter_map(|entry| {
                let age = entry.created_at.elapsed();
                (age >= older_than).then_some(StaleReservation {
                    id: *entry.key(),
                    amount: entry.amount,
                    age,
                })
            })
            .collect();
        stale.sort_by_key(|reservation| std::cmp::Reverse(reservation.age));
        stale
    }

    /// Log every reservation held past `stale_reservation_after`
    ///
    /// Reports only; a stale reservation stays settleable.
    pub fn audit_reservations(&self) -> usize {
        let stale = self.stale_reservations(self.options.stale_reservation_after);
        for reservation in &stale {
            tracing::warn!(
                reservation = %reservation.id,
                amount = reservation.amount,
                age_s = reservation.age.as_secs(),
                "reservation unsettled past audit age"
            );
        }
        stale.len()
    }

    /// Load a usable token and its owner, checking the model allow-list
    pub async fn authorize(&self, token_id: TokenId, model: &str) -> Result<(Token, User), LedgerError> {
        let token = self.usable_token(token_id).await?;
        if !token.allows_model(model) {
            return Err(LedgerError::ModelNotAllowed {
                name: token.name,
                model: model.to_owned(),
            });
        }
        let user = self.store.user(token.user_id).await?;
        Ok((token, user))
    }

    /// Reserve `amount` from the token and its owner
    pub async fn pre_consume(&self, token_id: TokenId, amount: Quota) -> Result<Reservation, LedgerError> {
        if amount < 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let token = self.usable_token(token_id).await?;

        match self
            .store
            .reserve(token.id, token.user_id, amount, token.unlimited)
            .await?
        {
            ReserveOutcome::Reserved { user_quota_before } => {
                self.remind(token.user_id, user_quota_before, amount);
            }
            ReserveOutcome::InsufficientToken { remaining } => {
                return Err(LedgerError::InsufficientTokenQuota {
                    remaining,
                    requested: amount,
                });
            }
            ReserveOutcome::InsufficientUser { balance } => {
                return Err(LedgerError::InsufficientUserQuota {
                    balance,
                    requested: amount,
                });
            }
        }

        let reservation = Reservation {
            id: Uuid::new_v4(),
            token_id: token.id,
            user_id: token.user_id,
            token_name: token.name,
            amount,
            unlimited: token.unlimited,
        };
        self.pending.insert(
            reservation.id,
            PendingReservation {
                amount,
                created_at: tokio::time::Instant::now(),
            },
        );

        tracing::debug!(
            reservation = %reservation.id,
            token_id = %token_id,
            amount,
            "quota reserved"
        );

        Ok(reservation)
    }

    /// Settle a reservation against the actual charge and write the usage log
    ///
    /// The usage log entry is written even when a balance update fails; the
    /// first failure is returned afterwards.
    pub async fn post_consume(&self, reservation: &Reservation, commit: Commit) -> Result<(), LedgerError> {
        let reserved = self.settle(reservation)?;
        let delta = commit.total_charged - reserved;
        let mut first_error: Option<StoreError> = None;

        if let Err(e) = self.apply_quota_delta(reservation, delta).await {
            tracing::error!(
                error = %e,
                reservation = %reservation.id,
                token_id = %reservation.token_id,
                delta,
                "failed to apply post-consume quota delta"
            );
            self.metrics.billing_error("database");
            first_error.get_or_insert(e);
        }

        let entry = UsageLogEntry {
            kind: LogKind::Consume,
            request_id: commit.request_id.clone(),
            user_id: Some(reservation.user_id),
            channel_id: commit.channel_id,
            token_name: reservation.token_name.clone(),
            model_name: commit.model_name,
            prompt_tokens: commit.prompt_tokens,
            completion_tokens: commit.completion_tokens,
            quota: commit.total_charged,
            elapsed_ms: u64::try_from(commit.elapsed.as_millis()).unwrap_or(u64::MAX),
            is_stream: commit.is_stream,
            created_at: unix_now(),
            content: commit.content,
        };
        if let Err(e) = self.recorder.record(entry).await {
            self.metrics.billing_error("usage_log");
            first_error.get_or_insert(e);
        }

        if commit.total_charged > 0 {
            if let Err(e) = self
                .add_usage(reservation.user_id, commit.channel_id, commit.total_charged)
                .await
            {
                tracing::error!(
                    error = %e,
                    user_id = %reservation.user_id,
                    channel_id = %commit.channel_id,
                    "failed to record used quota"
                );
                self.metrics.billing_error("database");
                first_error.get_or_insert(e);
            }
            self.metrics
                .quota_charged
                .add(u64::try_from(commit.total_charged).unwrap_or(0), &[]);
        } else {
            tracing::error!(
                request_id = %commit.request_id,
                quota = commit.total_charged,
                "charged quota is not positive, something is wrong"
            );
            self.metrics.billing_error("calculation");
        }

        tracing::debug!(
            reservation = %reservation.id,
            reserved,
            charged = commit.total_charged,
            "reservation committed"
        );

        first_error.map_or(Ok(()), |e| Err(e.into()))
    }

    /// Return the full reserved amount; writes no usage log entry
    ///
    /// Succeeds whatever the token status is now.
    pub async fn refund(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        let reserved = self.settle(reservation)?;

        self.apply_quota_delta(reservation, -reserved)
            .await
            .inspect_err(|e| {
                tracing::error!(
                    error = %e,
                    reservation = %reservation.id,
                    amount = reserved,
                    "failed to refund reserved quota"
                );
                self.metrics.billing_error("refund");
            })?;

        tracing::debug!(reservation = %reservation.id, amount = reserved, "reservation refunded");
        Ok(())
    }

    /// Write every batched delta to the store
    pub async fn flush(&self) -> FlushReport {
        let Some(ref batch) = self.batch else {
            return FlushReport::default();
        };

        let start = Instant::now();
        let mut report = FlushReport::default();

        for kind in DeltaKind::ALL {
            for (id, delta) in batch.drain(kind) {
                match self.apply_batched(kind, id, delta).await {
                    Ok(()) => report.applied += 1,
                    Err(e @ StoreError::NotFound { .. }) => {
                        tracing::error!(error = %e, kind = kind.as_str(), id, delta, "dropping batched delta");
                        report.failed += 1;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, kind = kind.as_str(), id, delta, "failed to apply batched delta");
                        batch.add(kind, id, delta);
                        report.failed += 1;
                    }
                }
            }
        }

        metrics::record_duration(&self.metrics.flush_duration, start, &[]);
        if report.applied + report.failed > 0 {
            tracing::info!(
                applied = report.applied,
                failed = report.failed,
                elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX),
                "batch update finished"
            );
        }

        report
    }

    /// Wait for background billing work, then flush what it produced
    pub async fn shutdown(&self) -> FlushReport {
        self.tasks.drain().await;
        self.flush().await
    }

    /// Run [`Ledger::flush`] and [`Ledger::audit_reservations`] every flush
    /// interval until `shutdown` fires
    ///
    /// On cancellation the loop drains the task pool and flushes once more.
    pub fn spawn_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let ledger = Arc::clone(self);
        let period = self.options.flush_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        ledger.flush().await;
                        ledger.audit_reservations();
                    }
                }
            }

            let report = ledger.shutdown().await;
            tracing::info!(applied = report.applied, failed = report.failed, "final batch flush complete");
        })
    }

    async fn usable_token(&self, token_id: TokenId) -> Result<Token, LedgerError> {
        let token = match self.store.token(token_id).await {
            Ok(token) => token,
            Err(StoreError::NotFound { .. }) => return Err(LedgerError::TokenNotFound(token_id)),
            Err(e) => return Err(e.into()),
        };

        if token.status != TokenStatus::Enabled {
            return Err(LedgerError::TokenUnusable {
                name: token.name,
                status: token.status,
            });
        }

        let stale = if token.is_expired_at(unix_now()) {
            Some(TokenStatus::Expired)
        } else if !token.unlimited && token.remaining_quota <= 0 {
            Some(TokenStatus::Exhausted)
        } else {
            None
        };

        if let Some(status) = stale {
            if let Err(e) = self.store.set_token_status(token.id, status).await {
                tracing::error!(error = %e, token_id = %token.id, status = %status, "failed to update token status");
            }
            return Err(LedgerError::TokenUnusable {
                name: token.name,
                status,
            });
        }

        Ok(token)
    }

    fn settle(&self, reservation: &Reservation) -> Result<Quota, LedgerError> {
        self.pending
            .remove(&reservation.id)
            .map(|(_, pending)| pending.amount)
            .ok_or(LedgerError::ReservationSettled(reservation.id))
    }

    fn remind(&self, user_id: UserId, balance_before: Quota, amount: Quota) {
        let Some(notice) = QuotaNotice::check(
            user_id,
            balance_before,
            amount,
            self.options.quota_remind_threshold,
        ) else {
            return;
        };

        let notifier = Arc::clone(&self.notifier);
        self.tasks
            .spawn_with_deadline("quota_notify", self.options.notify_timeout, async move {
                if let Err(e) = notifier.notify(notice).await {
                    tracing::warn!(error = %e, user_id = %user_id, "failed to send quota reminder");
                }
            });
    }

    /// Positive `delta` spends more, negative gives quota back
    async fn apply_quota_delta(&self, reservation: &Reservation, delta: Quota) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }

        if let Some(ref batch) = self.batch {
            batch.add(DeltaKind::UserQuota, reservation.user_id.0, -delta);
            if !reservation.unlimited {
                batch.add(DeltaKind::TokenQuota, reservation.token_id.0, -delta);
            }
            return Ok(());
        }

        let applied = self.store.adjust_user_quota(reservation.user_id, -delta).await?;
        self.check_overdraft(reservation.user_id, -delta, applied);
        if !reservation.unlimited {
            self.store
                .adjust_token_quota(reservation.token_id, -delta)
                .await?;
        }
        Ok(())
    }

    fn check_overdraft(&self, user_id: UserId, requested: Quota, applied: Quota) {
        if applied == requested {
            return;
        }
        tracing::warn!(
            user_id = %user_id,
            requested,
            applied,
            shortfall = applied - requested,
            "debit exceeded user balance, balance stopped at zero"
        );
        self.metrics.billing_error("overdraft");
    }

    async fn add_usage(&self, user_id: UserId, channel_id: ChannelId, quota: Quota) -> Result<(), StoreError> {
        if let Some(ref batch) = self.batch {
            batch.add(DeltaKind::UsedQuota, user_id.0, quota);
            batch.add(DeltaKind::RequestCount, user_id.0, 1);
            batch.add(DeltaKind::ChannelUsedQuota, channel_id.0, quota);
            return Ok(());
        }

        self.store.add_user_used_quota(user_id, quota).await?;
        self.store.add_user_request_count(user_id, 1).await?;
        self.store.add_channel_used_quota(channel_id, quota).await
    }

    async fn apply_batched(&self, kind: DeltaKind, id: i64, delta: i64) -> Result<(), StoreError> {
        match kind {
            DeltaKind::UserQuota => {
                let applied = self.store.adjust_user_quota(UserId(id), delta).await?;
                self.check_overdraft(UserId(id), delta, applied);
                Ok(())
            }
            DeltaKind::TokenQuota => self.store.adjust_token_quota(TokenId(id), delta).await,
            DeltaKind::UsedQuota => self.store.add_user_used_quota(UserId(id), delta).await,
            DeltaKind::ChannelUsedQuota => self.store.add_channel_used_quota(ChannelId(id), delta).await,
            DeltaKind::RequestCount => self.store.add_user_request_count(UserId(id), delta).await,
        }
    }
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("batch_enabled", &self.batch.is_some())
            .field("in_flight", &self.pending.len())
            .field("tasks", &self.tasks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use relaymeter_core::Channel;

    use super::*;
    use crate::error::NotifyError;
    use crate::notify::QuotaReminder;
    use crate::storage::MemoryStore;

    fn seeded(token_quota: Quota, user_quota: Quota) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert_user(User {
            id: UserId(1),
            group: "default".to_owned(),
            quota: user_quota,
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
        store.insert_channel(Channel::new(ChannelId(1), "primary", "openai"));
        store
    }

    fn ledger(store: &Arc<MemoryStore>, batch_enabled: bool) -> Ledger {
        Ledger::new(
            store.clone(),
            store.clone(),
            TaskPool::new(16),
            LedgerOptions {
                batch_enabled,
                ..LedgerOptions::default()
            },
        )
    }

    fn commit(total_charged: Quota) -> Commit {
        Commit {
            total_charged,
            channel_id: ChannelId(1),
            model_name: "gpt-4o-mini".to_owned(),
            prompt_tokens: 30,
            completion_tokens: 10,
            content: "model rate 1.00, group rate 1.00, completion rate 1.00".to_owned(),
            is_stream: false,
            elapsed: Duration::from_millis(120),
            request_id: "req-1".to_owned(),
        }
    }

    async fn balances(store: &MemoryStore) -> (Quota, Quota) {
        (
            store.token(TokenId(1)).await.unwrap().remaining_quota,
            store.user(UserId(1)).await.unwrap().quota,
        )
    }

    #[tokio::test]
    async fn commit_settles_to_actual_charge() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        assert_eq!(balances(&store).await, (50, 950));

        ledger.post_consume(&reservation, commit(40)).await.unwrap();
        assert_eq!(balances(&store).await, (60, 960));

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quota, 40);
        assert_eq!(entries[0].kind, LogKind::Consume);
        assert_eq!(entries[0].user_id, Some(UserId(1)));

        let user = store.user(UserId(1)).await.unwrap();
        assert_eq!(user.used_quota, 40);
        assert_eq!(user.request_count, 1);
        assert_eq!(store.token(TokenId(1)).await.unwrap().used_quota, 40);
        assert_eq!(store.channel(ChannelId(1)).await.unwrap().used_quota, 40);
        assert_eq!(ledger.in_flight(), 0);
    }

    #[tokio::test]
    async fn refund_restores_reservation_without_log() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        ledger.refund(&reservation).await.unwrap();

        assert_eq!(balances(&store).await, (100, 1000));
        assert!(store.entries().await.unwrap().is_empty());
        assert_eq!(store.token(TokenId(1)).await.unwrap().used_quota, 0);
    }

    #[tokio::test]
    async fn second_settlement_is_rejected() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        ledger.post_consume(&reservation, commit(40)).await.unwrap();

        let again = ledger.post_consume(&reservation, commit(40)).await;
        assert!(matches!(again, Err(LedgerError::ReservationSettled(id)) if id == reservation.id));
        let refund = ledger.refund(&reservation).await;
        assert!(matches!(refund, Err(LedgerError::ReservationSettled(_))));

        assert_eq!(balances(&store).await, (60, 960));
        assert_eq!(store.entries().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn net_debit_equals_charge() {
        for charged in [0, 1, 49, 50, 51, 80] {
            let store = seeded(100, 1000);
            let ledger = ledger(&store, false);

            let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
            ledger.post_consume(&reservation, commit(charged)).await.unwrap();

            let (token, user) = balances(&store).await;
            assert_eq!(100 - token, charged);
            assert_eq!(1000 - user, charged);
        }
    }

    #[tokio::test]
    async fn overrun_stops_user_balance_at_zero() {
        for batch_enabled in [false, true] {
            let store = seeded(5000, 100);
            let ledger = ledger(&store, batch_enabled);

            let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
            ledger.post_consume(&reservation, commit(500)).await.unwrap();
            ledger.flush().await;

            // the token row and the log carry the full charge
            assert_eq!(balances(&store).await, (4500, 0));
            assert_eq!(store.token(TokenId(1)).await.unwrap().used_quota, 500);
            assert_eq!(store.entries().await.unwrap()[0].quota, 500);
            assert_eq!(store.user(UserId(1)).await.unwrap().used_quota, 500);

            assert!(matches!(
                ledger.pre_consume(TokenId(1), 1).await,
                Err(LedgerError::InsufficientUserQuota { balance: 0, .. })
            ));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_reservations_never_overdraw_token() {
        let store = seeded(100, 1_000_000);
        let ledger = Arc::new(ledger(&store, false));

        let handles: Vec<_> = (0..200)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move { ledger.pre_consume(TokenId(1), 7).await })
            })
            .collect();

        let mut reserved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => reserved += 1,
                Err(LedgerError::InsufficientTokenQuota { requested: 7, remaining }) => assert!(remaining < 7),
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(reserved, 14);
        assert_eq!(ledger.in_flight(), 14);
        assert_eq!(balances(&store).await, (2, 1_000_000 - 98));
    }

    #[tokio::test]
    async fn reservation_is_bounded_by_token_and_user() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let err = ledger.pre_consume(TokenId(1), 101).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientTokenQuota {
                remaining: 100,
                requested: 101
            }
        ));

        let store = seeded(5000, 80);
        let ledger_small_user = self::ledger(&store, false);
        let err = ledger_small_user.pre_consume(TokenId(1), 81).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientUserQuota { balance: 80, .. }));
        // token decrement rolled back
        assert_eq!(balances(&store).await, (5000, 80));

        assert!(ledger_small_user.pre_consume(TokenId(1), 80).await.is_ok());
    }

    #[tokio::test]
    async fn unlimited_token_debits_only_user() {
        let store = seeded(0, 1000);
        let mut token = store.token(TokenId(1)).await.unwrap();
        token.unlimited = true;
        store.insert_token(token);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 1000).await.unwrap();
        assert!(reservation.unlimited);
        ledger.post_consume(&reservation, commit(300)).await.unwrap();

        assert_eq!(balances(&store).await, (0, 700));
        assert_eq!(store.token(TokenId(1)).await.unwrap().used_quota, 0);
    }

    #[tokio::test]
    async fn batched_deltas_land_on_flush() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, true);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        assert_eq!(balances(&store).await, (50, 950));

        ledger.post_consume(&reservation, commit(40)).await.unwrap();
        // settlement delta is still pending
        assert_eq!(balances(&store).await, (50, 950));
        assert_eq!(store.entries().await.unwrap().len(), 1);

        let report = ledger.flush().await;
        assert_eq!(report.failed, 0);
        assert_eq!(report.applied, 5);
        assert_eq!(balances(&store).await, (60, 960));

        let user = store.user(UserId(1)).await.unwrap();
        assert_eq!(user.used_quota, 40);
        assert_eq!(user.request_count, 1);
        assert_eq!(store.channel(ChannelId(1)).await.unwrap().used_quota, 40);
        assert!(ledger.batch().unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_commits_flush_as_one_sum() {
        let store = seeded(1_000_000, 1_000_000);
        let ledger = Arc::new(ledger(&store, true));

        let handles: Vec<_> = (0..50)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                tokio::spawn(async move {
                    let reservation = ledger.pre_consume(TokenId(1), 10).await.unwrap();
                    ledger.post_consume(&reservation, commit(7)).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let batch = ledger.batch().unwrap();
        assert_eq!(batch.pending(DeltaKind::UserQuota, 1), Some(150));
        assert_eq!(batch.pending(DeltaKind::RequestCount, 1), Some(50));

        let report = ledger.flush().await;
        assert_eq!(report.applied, 5);
        assert_eq!(balances(&store).await, (1_000_000 - 350, 1_000_000 - 350));
        assert_eq!(store.user(UserId(1)).await.unwrap().request_count, 50);
        assert_eq!(store.channel(ChannelId(1)).await.unwrap().used_quota, 350);
    }

    #[tokio::test]
    async fn flush_drops_deltas_for_missing_rows() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, true);
        let batch = ledger.batch().unwrap();

        batch.add(DeltaKind::ChannelUsedQuota, 99, 10);
        batch.add(DeltaKind::UsedQuota, 1, 5);

        let report = ledger.flush().await;
        assert_eq!(report.applied, 1);
        assert_eq!(report.failed, 1);
        // rows that do not exist are dropped rather than retried forever
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn expired_token_is_marked() {
        let store = seeded(100, 1000);
        let mut token = store.token(TokenId(1)).await.unwrap();
        token.expires_at = Some(1);
        store.insert_token(token);
        let ledger = ledger(&store, false);

        let err = ledger.pre_consume(TokenId(1), 10).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::TokenUnusable {
                status: TokenStatus::Expired,
                ..
            }
        ));
        assert_eq!(store.token(TokenId(1)).await.unwrap().status, TokenStatus::Expired);
        assert_eq!(balances(&store).await, (100, 1000));
    }

    #[tokio::test]
    async fn empty_token_is_marked_exhausted() {
        let store = seeded(0, 1000);
        let ledger = ledger(&store, false);

        let err = ledger.pre_consume(TokenId(1), 10).await.unwrap_err();
        assert!(matches!(
            err,
            LedgerError::TokenUnusable {
                status: TokenStatus::Exhausted,
                ..
            }
        ));
        assert_eq!(store.token(TokenId(1)).await.unwrap().status, TokenStatus::Exhausted);
    }

    #[tokio::test]
    async fn refund_ignores_later_status_change() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        store.set_token_status(TokenId(1), TokenStatus::Disabled).await.unwrap();

        assert!(matches!(
            ledger.pre_consume(TokenId(1), 1).await,
            Err(LedgerError::TokenUnusable {
                status: TokenStatus::Disabled,
                ..
            })
        ));
        ledger.refund(&reservation).await.unwrap();
        assert_eq!(balances(&store).await, (100, 1000));
    }

    #[tokio::test]
    async fn authorize_checks_model_allow_list() {
        let store = seeded(100, 1000);
        let mut token = store.token(TokenId(1)).await.unwrap();
        token.models = Some(vec!["gpt-4o".to_owned()]);
        store.insert_token(token);
        let ledger = ledger(&store, false);

        let (token, user) = ledger.authorize(TokenId(1), "gpt-4o").await.unwrap();
        assert_eq!(token.id, TokenId(1));
        assert_eq!(user.group, "default");

        let err = ledger.authorize(TokenId(1), "o1").await.unwrap_err();
        assert!(matches!(err, LedgerError::ModelNotAllowed { .. }));
    }

    #[tokio::test]
    async fn unknown_token_and_negative_amount() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        assert!(matches!(
            ledger.pre_consume(TokenId(404), 1).await,
            Err(LedgerError::TokenNotFound(TokenId(404)))
        ));
        assert!(matches!(
            ledger.pre_consume(TokenId(1), -5).await,
            Err(LedgerError::InvalidAmount(-5))
        ));
    }

    #[tokio::test]
    async fn zero_charge_commit_is_still_logged() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        ledger.post_consume(&reservation, commit(0)).await.unwrap();

        let entries = store.entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].quota, 0);
        assert_eq!(store.user(UserId(1)).await.unwrap().request_count, 0);
        assert_eq!(balances(&store).await, (100, 1000));
    }

    #[derive(Default)]
    struct RecordingNotifier(Mutex<Vec<QuotaNotice>>);

    #[async_trait]
    impl QuotaNotifier for RecordingNotifier {
        async fn notify(&self, notice: QuotaNotice) -> Result<(), NotifyError> {
            self.0.lock().unwrap().push(notice);
            Err(NotifyError("smtp unavailable".to_owned()))
        }
    }

    #[tokio::test]
    async fn crossing_threshold_sends_reminder() {
        let store = seeded(5000, 1010);
        let notifier = Arc::new(RecordingNotifier::default());
        let ledger = ledger(&store, false).with_notifier(notifier.clone());

        // notifier failure never fails the reservation
        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        ledger.tasks().drain().await;

        let notices = notifier.0.lock().unwrap().clone();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].reminder, QuotaReminder::Low);
        assert_eq!(notices[0].balance_after, 960);

        ledger.refund(&reservation).await.unwrap();
    }

    #[tokio::test]
    async fn flusher_flushes_on_shutdown() {
        let store = seeded(100, 1000);
        let ledger = Arc::new(Ledger::new(
            store.clone(),
            store.clone(),
            TaskPool::new(4),
            LedgerOptions {
                flush_interval: Duration::from_secs(3600),
                ..LedgerOptions::default()
            },
        ));

        let shutdown = CancellationToken::new();
        let flusher = ledger.spawn_flusher(shutdown.clone());

        let reservation = ledger.pre_consume(TokenId(1), 50).await.unwrap();
        ledger.post_consume(&reservation, commit(40)).await.unwrap();
        assert_eq!(balances(&store).await, (50, 950));

        shutdown.cancel();
        flusher.await.unwrap();
        assert_eq!(balances(&store).await, (60, 960));
    }

    #[tokio::test(start_paused = true)]
    async fn long_held_reservation_is_reported_until_settled() {
        let store = seeded(100, 1000);
        let ledger = ledger(&store, false);

        let old = ledger.pre_consume(TokenId(1), 10).await.unwrap();
        tokio::time::advance(Duration::from_secs(20 * 60)).await;
        let fresh = ledger.pre_consume(TokenId(1), 20).await.unwrap();

        assert_eq!(ledger.audit_reservations(), 1);
        let stale = ledger.stale_reservations(Duration::from_secs(60));
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, old.id);
        assert_eq!(stale[0].amount, 10);
        assert!(stale[0].age >= Duration::from_secs(20 * 60));
        assert_eq!(ledger.stale_reservations(Duration::ZERO).len(), 2);

        ledger.refund(&old).await.unwrap();
        assert_eq!(ledger.audit_reservations(), 0);
        ledger.refund(&fresh).await.unwrap();
    }

    #[test]
    fn options_parse_from_config() {
        let options = LedgerOptions::from_config(&LedgerConfig::default(), &BatchConfig::default()).unwrap();
        assert_eq!(options.flush_interval, Duration::from_secs(5));
        assert_eq!(options.notify_timeout, Duration::from_secs(10));
        assert_eq!(options.stale_reservation_after, Duration::from_secs(15 * 60));
        assert!(options.batch_enabled);
    }
}
