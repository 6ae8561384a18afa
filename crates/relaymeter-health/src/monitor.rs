//! Probe sweeps, balance refreshes and applied status transitions

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use relaymeter_config::SweepScope;
use relaymeter_core::{Channel, ChannelId, ChannelStatus};
use relaymeter_ledger::QuotaStore;
use relaymeter_telemetry::{Counter, Histogram, KeyValue, metrics};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::HealthError;
use crate::policy::{HealthPolicy, Observation, Source, Transition, decide};
use crate::prober::Prober;

/// Totals of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub probed: usize,
    pub disabled: usize,
    pub enabled: usize,
    /// Channels skipped because a store write failed
    pub failed: usize,
}

/// Totals of one balance refresh
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BalanceReport {
    pub updated: usize,
    pub disabled: usize,
    /// Channels whose backend reports no balance
    pub unsupported: usize,
    pub failed: usize,
}

struct HealthMetrics {
    transitions: Counter<u64>,
    probe_duration: Histogram<f64>,
}

impl HealthMetrics {
    fn new() -> Self {
        let meter = metrics::meter();
        Self {
            transitions: meter
                .u64_counter(metrics::CHANNEL_TRANSITION_COUNT)
                .with_description("Channel status changes")
                .build(),
            probe_duration: meter
                .f64_histogram(metrics::CHANNEL_PROBE_DURATION)
                .with_unit("s")
                .with_description("Latency of synthetic channel probes")
                .build(),
        }
    }
}

/// Applies health transitions to channels
pub struct HealthMonitor {
    store: Arc<dyn QuotaStore>,
    prober: Arc<dyn Prober>,
    policy: HealthPolicy,
    sweeping: AtomicBool,
    metrics: HealthMetrics,
}

/// Clears the single-flight flag when a sweep ends or is dropped
struct SweepGuard<'a>(&'a AtomicBool);

impl Drop for SweepGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn QuotaStore>, prober: Arc<dyn Prober>, policy: HealthPolicy) -> Self {
        Self {
            store,
            prober,
            policy,
            sweeping: AtomicBool::new(false),
            metrics: HealthMetrics::new(),
        }
    }

    pub const fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    /// Feed one observation through the transition rule and apply the result
    ///
    /// Returns the transition that was actually written. A transition lost to
    /// a concurrent writer, or suppressed by `auto_disable`/`auto_enable`,
    /// yields [`Transition::None`].
    pub async fn observe(&self, channel: &Channel, observation: &Observation) -> Result<Transition, HealthError> {
        let transition = decide(channel.status, observation, self.policy.max_latency);

        match transition {
            Transition::None => Ok(Transition::None),
            Transition::Disable(reason) => {
                if !self.policy.auto_disable {
                    tracing::info!(
                        channel_id = %channel.id,
                        channel = %channel.name,
                        reason = %reason,
                        "channel should be disabled, automatic disabling is off"
                    );
                    return Ok(Transition::None);
                }

                let swapped = self
                    .store
                    .compare_and_set_channel_status(
                        channel.id,
                        ChannelStatus::Enabled,
                        ChannelStatus::Disabled,
                        Some(&reason),
                    )
                    .await?;
                if !swapped {
                    tracing::debug!(channel_id = %channel.id, "channel already disabled");
                    return Ok(Transition::None);
                }

                tracing::warn!(
                    channel_id = %channel.id,
                    channel = %channel.name,
                    source = observation.source.as_str(),
                    reason = %reason,
                    "channel disabled"
                );
                self.count_transition("disable", observation.source);
                Ok(Transition::Disable(reason))
            }
            Transition::Enable => {
                if !self.policy.auto_enable {
                    tracing::info!(
                        channel_id = %channel.id,
                        channel = %channel.name,
                        "channel should be enabled, automatic enabling is off"
                    );
                    return Ok(Transition::None);
                }

                let swapped = self
                    .store
                    .compare_and_set_channel_status(channel.id, ChannelStatus::Disabled, ChannelStatus::Enabled, None)
                    .await?;
                if !swapped {
                    return Ok(Transition::None);
                }

                tracing::info!(
                    channel_id = %channel.id,
                    channel = %channel.name,
                    source = observation.source.as_str(),
                    "channel enabled"
                );
                self.count_transition("enable", observation.source);
                Ok(Transition::Enable)
            }
        }
    }

    /// Probe one channel whatever its status; the explicit recovery path
    pub async fn probe_channel(&self, id: ChannelId) -> Result<Transition, HealthError> {
        let channel = self.store.channel(id).await?;
        self.probe(&channel).await
    }

    /// Probe every channel in `scope`, pausing `probe_interval` between probes
    pub async fn sweep(&self, scope: SweepScope) -> Result<SweepReport, HealthError> {
        if self.sweeping.swap(true, Ordering::AcqRel) {
            return Err(HealthError::SweepInProgress);
        }
        let _guard = SweepGuard(&self.sweeping);

        let channels: Vec<Channel> = self
            .store
            .channels()
            .await?
            .into_iter()
            .filter(|channel| in_scope(scope, channel.status))
            .collect();

        tracing::info!(channels = channels.len(), scope = ?scope, "channel sweep started");
        let mut report = SweepReport::default();

        for (i, channel) in channels.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.policy.probe_interval).await;
            }

            report.probed += 1;
            match self.probe(channel).await {
                Ok(Transition::Disable(_)) => report.disabled += 1,
                Ok(Transition::Enable) => report.enabled += 1,
                Ok(Transition::None) => {}
                Err(e) => {
                    tracing::warn!(channel_id = %channel.id, error = %e, "failed to record probe result");
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            probed = report.probed,
            disabled = report.disabled,
            enabled = report.enabled,
            failed = report.failed,
            "channel sweep finished"
        );
        Ok(report)
    }

    /// Store each enabled channel's provider balance and disable empty ones
    pub async fn refresh_balances(&self) -> Result<BalanceReport, HealthError> {
        let mut report = BalanceReport::default();

        for channel in self.store.channels().await? {
            if channel.status != ChannelStatus::Enabled {
                continue;
            }

            let balance = match self.prober.balance(&channel).await {
                Ok(Some(balance)) => balance,
                Ok(None) => {
                    report.unsupported += 1;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(channel_id = %channel.id, error = %e, "failed to fetch channel balance");
                    report.failed += 1;
                    continue;
                }
            };

            if let Err(e) = self.store.update_channel_balance(channel.id, balance).await {
                tracing::warn!(channel_id = %channel.id, error = %e, "failed to store channel balance");
                report.failed += 1;
                continue;
            }
            report.updated += 1;

            let observation = Observation {
                balance: Some(balance),
                ..Observation::success(Source::Balance, Duration::ZERO)
            };
            if let Transition::Disable(_) = self.observe(&channel, &observation).await? {
                report.disabled += 1;
            }
        }

        Ok(report)
    }

    /// Run [`HealthMonitor::sweep`] on the configured interval until `shutdown` fires
    ///
    /// Returns `None` when no sweep interval is configured.
    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.policy.sweep_interval?;
        let monitor = Arc::clone(self);
        let scope = self.policy.sweep_scope;

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    result = monitor.sweep(scope) => {
                        match result {
                            Ok(_) => {}
                            Err(HealthError::SweepInProgress) => tracing::debug!("skipping sweep, previous one still running"),
                            Err(e) => tracing::warn!(error = %e, "channel sweep failed"),
                        }
                    }
                }
            }
            tracing::debug!("channel sweeper stopped");
        }))
    }

    /// Run [`HealthMonitor::refresh_balances`] on the configured interval until `shutdown` fires
    pub fn spawn_balance_refresher(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let period = self.policy.balance_refresh_interval?;
        let monitor = Arc::clone(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    result = monitor.refresh_balances() => {
                        match result {
                            Ok(report) => tracing::debug!(
                                updated = report.updated,
                                disabled = report.disabled,
                                failed = report.failed,
                                "channel balances refreshed"
                            ),
                            Err(e) => tracing::warn!(error = %e, "channel balance refresh failed"),
                        }
                    }
                }
            }
            tracing::debug!("balance refresher stopped");
        }))
    }

    async fn probe(&self, channel: &Channel) -> Result<Transition, HealthError> {
        let start = Instant::now();
        let report = self.prober.probe(channel).await;
        metrics::record_duration(
            &self.metrics.probe_duration,
            start,
            &[KeyValue::new("success", report.result.is_ok())],
        );

        let millis = if report.result.is_ok() {
            i64::try_from(report.latency.as_millis()).unwrap_or(i64::MAX)
        } else {
            0
        };
        self.store.update_channel_response_time(channel.id, millis).await?;

        if let Err(ref e) = report.result {
            tracing::debug!(channel_id = %channel.id, error = %e, "channel probe failed");
        }

        let observation = Observation {
            source: Source::Probe,
            result: report.result,
            latency: report.latency,
            balance: None,
        };
        self.observe(channel, &observation).await
    }

    fn count_transition(&self, transition: &'static str, source: Source) {
        self.metrics.transitions.add(
            1,
            &[
                KeyValue::new("transition", transition),
                KeyValue::new("source", source.as_str()),
            ],
        );
    }
}

const fn in_scope(scope: SweepScope, status: ChannelStatus) -> bool {
    match scope {
        SweepScope::All => true,
        SweepScope::Enabled => matches!(status, ChannelStatus::Enabled),
        SweepScope::Disabled => matches!(status, ChannelStatus::Disabled),
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("policy", &self.policy)
            .field("sweeping", &self.sweeping.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
