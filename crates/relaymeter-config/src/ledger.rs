use serde::Deserialize;

/// Quota ledger configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    /// Balance below which the owner gets a one-time reminder
    #[serde(default = "default_quota_remind_threshold")]
    pub quota_remind_threshold: i64,
    /// Tokens added to every reservation estimate
    #[serde(default = "default_pre_consumed_tokens")]
    pub pre_consumed_tokens: u32,
    /// Deadline for a billing commit launched after the response (e.g. "30s")
    #[serde(default = "default_billing_timeout")]
    pub billing_timeout: String,
    /// Deadline for a low-balance notification
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout: String,
    /// Whether charged requests are written to the usage log
    #[serde(default = "default_true")]
    pub consume_log_enabled: bool,
    /// Age after which an unsettled reservation is reported as stale (e.g. "15m")
    #[serde(default = "default_stale_reservation_after")]
    pub stale_reservation_after: String,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            quota_remind_threshold: default_quota_remind_threshold(),
            pre_consumed_tokens: default_pre_consumed_tokens(),
            billing_timeout: default_billing_timeout(),
            notify_timeout: default_notify_timeout(),
            consume_log_enabled: true,
            stale_reservation_after: default_stale_reservation_after(),
        }
    }
}

/// Batch accumulator configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BatchConfig {
    /// Route post-commit deltas through the in-memory accumulator
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Flush interval (e.g. "5s")
    #[serde(default = "default_batch_interval")]
    pub interval: String,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_batch_interval(),
        }
    }
}

/// Background task pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TasksConfig {
    /// Maximum background tasks running at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
        }
    }
}

const fn default_quota_remind_threshold() -> i64 {
    1000
}

const fn default_pre_consumed_tokens() -> u32 {
    500
}

fn default_billing_timeout() -> String {
    "30s".to_owned()
}

fn default_notify_timeout() -> String {
    "10s".to_owned()
}

fn default_stale_reservation_after() -> String {
    "15m".to_owned()
}

fn default_batch_interval() -> String {
    "5s".to_owned()
}

const fn default_max_concurrency() -> usize {
    256
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
