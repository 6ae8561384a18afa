use serde::Deserialize;

/// Channel health monitor configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HealthConfig {
    /// Disable channels on fatal errors, slow probes or empty balances
    #[serde(default = "default_true")]
    pub auto_disable: bool,
    /// Re-enable disabled channels after a clean probe
    #[serde(default = "default_true")]
    pub auto_enable: bool,
    /// Interval between periodic sweeps; omit to turn the sweep off
    #[serde(default)]
    pub sweep_interval: Option<String>,
    /// Which channels the periodic sweep probes
    #[serde(default)]
    pub sweep_scope: SweepScope,
    /// Pause between two probes of one sweep
    #[serde(default = "default_probe_interval")]
    pub probe_interval: String,
    /// Latency a healthy channel is expected to answer within
    #[serde(default = "default_expected_latency")]
    pub expected_latency: String,
    /// Multiple of `expected_latency` above which a channel is disabled; 0 turns the check off
    #[serde(default = "default_latency_multiple")]
    pub latency_multiple: f64,
    /// Interval between provider balance refreshes; omit to turn it off
    #[serde(default)]
    pub balance_refresh_interval: Option<String>,
    /// Model used by probes when the channel lists none
    #[serde(default = "default_test_model")]
    pub test_model: String,
    /// Prompt sent by probes
    #[serde(default = "default_test_prompt")]
    pub test_prompt: String,
    /// Completion budget of a probe
    #[serde(default = "default_test_max_tokens")]
    pub test_max_tokens: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            auto_disable: true,
            auto_enable: true,
            sweep_interval: None,
            sweep_scope: SweepScope::default(),
            probe_interval: default_probe_interval(),
            expected_latency: default_expected_latency(),
            latency_multiple: default_latency_multiple(),
            balance_refresh_interval: None,
            test_model: default_test_model(),
            test_prompt: default_test_prompt(),
            test_max_tokens: default_test_max_tokens(),
        }
    }
}

/// Channel selection for a sweep
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SweepScope {
    /// Only enabled channels, to spot failures
    #[default]
    Enabled,
    /// Only disabled channels, to spot recoveries
    Disabled,
    /// Every channel
    All,
}

fn default_probe_interval() -> String {
    "1s".to_owned()
}

fn default_expected_latency() -> String {
    "5s".to_owned()
}

const fn default_latency_multiple() -> f64 {
    2.0
}

fn default_test_model() -> String {
    "gpt-4o-mini".to_owned()
}

fn default_test_prompt() -> String {
    "Output only your specific model name with no additional text.".to_owned()
}

const fn default_test_max_tokens() -> u32 {
    16
}

#[allow(clippy::missing_const_for_fn)]
fn default_true() -> bool {
    true
}
