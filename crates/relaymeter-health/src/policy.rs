//! Channel status transition rule
//!
//! [`decide`] is the single predicate used for probes, live relay traffic
//! and balance refreshes, so the same observation always yields the same
//! transition whatever reported it.

use std::time::Duration;

use relaymeter_config::{HealthConfig, SweepScope, parse_duration};
use relaymeter_core::{ChannelStatus, UpstreamError};

use crate::classify::{Outcome, classify};
use crate::error::HealthError;

/// Runtime health settings
#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub auto_disable: bool,
    pub auto_enable: bool,
    /// Latency above which a healthy response still disables the channel
    pub max_latency: Option<Duration>,
    pub probe_interval: Duration,
    pub sweep_interval: Option<Duration>,
    pub sweep_scope: SweepScope,
    pub balance_refresh_interval: Option<Duration>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            auto_disable: true,
            auto_enable: true,
            max_latency: Some(Duration::from_secs(10)),
            probe_interval: Duration::from_secs(1),
            sweep_interval: None,
            sweep_scope: SweepScope::Enabled,
            balance_refresh_interval: None,
        }
    }
}

impl HealthPolicy {
    pub fn from_config(config: &HealthConfig) -> Result<Self, HealthError> {
        let duration = |field: &str, raw: &str| {
            parse_duration(raw).map_err(|e| HealthError::Config(format!("{field}: {e}")))
        };

        let expected = duration("health.expected_latency", &config.expected_latency)?;
        let max_latency = (config.latency_multiple > 0.0).then(|| expected.mul_f64(config.latency_multiple));

        Ok(Self {
            auto_disable: config.auto_disable,
            auto_enable: config.auto_enable,
            max_latency,
            probe_interval: duration("health.probe_interval", &config.probe_interval)?,
            sweep_interval: config
                .sweep_interval
                .as_deref()
                .map(|raw| duration("health.sweep_interval", raw))
                .transpose()?,
            sweep_scope: config.sweep_scope,
            balance_refresh_interval: config
                .balance_refresh_interval
                .as_deref()
                .map(|raw| duration("health.balance_refresh_interval", raw))
                .transpose()?,
        })
    }
}

/// Who reported an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Probe,
    Relay,
    Balance,
}

impl Source {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Probe => "probe",
            Self::Relay => "relay",
            Self::Balance => "balance",
        }
    }
}

/// One outcome of talking to a channel
#[derive(Debug, Clone)]
pub struct Observation {
    pub source: Source,
    pub result: Result<(), UpstreamError>,
    /// Time until the upstream answered
    pub latency: Duration,
    /// Provider-reported balance, when known
    pub balance: Option<f64>,
}

impl Observation {
    pub const fn success(source: Source, latency: Duration) -> Self {
        Self {
            source,
            result: Ok(()),
            latency,
            balance: None,
        }
    }

    pub const fn failure(source: Source, error: UpstreamError, latency: Duration) -> Self {
        Self {
            source,
            result: Err(error),
            latency,
            balance: None,
        }
    }
}

/// Status change requested by an observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Disable(String),
    Enable,
    None,
}

pub fn decide(current: ChannelStatus, observation: &Observation, max_latency: Option<Duration>) -> Transition {
    let unhealthy = match &observation.result {
        Err(error) => match classify(error) {
            Outcome::Fatal(reason) => Some(reason),
            Outcome::Neutral => return Transition::None,
        },
        Ok(()) => slow_or_broke(observation, max_latency),
    };

    match (current, unhealthy) {
        (ChannelStatus::Enabled, Some(reason)) => Transition::Disable(reason),
        (ChannelStatus::Disabled, None) => Transition::Enable,
        _ => Transition::None,
    }
}

fn slow_or_broke(observation: &Observation, max_latency: Option<Duration>) -> Option<String> {
    if let Some(max) = max_latency
        && observation.latency > max
    {
        return Some(format!(
            "response time {}ms exceeds {}ms",
            observation.latency.as_millis(),
            max.as_millis()
        ));
    }
    if observation.balance.is_some_and(|balance| balance <= 0.0) {
        return Some("insufficient balance".to_owned());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: Option<Duration> = Some(Duration::from_secs(10));

    fn auth_error() -> UpstreamError {
        UpstreamError::from_response(401, br#"{"error":{"message":"Incorrect API key provided","code":"invalid_api_key"}}"#)
    }

    #[test]
    fn fatal_error_disables_enabled_channel() {
        for source in [Source::Probe, Source::Relay] {
            let observation = Observation::failure(source, auth_error(), Duration::from_millis(80));
            let Transition::Disable(reason) = decide(ChannelStatus::Enabled, &observation, MAX) else {
                panic!("expected disable");
            };
            assert!(reason.contains("Incorrect API key"));
        }
    }

    #[test]
    fn fatal_error_keeps_disabled_channel_disabled() {
        let observation = Observation::failure(Source::Probe, auth_error(), Duration::ZERO);
        assert_eq!(decide(ChannelStatus::Disabled, &observation, MAX), Transition::None);
    }

    #[test]
    fn neutral_error_changes_nothing() {
        let observation = Observation::failure(
            Source::Probe,
            UpstreamError::from_response(503, b"overloaded"),
            Duration::from_secs(1),
        );
        assert_eq!(decide(ChannelStatus::Enabled, &observation, MAX), Transition::None);
        assert_eq!(decide(ChannelStatus::Disabled, &observation, MAX), Transition::None);
    }

    #[test]
    fn slow_success_disables() {
        let observation = Observation::success(Source::Probe, Duration::from_secs(11));
        assert_eq!(
            decide(ChannelStatus::Enabled, &observation, MAX),
            Transition::Disable("response time 11000ms exceeds 10000ms".to_owned())
        );
        assert_eq!(decide(ChannelStatus::Enabled, &observation, None), Transition::None);
    }

    #[test]
    fn empty_balance_disables() {
        let observation = Observation {
            balance: Some(0.0),
            ..Observation::success(Source::Balance, Duration::ZERO)
        };
        assert_eq!(
            decide(ChannelStatus::Enabled, &observation, MAX),
            Transition::Disable("insufficient balance".to_owned())
        );
    }

    #[test]
    fn clean_success_enables_disabled_channel() {
        let observation = Observation::success(Source::Probe, Duration::from_millis(300));
        assert_eq!(decide(ChannelStatus::Disabled, &observation, MAX), Transition::Enable);
        assert_eq!(decide(ChannelStatus::Enabled, &observation, MAX), Transition::None);

        let slow = Observation::success(Source::Probe, Duration::from_secs(30));
        assert_eq!(decide(ChannelStatus::Disabled, &slow, MAX), Transition::None);
    }

    #[test]
    fn policy_from_default_config() {
        let policy = HealthPolicy::from_config(&HealthConfig::default()).unwrap();
        assert_eq!(policy.max_latency, Some(Duration::from_secs(10)));
        assert_eq!(policy.probe_interval, Duration::from_secs(1));
        assert!(policy.sweep_interval.is_none());

        let config = HealthConfig {
            latency_multiple: 0.0,
            sweep_interval: Some("10m".to_owned()),
            ..HealthConfig::default()
        };
        let policy = HealthPolicy::from_config(&config).unwrap();
        assert_eq!(policy.max_latency, None);
        assert_eq!(policy.sweep_interval, Some(Duration::from_secs(600)));
    }
}
