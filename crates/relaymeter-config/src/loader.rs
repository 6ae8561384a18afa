use std::path::Path;
use std::time::Duration;

use crate::{Config, StorageConfig, parse_duration};

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Reads the file, expands `{{ env.VAR }}` placeholders, then
    /// deserializes and validates the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, a placeholder cannot be
    /// resolved, TOML parsing fails, or validation fails
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config file {}: {e}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration text
    ///
    /// # Errors
    ///
    /// Returns an error if expansion, parsing or validation fails
    pub fn from_toml(raw: &str) -> anyhow::Result<Self> {
        let expanded =
            crate::env::expand_env(raw).map_err(|e| anyhow::anyhow!("config variable expansion failed: {e}"))?;

        let config: Self = toml::from_str(&expanded).map_err(|e| anyhow::anyhow!("failed to parse config: {e}"))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate that the configuration is internally consistent
    ///
    /// # Errors
    ///
    /// Returns an error on unparsable durations, negative ratios or an
    /// unusable storage section
    pub fn validate(&self) -> anyhow::Result<()> {
        self.validate_durations()?;
        self.validate_pricing()?;
        self.validate_storage()?;

        if self.tasks.max_concurrency == 0 {
            anyhow::bail!("tasks.max_concurrency must be greater than 0");
        }
        if let Some(ref exporter) = self.telemetry.exporter
            && !(0.0..=1.0).contains(&exporter.sampling_ratio)
        {
            anyhow::bail!("telemetry.exporter.sampling_ratio must be between 0 and 1");
        }

        Ok(())
    }

    fn validate_durations(&self) -> anyhow::Result<()> {
        let mut checks = vec![
            ("ledger.billing_timeout", self.ledger.billing_timeout.as_str()),
            ("ledger.notify_timeout", self.ledger.notify_timeout.as_str()),
            ("ledger.stale_reservation_after", self.ledger.stale_reservation_after.as_str()),
            ("batch.interval", self.batch.interval.as_str()),
            ("health.probe_interval", self.health.probe_interval.as_str()),
            ("health.expected_latency", self.health.expected_latency.as_str()),
        ];
        if let Some(ref raw) = self.health.sweep_interval {
            checks.push(("health.sweep_interval", raw));
        }
        if let Some(ref raw) = self.health.balance_refresh_interval {
            checks.push(("health.balance_refresh_interval", raw));
        }

        for (field, raw) in checks {
            let parsed = parse_duration(raw).map_err(|e| anyhow::anyhow!("{field}: {e}"))?;
            if parsed == Duration::ZERO && field != "health.probe_interval" {
                anyhow::bail!("{field} must be greater than zero");
            }
        }

        Ok(())
    }

    fn validate_pricing(&self) -> anyhow::Result<()> {
        if self.pricing.fallback_model_ratio < 0.0 || self.pricing.fallback_completion_ratio < 0.0 {
            anyhow::bail!("pricing fallback ratios must not be negative");
        }
        if let Some((group, _)) = self.pricing.groups.iter().find(|(_, ratio)| **ratio < 0.0) {
            anyhow::bail!("pricing.groups.{group} must not be negative");
        }
        if self.health.latency_multiple < 0.0 {
            anyhow::bail!("health.latency_multiple must not be negative");
        }
        Ok(())
    }

    fn validate_storage(&self) -> anyhow::Result<()> {
        if let StorageConfig::Redis(ref redis) = self.storage {
            if !matches!(redis.url.scheme(), "redis" | "rediss") {
                anyhow::bail!("storage.url must use the redis:// or rediss:// scheme");
            }
            if redis.key_prefix.is_empty() {
                anyhow::bail!("storage.key_prefix must not be empty");
            }
        } else {
            tracing::debug!("using in-memory storage, balances are lost on restart");
        }
        Ok(())
    }
}
