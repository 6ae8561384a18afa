//! Configuration for relaymeter
//!
//! One TOML file, environment placeholders expanded before parsing.

#![allow(clippy::must_use_candidate, clippy::missing_errors_doc)]

mod env;
pub mod health;
pub mod ledger;
mod loader;
pub mod pricing;
pub mod storage;
pub mod telemetry;

use serde::Deserialize;

pub use health::{HealthConfig, SweepScope};
pub use ledger::{BatchConfig, LedgerConfig, TasksConfig};
pub use pricing::PricingConfig;
pub use storage::{RedisStorageConfig, StorageConfig};
pub use telemetry::{ExportProtocol, ExporterConfig, TelemetryConfig};

/// Top-level relaymeter configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Parse a human duration such as `"30s"` or `"5m"`
pub fn parse_duration(raw: &str) -> anyhow::Result<std::time::Duration> {
    duration_str::parse(raw).map_err(|e| anyhow::anyhow!("invalid duration '{raw}': {e}"))
}
