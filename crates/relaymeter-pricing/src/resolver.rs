//! Three-tier model price lookup
//!
//! Each ratio is looked up independently: channel override, then the
//! backend's declared table, then the configured fallback. Resolution never
//! fails.

use std::collections::HashMap;

use relaymeter_config::PricingConfig;
use relaymeter_core::ChannelPricing;
use serde::{Deserialize, Serialize};

/// Unit price and completion multiplier for one model
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub model_ratio: f64,
    pub completion_ratio: f64,
}

impl ModelPrice {
    pub const fn new(model_ratio: f64, completion_ratio: f64) -> Self {
        Self {
            model_ratio,
            completion_ratio,
        }
    }
}

/// Pricing declared by a backend adaptor
pub trait PricingSource: Send + Sync {
    /// Full default pricing table for this backend
    fn default_model_pricing(&self) -> HashMap<String, ModelPrice>;

    /// Unit ratio for a single model, `None` when the backend does not price it
    fn model_ratio(&self, model: &str) -> Option<f64> {
        self.default_model_pricing().get(model).map(|price| price.model_ratio)
    }

    /// Completion ratio for a single model, `None` when the backend does not price it
    fn completion_ratio(&self, model: &str) -> Option<f64> {
        self.default_model_pricing()
            .get(model)
            .map(|price| price.completion_ratio)
    }
}

/// Which tier supplied a ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceTier {
    Channel,
    Backend,
    Fallback,
}

/// Outcome of a resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedPrice {
    pub model_ratio: f64,
    pub completion_ratio: f64,
    pub model_tier: PriceTier,
    pub completion_tier: PriceTier,
}

/// Resolves prices against the configured global fallback
#[derive(Debug, Clone, Copy)]
pub struct PricingResolver {
    fallback: ModelPrice,
}

impl PricingResolver {
    pub const fn new(fallback: ModelPrice) -> Self {
        Self { fallback }
    }

    pub const fn from_config(config: &PricingConfig) -> Self {
        Self::new(ModelPrice::new(
            config.fallback_model_ratio,
            config.fallback_completion_ratio,
        ))
    }

    /// Resolve the unit and completion ratios for `model`
    pub fn resolve(
        &self,
        model: &str,
        channel: &ChannelPricing,
        backend: Option<&dyn PricingSource>,
    ) -> ResolvedPrice {
        let (model_ratio, model_tier) = pick(
            channel.model_ratio.get(model).copied(),
            backend.and_then(|source| source.model_ratio(model)),
            self.fallback.model_ratio,
        );
        let (completion_ratio, completion_tier) = pick(
            channel.completion_ratio.get(model).copied(),
            backend.and_then(|source| source.completion_ratio(model)),
            self.fallback.completion_ratio,
        );

        if model_tier == PriceTier::Fallback {
            tracing::debug!(model, model_ratio, "no price declared for model, using fallback");
        }

        ResolvedPrice {
            model_ratio,
            completion_ratio,
            model_tier,
            completion_tier,
        }
    }
}

impl Default for PricingResolver {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}

fn pick(channel: Option<f64>, backend: Option<f64>, fallback: f64) -> (f64, PriceTier) {
    channel.map_or_else(
        || backend.map_or((fallback, PriceTier::Fallback), |ratio| (ratio, PriceTier::Backend)),
        |ratio| (ratio, PriceTier::Channel),
    )
}
