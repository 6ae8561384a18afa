use indexmap::IndexMap;
use serde::Deserialize;

/// Global pricing fallbacks and group multipliers
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PricingConfig {
    /// Unit ratio for models no channel or adaptor prices
    #[serde(default = "default_model_ratio")]
    pub fallback_model_ratio: f64,
    /// Completion ratio for models no channel or adaptor prices
    #[serde(default = "default_completion_ratio")]
    pub fallback_completion_ratio: f64,
    /// Multiplier per user group
    #[serde(default = "default_groups")]
    pub groups: IndexMap<String, f64>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            fallback_model_ratio: default_model_ratio(),
            fallback_completion_ratio: default_completion_ratio(),
            groups: default_groups(),
        }
    }
}

const fn default_model_ratio() -> f64 {
    2.5
}

const fn default_completion_ratio() -> f64 {
    1.0
}

fn default_groups() -> IndexMap<String, f64> {
    IndexMap::from([("default".to_owned(), 1.0)])
}
