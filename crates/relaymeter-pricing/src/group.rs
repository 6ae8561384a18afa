use indexmap::IndexMap;
use relaymeter_config::PricingConfig;

/// Per-group multiplier applied on top of the model ratio
#[derive(Debug, Clone)]
pub struct GroupRatios {
    ratios: IndexMap<String, f64>,
}

impl GroupRatios {
    pub const fn new(ratios: IndexMap<String, f64>) -> Self {
        Self { ratios }
    }

    pub fn from_config(config: &PricingConfig) -> Self {
        Self::new(config.groups.clone())
    }

    /// Ratio for `group`; unknown groups are charged at 1.0
    pub fn get(&self, group: &str) -> f64 {
        self.ratios.get(group).copied().unwrap_or_else(|| {
            tracing::warn!(group, "group ratio not found, using 1.0");
            1.0
        })
    }
}

impl Default for GroupRatios {
    fn default() -> Self {
        Self::from_config(&PricingConfig::default())
    }
}
