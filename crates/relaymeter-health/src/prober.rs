use std::time::Duration;

use async_trait::async_trait;
use relaymeter_core::{Channel, UpstreamError};

/// Result of one synthetic request
#[derive(Debug, Clone)]
pub struct ProbeReport {
    pub result: Result<(), UpstreamError>,
    pub latency: Duration,
}

/// Sends synthetic traffic to a channel
#[async_trait]
pub trait Prober: Send + Sync {
    /// Send one lightweight completion request
    async fn probe(&self, channel: &Channel) -> ProbeReport;

    /// Provider balance, `Ok(None)` when the backend cannot report one
    async fn balance(&self, channel: &Channel) -> Result<Option<f64>, UpstreamError>;
}
