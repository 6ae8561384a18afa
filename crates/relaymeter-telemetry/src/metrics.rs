//! Metric name constants and recording helpers
//!
//! Components build their instruments from [`meter`] at construction time,
//! after [`crate::init`] has installed the global provider. Without an
//! exporter the global meter is a no-op.

use std::time::Instant;

use opentelemetry::metrics::{Histogram, Meter};

/// Instrumentation scope shared by every component
pub const METER_NAME: &str = "relaymeter";

// Relay
pub const RELAY_REQUEST_COUNT: &str = "relaymeter.relay.request.count";
pub const RELAY_REQUEST_DURATION: &str = "relaymeter.relay.request.duration";
pub const RELAY_TOKEN_USAGE: &str = "relaymeter.relay.token.usage";

// Billing
pub const BILLING_QUOTA_CHARGED: &str = "relaymeter.billing.quota.charged";
pub const BILLING_TIMEOUT_COUNT: &str = "relaymeter.billing.timeout.count";
pub const BILLING_ERROR_COUNT: &str = "relaymeter.billing.error.count";
pub const BATCH_FLUSH_DURATION: &str = "relaymeter.batch.flush.duration";

// Channel health
pub const CHANNEL_TRANSITION_COUNT: &str = "relaymeter.channel.transition.count";
pub const CHANNEL_PROBE_DURATION: &str = "relaymeter.channel.probe.duration";

/// Meter from the currently installed global provider
pub fn meter() -> Meter {
    opentelemetry::global::meter(METER_NAME)
}

/// Record a duration measurement on a histogram
pub fn record_duration(histogram: &Histogram<f64>, start: Instant, attributes: &[opentelemetry::KeyValue]) {
    let duration = start.elapsed().as_secs_f64();
    histogram.record(duration, attributes);
}
