//! Telemetry for relaymeter
//!
//! Structured logging through `tracing`, with optional OTLP export of
//! metrics and traces

mod metadata;
pub mod metrics;

use std::time::Duration;

use opentelemetry::global;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{MetricExporter, SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use relaymeter_config::{ExportProtocol, ExporterConfig, TelemetryConfig};
use tracing_subscriber::{EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt};

pub use opentelemetry::{
    KeyValue,
    metrics::{Counter, Histogram, Meter},
};

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Keeps OTLP providers alive; shuts them down on drop so buffered data is exported
#[derive(Default)]
pub struct TelemetryGuard {
    providers: Option<(SdkMeterProvider, SdkTracerProvider)>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active
    pub const fn is_exporting(&self) -> bool {
        self.providers.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some((meters, tracer)) = self.providers.take() else {
            return;
        };
        if let Err(e) = meters.shutdown() {
            eprintln!("failed to shutdown meter provider: {e}");
        }
        if let Err(e) = tracer.shutdown() {
            eprintln!("failed to shutdown tracer provider: {e}");
        }
    }
}

/// Install the global subscriber and, when an exporter is configured, OTLP export
///
/// An unparsable `log_filter` falls back to `info`. The returned guard must
/// be held for the lifetime of the process.
///
/// # Errors
///
/// Returns an error if an OTLP exporter cannot be built
pub fn init(config: &TelemetryConfig) -> anyhow::Result<TelemetryGuard> {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let mut layers: Vec<BoxedLayer> = vec![log_layer(config.json_logs)];
    let mut guard = TelemetryGuard::default();

    if let Some(ref exporter) = config.exporter {
        let resource = metadata::build_resource(config);

        let meters = meter_provider(exporter, resource.clone())?;
        global::set_meter_provider(meters.clone());

        let tracer = tracer_provider(exporter, resource)?;
        layers.push(Box::new(
            tracing_opentelemetry::layer().with_tracer(tracer.tracer("relaymeter")),
        ));
        global::set_tracer_provider(tracer.clone());

        guard.providers = Some((meters, tracer));
    }

    tracing_subscriber::registry().with(layers).with(filter).init();

    if let Some(ref exporter) = config.exporter {
        tracing::info!(
            endpoint = %exporter.endpoint,
            protocol = ?exporter.protocol,
            sampling_ratio = exporter.sampling_ratio,
            "OTLP export enabled"
        );
    }

    Ok(guard)
}

fn log_layer(json: bool) -> BoxedLayer {
    let layer = tracing_subscriber::fmt::layer().with_target(true);
    if json {
        layer.json().boxed()
    } else {
        layer.with_thread_ids(false).with_file(false).with_line_number(false).boxed()
    }
}

fn meter_provider(config: &ExporterConfig, resource: Resource) -> anyhow::Result<SdkMeterProvider> {
    let builder = MetricExporter::builder();
    let exporter = match config.protocol {
        ExportProtocol::Grpc => builder.with_tonic().with_endpoint(config.endpoint.as_str()).build(),
        ExportProtocol::HttpProto => builder.with_http().with_endpoint(config.endpoint.as_str()).build(),
    }
    .map_err(|e| anyhow::anyhow!("failed to build {:?} metrics exporter: {e}", config.protocol))?;

    let reader = PeriodicReader::builder(exporter)
        .with_interval(Duration::from_secs(config.interval_secs.max(1)))
        .build();

    Ok(SdkMeterProvider::builder()
        .with_resource(resource)
        .with_reader(reader)
        .build())
}

fn tracer_provider(config: &ExporterConfig, resource: Resource) -> anyhow::Result<SdkTracerProvider> {
    let builder = SpanExporter::builder();
    let exporter = match config.protocol {
        ExportProtocol::Grpc => builder.with_tonic().with_endpoint(config.endpoint.as_str()).build(),
        ExportProtocol::HttpProto => builder.with_http().with_endpoint(config.endpoint.as_str()).build(),
    }
    .map_err(|e| anyhow::anyhow!("failed to build {:?} span exporter: {e}", config.protocol))?;

    Ok(SdkTracerProvider::builder()
        .with_resource(resource)
        .with_sampler(sampler(config.sampling_ratio))
        .with_batch_exporter(exporter)
        .build())
}

/// Parent-based sampler honouring the configured ratio for root spans
fn sampler(ratio: f64) -> Sampler {
    let root = if ratio >= 1.0 {
        Sampler::AlwaysOn
    } else if ratio <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::TraceIdRatioBased(ratio)
    };
    Sampler::ParentBased(Box::new(root))
}
