//! Observability infrastructure: tracing and metrics.
//!
//! Call [`init`] once at startup before any bridge operation. Components log
//! through `tracing` and record through the `metrics` facade whether or not
//! it has been called.

use crate::config::VifConfig;
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{self, RandomIdGenerator, Sampler};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod metrics;

/// Set NNC_OTLP_ENABLED=1 or OTEL_EXPORTER_OTLP_ENDPOINT to export traces.
fn otlp_enabled() -> bool {
    std::env::var("NNC_OTLP_ENABLED").is_ok()
        || std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok()
}

fn otlp_endpoint() -> String {
    std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
        .unwrap_or_else(|_| "http://localhost:4317".to_string())
}

/// `RUST_LOG` wins over the configured level.
fn env_filter(config: &VifConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
}

/// Install the global subscriber and the Prometheus exporter.
///
/// Fails if a global subscriber or recorder is already installed.
pub fn init(config: &VifConfig) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let subscriber = tracing_subscriber::registry()
        .with(env_filter(config))
        .with(tracing_subscriber::fmt::layer().with_target(true).with_level(true));

    if otlp_enabled() {
        let endpoint = otlp_endpoint();

        let exporter = opentelemetry_otlp::new_exporter().tonic().with_endpoint(&endpoint);

        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(
                trace::config()
                    .with_sampler(Sampler::AlwaysOn)
                    .with_id_generator(RandomIdGenerator::default())
                    .with_resource(Resource::new(vec![
                        opentelemetry::KeyValue::new("service.name", "nnc-vif"),
                        opentelemetry::KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                    ])),
            )
            .install_batch(opentelemetry_sdk::runtime::Tokio)?;

        let telemetry = tracing_opentelemetry::layer().with_tracer(tracer);
        subscriber.with(telemetry).try_init()?;
        tracing::info!(endpoint = %endpoint, "Observability initialized with OTLP tracing");
    } else {
        subscriber.try_init()?;
        tracing::info!("Observability initialized (set NNC_OTLP_ENABLED=1 for OTLP tracing)");
    }

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;

    metrics::register_core_metrics();

    Ok(())
}

/// Flush and shut down the tracer provider.
pub fn shutdown() {
    opentelemetry::global::shutdown_tracer_provider();
}
