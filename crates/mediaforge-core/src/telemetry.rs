//! Telemetry — structured logging and OpenTelemetry export for MediaForge.
//!
//! The executor opens a span per run (`run_id`, `recipe_id`) and a child span
//! per step (`step_id`, `provider`). JSON log lines carry both, so every event
//! from a step can be tied back to its run; the OTLP exporter ships the same
//! spans to a collector.

use opentelemetry::trace::TracerProvider;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

use crate::config::{LogFormat, TelemetryConfig};

const SERVICE_NAME: &str = "mediaforge";

/// Initialize the MediaForge telemetry pipeline.
///
/// Sets up:
/// - Log lines on stderr, as JSON with run/step span fields or compact text
/// - OpenTelemetry tracing with OTLP export, when enabled
/// - Filtering from `RUST_LOG`, falling back to `config.log_filter`
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<()> {
    let env_filter = env_filter(config, std::env::var("RUST_LOG").ok());
    let fmt_layer = fmt_layer(config.log_format);

    if config.enabled {
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()?;

        let resource = opentelemetry_sdk::Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]);

        let provider = opentelemetry_sdk::trace::TracerProvider::builder()
            .with_simple_exporter(exporter)
            .with_resource(resource)
            .build();

        let tracer = provider.tracer(SERVICE_NAME);
        opentelemetry::global::set_tracer_provider(provider);
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(fmt_layer)
            .with(env_filter)
            .try_init()?;
    }

    Ok(())
}

/// `RUST_LOG` wins over the configured filter; an unparsable filter falls
/// back to `warn`.
fn env_filter(config: &TelemetryConfig, rust_log: Option<String>) -> EnvFilter {
    rust_log
        .filter(|raw| !raw.trim().is_empty())
        .and_then(|raw| EnvFilter::try_new(raw).ok())
        .or_else(|| EnvFilter::try_new(&config.log_filter).ok())
        .unwrap_or_else(|| EnvFilter::new("warn"))
}

fn fmt_layer(format: LogFormat) -> Box<dyn Layer<Registry> + Send + Sync> {
    match format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_target(false)
            .boxed(),
    }
}
