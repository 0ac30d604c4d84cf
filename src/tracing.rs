//! Logging and OpenTelemetry tracing
//!
//! Log output is configured from the environment:
//! - `RUST_LOG` or `LOG_LEVEL` - filter directives (default `info,chvisor=debug`)
//! - `LOG_FORMAT=json` - JSON lines instead of human-readable output
//! - `LOG_FILE_PATH` - append to this file instead of stdout
//! - `OTEL_EXPORTER_OTLP_ENDPOINT` - also export spans over OTLP (gRPC)
//!
//! ```text
//! chvisor → OTLP (gRPC) → OTel Collector → Tempo (traces)
//! ```

use std::fs::OpenOptions;
use std::sync::Mutex;

use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{runtime, trace as sdktrace, Resource};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "info,chvisor=debug";

/// Logging settings read from the environment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSettings {
    pub filter: Option<String>,
    pub json: bool,
    pub file_path: Option<String>,
    pub otlp_endpoint: Option<String>,
}

impl LogSettings {
    pub fn from_env() -> Self {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());
        Self {
            filter: var("RUST_LOG").or_else(|| var("LOG_LEVEL")),
            json: var("LOG_FORMAT").is_some_and(|f| f.eq_ignore_ascii_case("json")),
            file_path: var("LOG_FILE_PATH"),
            otlp_endpoint: var("OTEL_EXPORTER_OTLP_ENDPOINT"),
        }
    }

    fn env_filter(&self) -> EnvFilter {
        self.filter
            .as_deref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Initialize the tracing subsystem
///
/// Installs the fmt layer and, when an OTLP endpoint is configured, an
/// OpenTelemetry layer exporting to it in batches.
///
/// # Example
/// ```ignore
/// init_tracing("chvisor", &LogSettings::from_env())?;
/// ```
pub fn init_tracing(
    service_name: &str,
    settings: &LogSettings,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = settings.env_filter();

    let (writer, ansi) = match &settings.file_path {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stdout), true),
    };

    let (json_layer, text_layer) = if settings.json {
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_writer(writer);
        (Some(layer), None)
    } else {
        let layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .with_ansi(ansi)
            .with_writer(writer);
        (None, Some(layer))
    };

    let otel_layer = match &settings.otlp_endpoint {
        Some(endpoint) => {
            let tracer = opentelemetry_otlp::new_pipeline()
                .tracing()
                .with_exporter(
                    opentelemetry_otlp::new_exporter()
                        .tonic()
                        .with_endpoint(endpoint),
                )
                .with_trace_config(sdktrace::Config::default().with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name.to_string()),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])))
                .install_batch(runtime::Tokio)?;
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(otel_layer)
        .with(json_layer)
        .with(text_layer)
        .init();

    tracing::info!(
        service = service_name,
        otlp = settings.otlp_endpoint.as_deref().unwrap_or("off"),
        "tracing initialized"
    );

    Ok(())
}

/// Shutdown the tracing subsystem gracefully
///
/// Flushes any pending spans to the collector
pub fn shutdown_tracing() {
    opentelemetry::global::shutdown_tracer_provider();
    tracing::info!("tracing shutdown complete");
}

/// Create a span tagged with a sandbox id
#[macro_export]
macro_rules! sandbox_span {
    ($level:expr, $name:expr, $sandbox_id:expr) => {
        tracing::span!($level, $name, sandbox_id = %$sandbox_id)
    };
}
