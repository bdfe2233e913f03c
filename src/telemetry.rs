//! Logging and OpenTelemetry setup for the controller process
//!
//! Log output is JSON by default (one object per line for log shippers) or
//! human-readable text. The filter comes from, in order: an explicit
//! `--log-filter`, `RUST_LOG`, then [`DEFAULT_LOG_FILTER`].
//!
//! Traces and metrics are exported over OTLP only when an endpoint is
//! configured. Without one the instruments in [`crate::metrics`] are no-ops.
//! The returned [`TelemetryGuard`] flushes exporters on shutdown.

use std::fmt;
use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use thiserror::Error;
use tracing::warn;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default log filter when neither `--log-filter` nor `RUST_LOG` is set
pub const DEFAULT_LOG_FILTER: &str = "info,secretsync=debug,kube=info,tower=warn,hyper=warn";

/// Pod identity variables (downward API) copied onto the OTLP resource
const POD_ATTRIBUTES: [(&str, &str); 3] = [
    ("POD_NAME", "k8s.pod.name"),
    ("POD_NAMESPACE", "k8s.namespace.name"),
    ("NODE_NAME", "k8s.node.name"),
];

/// Telemetry setup failures
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter directive did not parse
    #[error("invalid log filter '{filter}': {reason}")]
    Filter {
        /// Directive as given
        filter: String,
        /// Parser message
        reason: String,
    },

    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter for {endpoint}: {reason}")]
    Exporter {
        /// `traces` or `metrics`
        signal: &'static str,
        /// Collector endpoint
        endpoint: String,
        /// Exporter error
        reason: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log line format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human-readable text
    Text,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "json"),
            Self::Text => write!(f, "text"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" | "pretty" => Ok(Self::Text),
            other => Err(format!(
                "unknown log format '{other}' (expected 'json' or 'text')"
            )),
        }
    }
}

/// Telemetry settings, built by the binary from its CLI flags
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Log line format
    pub log_format: LogFormat,
    /// Explicit filter directive; overrides `RUST_LOG`
    pub log_filter: Option<String>,
    /// OTLP collector endpoint (e.g. "http://otel-collector:4317")
    pub otlp_endpoint: Option<String>,
}

impl TelemetryConfig {
    /// Resolve the effective log filter
    ///
    /// `rust_log` is the value of `RUST_LOG`, passed in so resolution does not
    /// depend on process state.
    pub fn env_filter(&self, rust_log: Option<&str>) -> Result<EnvFilter, TelemetryError> {
        let directive = self
            .log_filter
            .as_deref()
            .or(rust_log)
            .filter(|d| !d.trim().is_empty())
            .unwrap_or(DEFAULT_LOG_FILTER);

        EnvFilter::try_new(directive).map_err(|e| TelemetryError::Filter {
            filter: directive.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Keeps OTLP providers alive; call [`TelemetryGuard::shutdown`] before exit
/// so buffered spans and metrics are flushed
#[derive(Default)]
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl TelemetryGuard {
    /// Whether OTLP export is active
    pub fn is_exporting(&self) -> bool {
        self.tracer_provider.is_some()
    }

    /// Flush and stop the exporters
    pub fn shutdown(self) {
        if let Some(provider) = self.tracer_provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "Failed to flush trace exporter");
            }
        }
        if let Some(provider) = self.meter_provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "Failed to flush metrics exporter");
            }
        }
    }
}

/// Install the global subscriber and, when an endpoint is set, OTLP export
pub fn init_telemetry(config: &TelemetryConfig) -> crate::Result<TelemetryGuard> {
    let rust_log = std::env::var("RUST_LOG").ok();
    let env_filter = config.env_filter(rust_log.as_deref())?;

    let mut guard = TelemetryGuard::default();
    let otel_layer = match &config.otlp_endpoint {
        Some(endpoint) => {
            global::set_text_map_propagator(TraceContextPropagator::new());
            let resource = build_resource(|var| std::env::var(var).ok());

            let meter_provider = otlp_meter_provider(endpoint, resource.clone())?;
            global::set_meter_provider(meter_provider.clone());

            let tracer_provider = otlp_tracer_provider(endpoint, resource)?;
            global::set_tracer_provider(tracer_provider.clone());
            let tracer = tracer_provider.tracer(env!("CARGO_PKG_NAME"));

            guard.meter_provider = Some(meter_provider);
            guard.tracer_provider = Some(tracer_provider);
            Some(tracing_opentelemetry::layer().with_tracer(tracer))
        }
        None => None,
    };

    // Only one of the two formatting layers is present
    let (json_layer, text_layer) = match config.log_format {
        LogFormat::Json => (
            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_target(true),
            ),
            None,
        ),
        LogFormat::Text => (None, Some(tracing_subscriber::fmt::layer().with_target(true))),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .with(text_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    Ok(guard)
}

/// Resource attributes: service identity plus pod identity when the downward
/// API provides it
fn build_resource(lookup: impl Fn(&str) -> Option<String>) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, env!("CARGO_PKG_NAME")),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    attributes.extend(
        POD_ATTRIBUTES
            .iter()
            .filter_map(|(var, key)| lookup(var).map(|value| KeyValue::new(*key, value))),
    );
    Resource::new(attributes)
}

fn otlp_tracer_provider(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "traces",
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn otlp_meter_provider(
    endpoint: &str,
    resource: Resource,
) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metrics",
            endpoint: endpoint.to_string(),
            reason: e.to_string(),
        })?;

    Ok(SdkMeterProvider::builder()
        .with_reader(PeriodicReader::builder(exporter, runtime::Tokio).build())
        .with_resource(resource)
        .build())
}
