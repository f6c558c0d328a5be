use anyhow::{Context, Result};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::resource::Resource;
use opentelemetry_sdk::runtime::Tokio;
use opentelemetry_sdk::trace::{self, Sampler, TracerProvider};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::AppConfig;

/// Owns the OTLP pipeline for the daemon's lifetime. Dropping the guard
/// flushes buffered spans before the provider is torn down; a span batch
/// that cannot be flushed is logged rather than silently lost.
pub struct TelemetryGuard {
    provider: Option<TracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.provider.take() {
            for result in provider.force_flush() {
                if let Err(error) = result {
                    warn!(%error, "failed to flush OTEL tracer on shutdown");
                }
            }
            global::shutdown_tracer_provider();
        }
    }
}

/// Installs the daemon's tracing stack from the already-parsed config:
/// console logs always, an OTLP span exporter when the configured sampling
/// rate admits any traces. An exporter that fails to build degrades to
/// console logging so a missing collector never blocks startup.
pub fn init(service_name: &str, config: &AppConfig) -> Result<TelemetryGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (provider, exporter_error) = if config.otel_sampling_rate > 0.0 {
        match build_provider(service_name, config.otel_sampling_rate) {
            Ok(provider) => (Some(provider), None),
            Err(error) => (None, Some(error)),
        }
    } else {
        (None, None)
    };

    let console = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer());
    match &provider {
        Some(provider) => {
            let tracer = provider.tracer(service_name.to_string());
            console
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        None => console.init(),
    }

    // config parsing ran before any subscriber existed; surface its
    // deferred sampling warning now that logs have somewhere to go
    if let Some(message) = &config.otel_sampling_warning {
        warn!("{message}");
    }
    if let Some(error) = exporter_error {
        warn!(%error, "OTLP exporter unavailable; traces stay on the console");
    }

    info!(
        sampling_rate = config.otel_sampling_rate,
        exporting = provider.is_some(),
        "telemetry installed"
    );

    Ok(TelemetryGuard { provider })
}

fn build_provider(service_name: &str, sampling_rate: f64) -> Result<TracerProvider> {
    global::set_text_map_propagator(TraceContextPropagator::new());

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .build_span_exporter()
        .context("building OTLP span exporter")?;

    let resource = Resource::new([
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            trace::Config::default()
                .with_sampler(Sampler::TraceIdRatioBased(sampling_rate))
                .with_resource(resource),
        )
        .build();

    global::set_tracer_provider(provider.clone());
    Ok(provider)
}
