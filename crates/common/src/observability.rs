use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use tracing::Subscriber;
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{EnvFilter, Layer};

use crate::config::General;

/// Guard that flushes the tracer provider on drop. The `tracing-opentelemetry`
/// wiring is process-global, so the global shutdown is the right hook.
pub struct OtelGuard {
    _private: (),
}

impl Drop for OtelGuard {
    fn drop(&mut self) {
        opentelemetry::global::shutdown_tracer_provider();
    }
}

struct ErrorCounterLayer;

impl<S> Layer<S> for ErrorCounterLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::ERROR {
            metrics::counter!("tracker_error_log_events").increment(1);
        }
    }
}

/// Default filter derived from the configured level. The pipeline's own spans
/// run at that level; the HTTP stack underneath is capped at warn so paginated
/// provider calls do not drown the job logs.
fn default_directives(level: &str) -> String {
    format!("{level},hyper=warn,reqwest=warn,h2=warn,rustls=warn")
}

/// OTLP tracer, only when `OTEL_EXPORTER_OTLP_ENDPOINT` is set — local runs
/// and tests stay export-free and deterministic. Returns the tracer for layer
/// construction plus the flush guard.
fn otlp_tracer(service_name: &str) -> Option<(opentelemetry_sdk::trace::Tracer, OtelGuard)> {
    use opentelemetry_otlp::WithExportConfig;

    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .ok()?;

    let resource = Resource::new(vec![
        KeyValue::new("service.name", service_name.to_string()),
        KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
    ]);

    // Batch export needs a Tokio runtime; the binary is #[tokio::main].
    let provider = opentelemetry_sdk::trace::TracerProvider::builder()
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_resource(resource)
        .build();

    let tracer = provider.tracer(service_name.to_string());
    let _ = opentelemetry::global::set_tracer_provider(provider);

    Some((tracer, OtelGuard { _private: () }))
}

/// Build the `tracing` dispatcher from the loaded config:
/// - JSON logs to stdout
/// - `RUST_LOG` takes precedence over `general.log_level`
/// - ERROR events counted into `tracker_error_log_events`
/// - an OTLP layer attached only when an export endpoint is configured
pub fn build_dispatch(
    service_name: &str,
    general: &General,
) -> (tracing::Dispatch, Option<OtelGuard>) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(&general.log_level)));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_timer(tracing_subscriber::fmt::time::SystemTime)
        .json();

    let (tracer, otel_guard) = match otlp_tracer(service_name) {
        Some((tracer, guard)) => (Some(tracer), Some(guard)),
        None => (None, None),
    };
    let otel_layer = tracer.map(|t| tracing_opentelemetry::layer().with_tracer(t));

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(ErrorCounterLayer)
        .with(otel_layer);

    (tracing::Dispatch::new(subscriber), otel_guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directives_carry_level_and_quiet_http() {
        let d = default_directives("debug");
        assert!(d.starts_with("debug,"));
        assert!(d.contains("hyper=warn"));
        assert!(d.contains("reqwest=warn"));
    }

    #[test]
    fn test_dispatch_builds_without_otel_endpoint() {
        let general = General {
            log_level: "info".to_string(),
        };
        let (_dispatch, guard) = build_dispatch("wallet_tracker_test", &general);
        assert!(guard.is_none(), "no endpoint configured, no exporter guard");
    }
}
