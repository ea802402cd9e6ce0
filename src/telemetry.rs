use crate::config::TelemetryConfig;
use opentelemetry_sdk::trace::Tracer;
use tracing::Subscriber;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

fn level_filter(level: &str) -> EnvFilter {
    EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// `RUST_LOG` when set, otherwise the configured level.
pub fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| level_filter(&config.log_level))
}

fn console_layer<S, W>(writer: W) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::Layer::new()
        .with_writer(writer)
        .with_target(true)
        .with_span_events(FmtSpan::CLOSE)
        .compact()
}

/// Console-only subscriber for startup work that runs before the Wavefront
/// tracer exists. Use it with `tracing::subscriber::with_default`.
pub fn startup_subscriber<W>(filter: EnvFilter, writer: W) -> impl Subscriber + Send + Sync
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer(writer))
}

/// Installs the global subscriber: console output plus spans bridged to the Wavefront tracer.
pub fn init_subscriber(config: &TelemetryConfig, tracer: Tracer) {
    let _ = tracing_log::LogTracer::init();
    std::panic::set_hook(Box::new(tracing_panic::panic_hook));

    let trace_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter(config))
        .with(console_layer(std::io::stdout))
        .with(trace_layer)
        .init();
}

#[cfg(test)]
mod tests {
    use super::{level_filter, startup_subscriber};
    use crate::config::AppConfig;
    use crate::wavefront;
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    impl io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_level_filter_from_config() {
        let filter = level_filter("wavefront_actix=debug");
        assert!(filter.to_string().contains("wavefront_actix=debug"));
    }

    #[test]
    fn test_invalid_level_falls_back_to_info() {
        let filter = level_filter("wavefront_actix=verbose");
        assert_eq!(filter.to_string(), "info");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_registration_logged_through_startup_subscriber() {
        let config: AppConfig = r#"
            [telemetry]
            sender = "direct-ingestion"

            [wavefront-direct-ingestion]
            application = "weather"
            service = "backend"
            hostname = "http://127.0.0.1:9"
            token = "secret-token"
        "#
        .parse()
        .unwrap();

        let output = Captured::default();
        let subscriber = startup_subscriber(level_filter("debug"), output.clone());
        let telemetry =
            tracing::subscriber::with_default(subscriber, || wavefront::register(&config))
                .unwrap();

        let logged = output.contents();
        assert!(logged.contains("wavefront direct ingestion options"));
        assert!(logged.contains("registering wavefront direct ingestion sender"));
        assert!(!logged.contains("secret-token"));

        // nothing listens on the ingestion port
        let _ = telemetry.shutdown().await;
    }
}
