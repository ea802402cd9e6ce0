use super::application_tags::ApplicationTags;
use super::direct::DirectIngestionClientBuilder;
use super::proxy::ProxyClientBuilder;
use super::reporter::WavefrontReporter;
use super::sender::{SenderError, WavefrontClient};
use super::span_reporter::{WavefrontSpanReporter, WavefrontTracer};
use crate::config::{
    AppConfig, SenderKind, WavefrontCredentials, WAVEFRONT_DIRECT_INGESTION, WAVEFRONT_PROXY,
};
use crate::middleware::metrics::HttpMetrics;
use actix_web::web;
use opentelemetry::global;
use opentelemetry::metrics::MetricsError;
use opentelemetry::trace::TraceError;
use opentelemetry_sdk::propagation::TraceContextPropagator;
use opentelemetry_sdk::trace::Tracer;
use std::sync::Arc;
use thiserror::Error;

pub const INSTRUMENTATION_NAME: &str = "wavefront-actix";

#[derive(Error, Debug)]
pub enum RegistrationError {
    #[error("configuration section [{0}] is missing")]
    MissingSection(&'static str),

    #[error("metrics reporter error: {0}")]
    Metrics(#[from] MetricsError),

    #[error("tracer error: {0}")]
    Trace(#[from] TraceError),

    #[error("sender error: {0}")]
    Sender(#[from] SenderError),
}

/// The sender, reporter and tracer built from one options section.
#[derive(Debug)]
pub struct WavefrontTelemetry {
    client: Arc<WavefrontClient>,
    tags: Arc<ApplicationTags>,
    reporter: Arc<WavefrontReporter>,
    tracer: Arc<WavefrontTracer>,
}

impl WavefrontTelemetry {
    fn assemble(client: WavefrontClient, credentials: &WavefrontCredentials) -> Self {
        let client = Arc::new(client);
        client.start();

        let tags = Arc::new(
            ApplicationTags::builder(&credentials.application, &credentials.service)
                .cluster(credentials.cluster.as_ref())
                .shard(credentials.shard.as_ref())
                .build(),
        );

        let reporter = WavefrontReporter::builder(tags.clone())
            .with_source(credentials.source.as_ref())
            .reporting_interval(credentials.reporting_interval())
            .build(client.clone());

        let span_reporter = WavefrontSpanReporter::builder()
            .with_source(credentials.source.as_ref())
            .build(client.clone(), tags.clone());

        let tracer = WavefrontTracer::builder(span_reporter, tags.clone()).build();

        Self {
            client,
            tags,
            reporter: Arc::new(reporter),
            tracer: Arc::new(tracer),
        }
    }

    pub fn client(&self) -> &Arc<WavefrontClient> {
        &self.client
    }

    pub fn application_tags(&self) -> &ApplicationTags {
        &self.tags
    }

    pub fn reporter(&self) -> &Arc<WavefrontReporter> {
        &self.reporter
    }

    pub fn tracer(&self) -> Tracer {
        self.tracer.tracer(INSTRUMENTATION_NAME)
    }

    /// Makes the reporter and tracer the process-wide OpenTelemetry providers.
    pub fn install_global(&self) {
        global::set_text_map_propagator(TraceContextPropagator::new());
        global::set_tracer_provider(self.tracer.provider().clone());
        global::set_meter_provider(self.reporter.meter_provider().clone());
    }

    /// Registers the reporter and tracer as application data.
    pub fn configure(&self, cfg: &mut web::ServiceConfig) {
        cfg.app_data(web::Data::from(self.reporter.clone()))
            .app_data(web::Data::from(self.tracer.clone()));
    }

    /// Request metrics middleware recording into the reporter's meter.
    pub fn http_metrics(&self) -> HttpMetrics {
        HttpMetrics::new(Arc::new(self.reporter.meter(INSTRUMENTATION_NAME)))
    }

    /// Exports what is buffered, then stops the reporter, the tracer and the sender.
    pub async fn shutdown(&self) -> Result<(), RegistrationError> {
        self.tracer.shutdown().await?;
        self.reporter.shutdown().await?;
        self.client.close().await?;
        Ok(())
    }
}

pub fn add_wavefront_proxy(config: &AppConfig) -> Result<WavefrontTelemetry, RegistrationError> {
    let options = config
        .wavefront_proxy
        .as_ref()
        .ok_or(RegistrationError::MissingSection(WAVEFRONT_PROXY))?;
    let credentials = &options.credentials;

    let client = ProxyClientBuilder::new(&options.hostname)
        .metrics_port(options.port)
        .distribution_port(options.distribution_port)
        .tracing_port(options.tracing_port)
        .flush_interval(credentials.flush_interval())
        .build();

    tracing::info!(
        hostname = %options.hostname,
        port = options.port,
        distribution_port = options.distribution_port,
        tracing_port = options.tracing_port,
        application = %credentials.application,
        service = %credentials.service,
        "registering wavefront proxy sender"
    );
    Ok(WavefrontTelemetry::assemble(client, credentials))
}

pub fn add_wavefront_direct_ingestion(
    config: &AppConfig,
) -> Result<WavefrontTelemetry, RegistrationError> {
    let options = config
        .wavefront_direct_ingestion
        .as_ref()
        .ok_or(RegistrationError::MissingSection(WAVEFRONT_DIRECT_INGESTION))?;
    let credentials = &options.credentials;

    tracing::debug!(
        application = %credentials.application,
        service = %credentials.service,
        cluster = ?credentials.cluster,
        shard = ?credentials.shard,
        source = ?credentials.source,
        reporting_interval_seconds = credentials.reporting_interval_seconds,
        flush_interval_seconds = credentials.flush_interval_seconds,
        hostname = %options.hostname,
        token = "<redacted>",
        max_queue_size = options.max_queue_size,
        batch_size = options.batch_size,
        "wavefront direct ingestion options"
    );

    let client = DirectIngestionClientBuilder::new(&options.hostname, &options.token)
        .max_queue_size(options.max_queue_size)
        .batch_size(options.batch_size)
        .flush_interval(credentials.flush_interval())
        .build();

    tracing::info!(
        hostname = %options.hostname,
        application = %credentials.application,
        service = %credentials.service,
        "registering wavefront direct ingestion sender"
    );
    Ok(WavefrontTelemetry::assemble(client, credentials))
}

/// Registers the sender selected by `telemetry.sender`.
pub fn register(config: &AppConfig) -> Result<WavefrontTelemetry, RegistrationError> {
    match config.telemetry.sender {
        SenderKind::Proxy => add_wavefront_proxy(config),
        SenderKind::DirectIngestion => add_wavefront_direct_ingestion(config),
    }
}
