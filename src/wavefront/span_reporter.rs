use super::application_tags::ApplicationTags;
use super::format::SpanRecord;
use super::sender::WavefrontClient;
use super::DEFAULT_SOURCE;
use futures_util::future::BoxFuture;
use opentelemetry::trace::{SpanId, SpanKind, Status, TraceError, TraceResult, TracerProvider as _};
use opentelemetry_sdk::export::trace::{ExportResult, SpanData, SpanExporter};
use opentelemetry_sdk::runtime;
use opentelemetry_sdk::trace::{self, Tracer, TracerProvider};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub const SPAN_KIND_TAG_KEY: &str = "span.kind";
pub const ERROR_TAG_KEY: &str = "error";

fn span_kind_tag(kind: &SpanKind) -> &'static str {
    match kind {
        SpanKind::Client => "client",
        SpanKind::Server => "server",
        SpanKind::Producer => "producer",
        SpanKind::Consumer => "consumer",
        SpanKind::Internal => "internal",
    }
}

fn millis_since_epoch(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn span_uuid(span_id: SpanId) -> Uuid {
    Uuid::from_u64_pair(0, u64::from_be_bytes(span_id.to_bytes()))
}

/// Exports finished OpenTelemetry spans as Wavefront spans.
#[derive(Debug)]
pub struct WavefrontSpanReporter {
    client: Arc<WavefrontClient>,
    tags: Arc<ApplicationTags>,
    source: String,
}

impl WavefrontSpanReporter {
    pub fn builder() -> WavefrontSpanReporterBuilder {
        WavefrontSpanReporterBuilder { source: None }
    }

    fn to_record(&self, span: &SpanData) -> SpanRecord {
        let mut tags = self.tags.to_point_tags();
        tags.extend(span.attributes.iter().filter_map(|kv| {
            let value = kv.value.to_string();
            (!value.trim().is_empty()).then(|| (kv.key.as_str().to_string(), value))
        }));
        tags.push((
            SPAN_KIND_TAG_KEY.to_string(),
            span_kind_tag(&span.span_kind).to_string(),
        ));
        if let Status::Error { .. } = span.status {
            tags.push((ERROR_TAG_KEY.to_string(), "true".to_string()));
        }

        let parents = if span.parent_span_id != SpanId::INVALID {
            vec![span_uuid(span.parent_span_id)]
        } else {
            Vec::new()
        };
        let duration = span
            .end_time
            .duration_since(span.start_time)
            .unwrap_or_default();

        SpanRecord {
            name: span.name.to_string(),
            start_millis: millis_since_epoch(span.start_time),
            duration_millis: duration.as_millis() as i64,
            trace_id: Uuid::from_bytes(span.span_context.trace_id().to_bytes()),
            span_id: span_uuid(span.span_context.span_id()),
            parents,
            follows_from: Vec::new(),
            tags,
        }
    }
}

impl SpanExporter for WavefrontSpanReporter {
    fn export(&mut self, batch: Vec<SpanData>) -> BoxFuture<'static, ExportResult> {
        let mut result = Ok(());
        for span in &batch {
            let record = self.to_record(span);
            if let Err(e) = self.client.send_span(&record, &self.source) {
                tracing::warn!(span = %record.name, error = %e, "failed to queue span");
                result = Err(TraceError::from(e.to_string()));
            }
        }
        Box::pin(async move { result })
    }

    fn force_flush(&mut self) -> BoxFuture<'static, ExportResult> {
        let client = self.client.clone();
        Box::pin(async move {
            client
                .flush()
                .await
                .map_err(|e| TraceError::from(e.to_string()))
        })
    }
}

#[derive(Debug)]
pub struct WavefrontSpanReporterBuilder {
    source: Option<String>,
}

impl WavefrontSpanReporterBuilder {
    pub fn with_source(mut self, source: Option<impl Into<String>>) -> Self {
        self.source = source.map(Into::into);
        self
    }

    pub fn build(
        self,
        client: Arc<WavefrontClient>,
        tags: Arc<ApplicationTags>,
    ) -> WavefrontSpanReporter {
        WavefrontSpanReporter {
            client,
            tags,
            source: self.source.unwrap_or_else(|| DEFAULT_SOURCE.clone()),
        }
    }
}

/// Tracer provider whose spans are reported to Wavefront.
#[derive(Debug)]
pub struct WavefrontTracer {
    provider: TracerProvider,
}

impl WavefrontTracer {
    pub fn builder(
        span_reporter: WavefrontSpanReporter,
        tags: Arc<ApplicationTags>,
    ) -> WavefrontTracerBuilder {
        WavefrontTracerBuilder {
            span_reporter,
            tags,
        }
    }

    pub fn provider(&self) -> &TracerProvider {
        &self.provider
    }

    pub fn tracer(&self, name: &'static str) -> Tracer {
        self.provider.tracer(name)
    }

    pub async fn shutdown(&self) -> TraceResult<()> {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| TraceError::from(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct WavefrontTracerBuilder {
    span_reporter: WavefrontSpanReporter,
    tags: Arc<ApplicationTags>,
}

impl WavefrontTracerBuilder {
    /// Must be called within a Tokio runtime; the batch processor runs on it.
    pub fn build(self) -> WavefrontTracer {
        let provider = TracerProvider::builder()
            .with_batch_exporter(self.span_reporter, runtime::Tokio)
            .with_config(trace::Config::default().with_resource(self.tags.to_resource()))
            .build();
        WavefrontTracer { provider }
    }
}
