use super::application_tags::ApplicationTags;
use super::format::HistogramGranularity;
use super::sender::{SenderError, WavefrontClient};
use super::DEFAULT_SOURCE;
use async_trait::async_trait;
use opentelemetry::metrics::{Meter, MeterProvider as _, MetricsError, Result as MetricsResult};
use opentelemetry::KeyValue;
use opentelemetry_sdk::metrics::data::{self, ResourceMetrics, Temporality};
use opentelemetry_sdk::metrics::exporter::PushMetricsExporter;
use opentelemetry_sdk::metrics::reader::TemporalitySelector;
use opentelemetry_sdk::metrics::{InstrumentKind, PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::runtime;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::task::JoinHandle;

pub const HEARTBEAT_METRIC: &str = "~component.heartbeat";
pub const COMPONENT_TAG_KEY: &str = "component";
pub const COMPONENT_NAME: &str = "actix-web";

trait AsF64: Copy {
    fn as_f64(self) -> f64;
}

impl AsF64 for f64 {
    fn as_f64(self) -> f64 {
        self
    }
}

impl AsF64 for u64 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

impl AsF64 for i64 {
    fn as_f64(self) -> f64 {
        self as f64
    }
}

/// Sends `~component.heartbeat` so Wavefront lists the component even when
/// no instrument has recorded anything.
#[derive(Debug)]
struct Heartbeater {
    client: Arc<WavefrontClient>,
    tags: Vec<(String, String)>,
    source: String,
}

impl Heartbeater {
    fn new(client: Arc<WavefrontClient>, tags: &ApplicationTags, source: String) -> Self {
        let mut tags = tags.to_point_tags();
        tags.push((COMPONENT_TAG_KEY.to_string(), COMPONENT_NAME.to_string()));
        Self {
            client,
            tags,
            source,
        }
    }

    fn beat(&self) {
        let result = self.client.send_metric(
            HEARTBEAT_METRIC,
            1.0,
            Some(unix_seconds()),
            &self.source,
            &self.tags,
        );
        if let Err(e) = result {
            tracing::warn!(error = %e, "failed to queue wavefront heartbeat");
        }
    }

    /// Beats now, then once per interval until the handle is aborted.
    fn spawn(self, interval: Duration) -> JoinHandle<()> {
        self.beat();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.tick().await;
            loop {
                ticks.tick().await;
                self.beat();
            }
        })
    }
}

/// Keeps exporting after a failed point and remembers the first failure.
#[derive(Debug, Default)]
struct ExportErrors {
    failed: usize,
    first: Option<SenderError>,
}

impl ExportErrors {
    fn track(&mut self, metric: &str, result: Result<(), SenderError>) {
        if let Err(e) = result {
            tracing::warn!(metric, error = %e, "failed to queue metric point");
            self.failed += 1;
            self.first.get_or_insert(e);
        }
    }

    fn into_result(self) -> Result<(), SenderError> {
        match self.first {
            Some(e) => {
                tracing::warn!(failed = self.failed, "metric export was incomplete");
                Err(e)
            }
            None => Ok(()),
        }
    }
}

/// Converts collected OpenTelemetry metrics into Wavefront points.
#[derive(Debug)]
pub struct WavefrontMetricsExporter {
    client: Arc<WavefrontClient>,
    tags: Arc<ApplicationTags>,
    source: String,
}

impl WavefrontMetricsExporter {
    pub fn new(client: Arc<WavefrontClient>, tags: Arc<ApplicationTags>, source: String) -> Self {
        Self {
            client,
            tags,
            source,
        }
    }

    fn point_tags(&self, attributes: &[KeyValue]) -> Vec<(String, String)> {
        let mut tags = self.tags.to_point_tags();
        tags.extend(attributes.iter().filter_map(|kv| {
            let value = kv.value.to_string();
            (!value.trim().is_empty()).then(|| (kv.key.as_str().to_string(), value))
        }));
        tags
    }

    fn report_sum<T: AsF64>(&self, name: &str, sum: &data::Sum<T>, errors: &mut ExportErrors) {
        for point in &sum.data_points {
            let tags = self.point_tags(&point.attributes);
            let result =
                self.client
                    .send_delta_counter(name, point.value.as_f64(), &self.source, &tags);
            errors.track(name, result);
        }
    }

    fn report_gauge<T: AsF64>(
        &self,
        name: &str,
        gauge: &data::Gauge<T>,
        timestamp: i64,
        errors: &mut ExportErrors,
    ) {
        for point in &gauge.data_points {
            let tags = self.point_tags(&point.attributes);
            let result = self.client.send_metric(
                name,
                point.value.as_f64(),
                Some(timestamp),
                &self.source,
                &tags,
            );
            errors.track(name, result);
        }
    }

    fn report_histogram<T: AsF64>(
        &self,
        name: &str,
        histogram: &data::Histogram<T>,
        timestamp: i64,
        errors: &mut ExportErrors,
    ) {
        for point in &histogram.data_points {
            if point.count == 0 {
                continue;
            }
            let centroids = centroids(
                &point.bounds,
                &point.bucket_counts,
                point.min.map(AsF64::as_f64),
                point.max.map(AsF64::as_f64),
                point.sum.as_f64() / point.count as f64,
            );
            let tags = self.point_tags(&point.attributes);
            let result = self.client.send_distribution(
                name,
                &centroids,
                HistogramGranularity::Minute,
                Some(timestamp),
                &self.source,
                &tags,
            );
            errors.track(name, result);
        }
    }

    fn report(&self, metrics: &ResourceMetrics, timestamp: i64) -> Result<(), SenderError> {
        let mut errors = ExportErrors::default();
        for scope in &metrics.scope_metrics {
            for metric in &scope.metrics {
                let name = metric.name.as_ref();
                let any = metric.data.as_any();
                if let Some(sum) = any.downcast_ref::<data::Sum<u64>>() {
                    self.report_sum(name, sum, &mut errors);
                } else if let Some(sum) = any.downcast_ref::<data::Sum<i64>>() {
                    self.report_sum(name, sum, &mut errors);
                } else if let Some(sum) = any.downcast_ref::<data::Sum<f64>>() {
                    self.report_sum(name, sum, &mut errors);
                } else if let Some(gauge) = any.downcast_ref::<data::Gauge<u64>>() {
                    self.report_gauge(name, gauge, timestamp, &mut errors);
                } else if let Some(gauge) = any.downcast_ref::<data::Gauge<i64>>() {
                    self.report_gauge(name, gauge, timestamp, &mut errors);
                } else if let Some(gauge) = any.downcast_ref::<data::Gauge<f64>>() {
                    self.report_gauge(name, gauge, timestamp, &mut errors);
                } else if let Some(histogram) = any.downcast_ref::<data::Histogram<u64>>() {
                    self.report_histogram(name, histogram, timestamp, &mut errors);
                } else if let Some(histogram) = any.downcast_ref::<data::Histogram<f64>>() {
                    self.report_histogram(name, histogram, timestamp, &mut errors);
                } else {
                    tracing::debug!(metric = name, "skipping unsupported aggregation");
                }
            }
        }
        errors.into_result()
    }
}

/// Approximates histogram buckets as centroids at each bucket's midpoint.
/// Open-ended outer buckets are closed with the observed min and max.
fn centroids(
    bounds: &[f64],
    bucket_counts: &[u64],
    min: Option<f64>,
    max: Option<f64>,
    mean: f64,
) -> Vec<(f64, u64)> {
    if bounds.is_empty() {
        let count = bucket_counts.iter().sum();
        return vec![(mean, count)];
    }
    bucket_counts
        .iter()
        .enumerate()
        .filter(|(_, count)| **count > 0)
        .map(|(i, count)| {
            let lower = if i == 0 {
                min.unwrap_or(bounds[0])
            } else {
                bounds[i - 1]
            };
            let upper = if i >= bounds.len() {
                max.unwrap_or(bounds[bounds.len() - 1])
            } else {
                bounds[i]
            };
            ((lower + upper) / 2.0, *count)
        })
        .collect()
}

fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[async_trait]
impl PushMetricsExporter for WavefrontMetricsExporter {
    async fn export(&self, metrics: &mut ResourceMetrics) -> MetricsResult<()> {
        self.report(metrics, unix_seconds())
            .map_err(|e| MetricsError::Other(e.to_string()))
    }

    async fn force_flush(&self) -> MetricsResult<()> {
        self.client
            .flush()
            .await
            .map_err(|e| MetricsError::Other(e.to_string()))
    }

    fn shutdown(&self) -> MetricsResult<()> {
        Ok(())
    }
}

// Wavefront aggregates counters and distributions server side.
impl TemporalitySelector for WavefrontMetricsExporter {
    fn temporality(&self, _kind: InstrumentKind) -> Temporality {
        Temporality::Delta
    }
}

/// Periodically reports the application's metrics and a heartbeat through a
/// Wavefront sender.
#[derive(Debug)]
pub struct WavefrontReporter {
    provider: SdkMeterProvider,
    tags: Arc<ApplicationTags>,
    heartbeat: JoinHandle<()>,
}

impl WavefrontReporter {
    pub fn builder(tags: Arc<ApplicationTags>) -> WavefrontReporterBuilder {
        WavefrontReporterBuilder {
            tags,
            source: None,
            reporting_interval: Duration::from_secs(60),
        }
    }

    pub fn meter_provider(&self) -> &SdkMeterProvider {
        &self.provider
    }

    pub fn meter(&self, name: &'static str) -> Meter {
        self.provider.meter(name)
    }

    pub fn application_tags(&self) -> &ApplicationTags {
        &self.tags
    }

    /// Collects and exports immediately. Blocks on the reader, so call it off the async runtime.
    pub fn force_flush(&self) -> MetricsResult<()> {
        self.provider.force_flush()
    }

    pub async fn shutdown(&self) -> MetricsResult<()> {
        self.heartbeat.abort();
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| MetricsError::Other(e.to_string()))?
    }
}

impl Drop for WavefrontReporter {
    fn drop(&mut self) {
        self.heartbeat.abort();
    }
}

#[derive(Debug)]
pub struct WavefrontReporterBuilder {
    tags: Arc<ApplicationTags>,
    source: Option<String>,
    reporting_interval: Duration,
}

impl WavefrontReporterBuilder {
    pub fn with_source(mut self, source: Option<impl Into<String>>) -> Self {
        self.source = source.map(Into::into);
        self
    }

    /// A zero interval keeps the default, as the periodic reader does.
    pub fn reporting_interval(mut self, interval: Duration) -> Self {
        if !interval.is_zero() {
            self.reporting_interval = interval;
        }
        self
    }

    /// Must be called within a Tokio runtime; the periodic reader and the
    /// heartbeat run on it. The first heartbeat is queued before this returns.
    pub fn build(self, client: Arc<WavefrontClient>) -> WavefrontReporter {
        let source = self.source.unwrap_or_else(|| DEFAULT_SOURCE.clone());
        let heartbeat = Heartbeater::new(client.clone(), &self.tags, source.clone())
            .spawn(self.reporting_interval);
        let exporter = WavefrontMetricsExporter::new(client, self.tags.clone(), source);
        let reader = PeriodicReader::builder(exporter, runtime::Tokio)
            .with_interval(self.reporting_interval)
            .build();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader)
            .with_resource(self.tags.to_resource())
            .build();

        WavefrontReporter {
            provider,
            tags: self.tags,
            heartbeat,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wavefront::sender::testing::recording_client;
    use crate::wavefront::sender::DataKind;

    fn tags() -> Arc<ApplicationTags> {
        Arc::new(
            ApplicationTags::builder("weather", "backend")
                .cluster(Some("us-west"))
                .build(),
        )
    }

    #[test]
    fn test_centroids_use_bucket_midpoints() {
        let centroids = centroids(&[10.0, 20.0], &[1, 0, 2], Some(2.0), Some(40.0), 0.0);
        assert_eq!(centroids, vec![(6.0, 1), (30.0, 2)]);
    }

    #[test]
    fn test_centroids_without_bounds_use_mean() {
        let centroids = centroids(&[], &[4], None, None, 2.5);
        assert_eq!(centroids, vec![(2.5, 4)]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_counter_reported_as_delta() {
        let (client, transport) = recording_client(100, 100);
        let reporter = WavefrontReporter::builder(tags())
            .with_source(Some("host-1"))
            .reporting_interval(Duration::from_secs(3600))
            .build(client.clone());

        let counter = reporter.meter("test").u64_counter("requests").init();
        counter.add(3, &[KeyValue::new("route", "/weatherforecast")]);

        let provider = reporter.meter_provider().clone();
        tokio::task::spawn_blocking(move || provider.force_flush())
            .await
            .unwrap()
            .unwrap();
        client.flush().await.unwrap();

        let lines = transport.lines(DataKind::Metric);
        assert!(lines.iter().any(|line| line.starts_with("\"~component.heartbeat\" 1 ")
            && line.contains("\"component\"=\"actix-web\"")));
        let counter_line = lines
            .iter()
            .find(|line| line.starts_with("\"\u{2206}requests\" 3 "))
            .expect("counter line");
        assert!(counter_line.contains("source=\"host-1\""));
        assert!(counter_line.contains("\"cluster\"=\"us-west\""));
        assert!(counter_line.contains("\"route\"=\"/weatherforecast\""));

        reporter.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_histogram_reported_as_distribution() {
        let (client, transport) = recording_client(100, 100);
        let reporter = WavefrontReporter::builder(tags())
            .with_source(Some("host-1"))
            .reporting_interval(Duration::from_secs(3600))
            .build(client.clone());

        let histogram = reporter.meter("test").f64_histogram("latency").init();
        histogram.record(0.5, &[]);
        histogram.record(0.5, &[]);

        let provider = reporter.meter_provider().clone();
        tokio::task::spawn_blocking(move || provider.force_flush())
            .await
            .unwrap()
            .unwrap();
        client.flush().await.unwrap();

        let lines = transport.lines(DataKind::Distribution);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with("!M "));
        assert!(lines[0].contains(" #2 "));
        assert!(lines[0].contains("\"latency\" source=\"host-1\""));

        reporter.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_gauge_reported_with_timestamp() {
        let (client, transport) = recording_client(100, 100);
        let reporter = WavefrontReporter::builder(tags())
            .with_source(Some("host-1"))
            .reporting_interval(Duration::from_secs(3600))
            .build(client.clone());

        let _depth = reporter
            .meter("test")
            .f64_observable_gauge("queue.depth")
            .with_callback(|observer| observer.observe(7.0, &[KeyValue::new("queue", "metrics")]))
            .init();

        let provider = reporter.meter_provider().clone();
        tokio::task::spawn_blocking(move || provider.force_flush())
            .await
            .unwrap()
            .unwrap();
        client.flush().await.unwrap();

        let lines = transport.lines(DataKind::Metric);
        let gauge_line = lines
            .iter()
            .find(|line| line.starts_with("\"queue.depth\" "))
            .expect("gauge line");
        let fields: Vec<&str> = gauge_line.split(' ').collect();
        assert_eq!(fields[1], "7");
        assert!(fields[2].parse::<i64>().unwrap() > 1_500_000_000);
        assert_eq!(fields[3], "source=\"host-1\"");
        assert!(gauge_line.contains("\"application\"=\"weather\""));
        assert!(gauge_line.contains("\"queue\"=\"metrics\""));

        reporter.shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_heartbeat_sent_while_idle() {
        let (client, transport) = recording_client(100, 100);
        let reporter = WavefrontReporter::builder(tags())
            .with_source(Some("host-1"))
            .reporting_interval(Duration::from_millis(50))
            .build(client.clone());

        tokio::time::sleep(Duration::from_millis(180)).await;
        reporter.shutdown().await.unwrap();
        client.flush().await.unwrap();

        let lines = transport.lines(DataKind::Metric);
        let heartbeats = lines
            .iter()
            .filter(|line| line.starts_with("\"~component.heartbeat\" 1 "))
            .count();
        assert!(heartbeats >= 3, "only {} heartbeats", heartbeats);
        assert_eq!(heartbeats, lines.len());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_full_metric_queue_keeps_distributions() {
        // the startup heartbeat takes the only metric slot
        let (client, transport) = recording_client(1, 10);
        let reporter = WavefrontReporter::builder(tags())
            .with_source(Some("host-1"))
            .reporting_interval(Duration::from_secs(3600))
            .build(client.clone());
        assert_eq!(client.queued(DataKind::Metric), 1);

        let meter = reporter.meter("test");
        meter.u64_counter("requests").init().add(1, &[]);
        meter.f64_histogram("latency").init().record(0.25, &[]);

        let provider = reporter.meter_provider().clone();
        let flushed = tokio::task::spawn_blocking(move || provider.force_flush())
            .await
            .unwrap();
        assert!(flushed.is_err());
        client.flush().await.unwrap();

        assert_eq!(transport.lines(DataKind::Distribution).len(), 1);
        assert_eq!(client.dropped_count(), 1);

        reporter.shutdown().await.unwrap();
    }
}
