use super::format::{self, HistogramGranularity, SpanRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Used when a sender is built with a zero flush interval.
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum SenderError {
    #[error("invalid data: {0}")]
    InvalidData(String),

    #[error("{0} queue is full")]
    QueueFull(DataKind),

    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("ingestion endpoint responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("sender is closed")]
    Closed,
}

/// The kind of data a line carries; each kind has its own queue and endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataKind {
    Metric,
    Distribution,
    Span,
}

impl DataKind {
    pub const ALL: [DataKind; 3] = [DataKind::Metric, DataKind::Distribution, DataKind::Span];

    /// Value of the `f` parameter on the direct ingestion `/report` endpoint.
    pub fn report_format(&self) -> &'static str {
        match self {
            DataKind::Metric => "wavefront",
            DataKind::Distribution => "histogram",
            DataKind::Span => "trace",
        }
    }

    fn index(&self) -> usize {
        match self {
            DataKind::Metric => 0,
            DataKind::Distribution => 1,
            DataKind::Span => 2,
        }
    }
}

impl fmt::Display for DataKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataKind::Metric => "metric",
            DataKind::Distribution => "distribution",
            DataKind::Span => "span",
        };
        f.write_str(name)
    }
}

/// Delivers batches of formatted lines to Wavefront.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug + 'static {
    async fn deliver(&self, kind: DataKind, lines: &[String]) -> Result<(), SenderError>;

    async fn close(&self) -> Result<(), SenderError> {
        Ok(())
    }
}

#[derive(Debug)]
struct LineQueue {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl LineQueue {
    fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    fn push(&self, line: String) -> bool {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            return false;
        }
        lines.push_back(line);
        true
    }

    fn take_batch(&self, batch_size: usize) -> Vec<String> {
        let mut lines = self.lines.lock();
        let n = batch_size.min(lines.len());
        lines.drain(..n).collect()
    }

    /// Puts a failed batch back at the front, as much of it as still fits.
    fn requeue(&self, batch: Vec<String>) -> usize {
        let mut lines = self.lines.lock();
        let room = self.capacity.saturating_sub(lines.len());
        let kept = batch.len().min(room);
        for line in batch.into_iter().take(kept).rev() {
            lines.push_front(line);
        }
        kept
    }

    fn len(&self) -> usize {
        self.lines.lock().len()
    }
}

/// Queueing Wavefront sender shared by the reporter and the span reporter.
#[derive(Debug)]
pub struct WavefrontClient {
    transport: Arc<dyn Transport>,
    queues: [LineQueue; 3],
    batch_size: usize,
    flush_interval: Duration,
    dropped: AtomicU64,
    failures: AtomicU64,
    flush_lock: tokio::sync::Mutex<()>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    stop: Notify,
    closed: AtomicBool,
}

impl WavefrontClient {
    pub fn new(
        transport: Arc<dyn Transport>,
        max_queue_size: usize,
        batch_size: usize,
        flush_interval: Duration,
    ) -> Self {
        let flush_interval = if flush_interval.is_zero() {
            tracing::warn!(
                default = ?DEFAULT_FLUSH_INTERVAL,
                "zero flush interval, using the default"
            );
            DEFAULT_FLUSH_INTERVAL
        } else {
            flush_interval
        };
        Self {
            transport,
            queues: [
                LineQueue::new(max_queue_size),
                LineQueue::new(max_queue_size),
                LineQueue::new(max_queue_size),
            ],
            batch_size: batch_size.max(1),
            flush_interval,
            dropped: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            flush_lock: tokio::sync::Mutex::new(()),
            flush_task: Mutex::new(None),
            stop: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn queued(&self, kind: DataKind) -> usize {
        self.queues[kind.index()].len()
    }

    fn enqueue(&self, kind: DataKind, line: String) -> Result<(), SenderError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SenderError::Closed);
        }
        if self.queues[kind.index()].push(line) {
            Ok(())
        } else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            Err(SenderError::QueueFull(kind))
        }
    }

    pub fn send_metric(
        &self,
        name: &str,
        value: f64,
        timestamp: Option<i64>,
        source: &str,
        tags: &[(String, String)],
    ) -> Result<(), SenderError> {
        let line = format::metric_line(name, value, timestamp, source, tags)?;
        self.enqueue(DataKind::Metric, line)
    }

    /// Sends a delta counter; the `∆` prefix is added when missing.
    pub fn send_delta_counter(
        &self,
        name: &str,
        value: f64,
        source: &str,
        tags: &[(String, String)],
    ) -> Result<(), SenderError> {
        if name.starts_with(format::DELTA_PREFIX) {
            return self.send_metric(name, value, None, source, tags);
        }
        let name = format!("{}{}", format::DELTA_PREFIX, name);
        self.send_metric(&name, value, None, source, tags)
    }

    pub fn send_distribution(
        &self,
        name: &str,
        centroids: &[(f64, u64)],
        granularity: HistogramGranularity,
        timestamp: Option<i64>,
        source: &str,
        tags: &[(String, String)],
    ) -> Result<(), SenderError> {
        let line = format::histogram_line(name, centroids, granularity, timestamp, source, tags)?;
        self.enqueue(DataKind::Distribution, line)
    }

    pub fn send_span(&self, span: &SpanRecord, source: &str) -> Result<(), SenderError> {
        let line = format::span_line(span, source)?;
        self.enqueue(DataKind::Span, line)
    }

    /// Drains every queue through the transport in batches.
    /// Concurrent flushes run one after another.
    pub async fn flush(&self) -> Result<(), SenderError> {
        let _flushing = self.flush_lock.lock().await;
        let mut first_error = None;
        for kind in DataKind::ALL {
            if let Err(e) = self.flush_kind(kind).await {
                tracing::warn!(%kind, error = %e, "failed to flush wavefront data");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn flush_kind(&self, kind: DataKind) -> Result<(), SenderError> {
        let queue = &self.queues[kind.index()];
        loop {
            let batch = queue.take_batch(self.batch_size);
            if batch.is_empty() {
                return Ok(());
            }
            if let Err(e) = self.transport.deliver(kind, &batch).await {
                self.failures.fetch_add(1, Ordering::Relaxed);
                let total = batch.len();
                let kept = queue.requeue(batch);
                self.dropped.fetch_add((total - kept) as u64, Ordering::Relaxed);
                return Err(e);
            }
            tracing::trace!(%kind, lines = batch.len(), "flushed wavefront batch");
        }
    }

    /// Spawns the periodic flush task. Does nothing if it is already running.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.flush_task.lock();
        if task.is_some() || self.closed.load(Ordering::Acquire) {
            return;
        }
        let client = Arc::clone(self);
        *task = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(client.flush_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    biased;
                    _ = client.stop.notified() => break,
                    _ = interval.tick() => {
                        let _ = client.flush().await;
                    }
                }
            }
        }));
    }

    /// Stops the flush task, letting an in-flight batch finish, then drains
    /// the queues and closes the transport.
    pub async fn close(&self) -> Result<(), SenderError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            self.stop.notify_one();
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "wavefront flush task ended abnormally");
            }
        }
        let flushed = self.flush().await;
        self.transport.close().await?;
        flushed
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Transport that keeps delivered lines in memory.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingTransport {
        pub(crate) batches: Mutex<Vec<(DataKind, Vec<String>)>>,
        pub(crate) fail: AtomicBool,
        pub(crate) delay: Mutex<Duration>,
    }

    impl RecordingTransport {
        pub(crate) fn lines(&self, kind: DataKind) -> Vec<String> {
            self.batches
                .lock()
                .iter()
                .filter(|(k, _)| *k == kind)
                .flat_map(|(_, lines)| lines.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn deliver(&self, kind: DataKind, lines: &[String]) -> Result<(), SenderError> {
            let delay = *self.delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if self.fail.load(Ordering::Relaxed) {
                return Err(SenderError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
            }
            self.batches.lock().push((kind, lines.to_vec()));
            Ok(())
        }
    }

    pub(crate) fn recording_client(
        max_queue_size: usize,
        batch_size: usize,
    ) -> (Arc<WavefrontClient>, Arc<RecordingTransport>) {
        let transport = Arc::new(RecordingTransport::default());
        let client = WavefrontClient::new(
            transport.clone(),
            max_queue_size,
            batch_size,
            Duration::from_secs(1),
        );
        (Arc::new(client), transport)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{recording_client, RecordingTransport};
    use super::*;

    #[tokio::test]
    async fn test_flush_in_batches() {
        let (client, transport) = recording_client(100, 2);
        for i in 0..5 {
            client
                .send_metric("requests", i as f64, None, "host", &[])
                .unwrap();
        }
        client.flush().await.unwrap();

        let batches = transport.batches.lock();
        let sizes: Vec<usize> = batches.iter().map(|(_, lines)| lines.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(client.queued(DataKind::Metric), 0);
    }

    #[tokio::test]
    async fn test_queue_full_drops() {
        let (client, _transport) = recording_client(2, 10);
        client.send_metric("a", 1.0, None, "host", &[]).unwrap();
        client.send_metric("b", 1.0, None, "host", &[]).unwrap();
        let result = client.send_metric("c", 1.0, None, "host", &[]);

        assert!(matches!(result, Err(SenderError::QueueFull(DataKind::Metric))));
        assert_eq!(client.dropped_count(), 1);
        assert_eq!(client.queued(DataKind::Metric), 2);
    }

    #[tokio::test]
    async fn test_failed_batch_is_requeued() {
        let (client, transport) = recording_client(10, 10);
        transport.fail.store(true, Ordering::Relaxed);
        client.send_metric("a", 1.0, None, "host", &[]).unwrap();
        client.send_metric("b", 2.0, None, "host", &[]).unwrap();

        assert!(client.flush().await.is_err());
        assert_eq!(client.failure_count(), 1);
        assert_eq!(client.queued(DataKind::Metric), 2);

        transport.fail.store(false, Ordering::Relaxed);
        client.flush().await.unwrap();
        let lines = transport.lines(DataKind::Metric);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("\"a\""));
        assert!(lines[1].starts_with("\"b\""));
    }

    #[tokio::test]
    async fn test_delta_counter_prefix() {
        let (client, transport) = recording_client(10, 10);
        client
            .send_delta_counter("requests", 3.0, "host", &[])
            .unwrap();
        client.flush().await.unwrap();

        assert_eq!(
            transport.lines(DataKind::Metric),
            vec!["\"\u{2206}requests\" 3 source=\"host\"".to_string()]
        );
    }

    #[tokio::test]
    async fn test_kinds_use_separate_queues() {
        let (client, transport) = recording_client(10, 10);
        client
            .send_distribution(
                "latency",
                &[(1.0, 2)],
                HistogramGranularity::Minute,
                None,
                "host",
                &[],
            )
            .unwrap();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();
        client.flush().await.unwrap();

        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
        assert_eq!(transport.lines(DataKind::Distribution).len(), 1);
        assert!(transport.lines(DataKind::Span).is_empty());
    }

    #[tokio::test]
    async fn test_close_flushes_and_rejects() {
        let (client, transport) = recording_client(10, 10);
        client.start();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();
        client.close().await.unwrap();

        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
        assert!(matches!(
            client.send_metric("requests", 1.0, None, "host", &[]),
            Err(SenderError::Closed)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_inflight_batch() {
        let transport = Arc::new(RecordingTransport::default());
        *transport.delay.lock() = Duration::from_millis(300);
        let client = Arc::new(WavefrontClient::new(
            transport.clone(),
            10,
            10,
            Duration::from_millis(50),
        ));
        client.start();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();

        // the flush task has taken the batch and is inside deliver
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(client.queued(DataKind::Metric), 0);
        assert!(transport.lines(DataKind::Metric).is_empty());

        client.close().await.unwrap();
        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
        assert_eq!(client.dropped_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_flush_interval_uses_default() {
        let transport = Arc::new(RecordingTransport::default());
        let client = Arc::new(WavefrontClient::new(transport.clone(), 10, 10, Duration::ZERO));
        assert_eq!(client.flush_interval(), DEFAULT_FLUSH_INTERVAL);

        client.start();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();
        tokio::time::sleep(DEFAULT_FLUSH_INTERVAL + Duration::from_millis(500)).await;

        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
        assert_eq!(client.queued(DataKind::Metric), 0);
    }

    #[tokio::test]
    async fn test_start_twice_keeps_one_task() {
        let (client, transport) = recording_client(10, 10);
        client.start();
        client.start();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();
        client.close().await.unwrap();

        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let (client, transport) = recording_client(10, 10);
        client.start();
        client.send_metric("requests", 1.0, None, "host", &[]).unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(transport.lines(DataKind::Metric).len(), 1);
    }
}
