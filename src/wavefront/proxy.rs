use super::sender::{DataKind, SenderError, Transport, WavefrontClient};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;

const DEFAULT_METRICS_PORT: u16 = 2878;
const DEFAULT_TRACING_PORT: u16 = 30000;
const DEFAULT_PROXY_QUEUE_SIZE: usize = 50_000;
const DEFAULT_PROXY_BATCH_SIZE: usize = 10_000;

/// A lazily opened TCP stream to one proxy listener port.
#[derive(Debug)]
struct ProxyConnection {
    addr: String,
    stream: Mutex<Option<TcpStream>>,
}

impl ProxyConnection {
    fn new(host: &str, port: u16) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            stream: Mutex::new(None),
        }
    }

    async fn write_lines(&self, lines: &[String]) -> Result<(), SenderError> {
        let mut payload = lines.join("\n");
        payload.push('\n');

        let mut guard = self.stream.lock().await;
        if guard.is_none() {
            let stream = TcpStream::connect(&self.addr)
                .await
                .map_err(|source| self.connection_error(source))?;
            tracing::debug!(addr = %self.addr, "connected to wavefront proxy");
            *guard = Some(stream);
        }

        let Some(stream) = guard.as_mut() else {
            return Err(SenderError::Closed);
        };
        let written = async {
            stream.write_all(payload.as_bytes()).await?;
            stream.flush().await
        }
        .await;
        if let Err(source) = written {
            // Reconnect on the next flush.
            *guard = None;
            return Err(self.connection_error(source));
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SenderError> {
        if let Some(mut stream) = self.stream.lock().await.take() {
            stream
                .shutdown()
                .await
                .map_err(|source| self.connection_error(source))?;
        }
        Ok(())
    }

    fn connection_error(&self, source: std::io::Error) -> SenderError {
        SenderError::Connection {
            addr: self.addr.clone(),
            source,
        }
    }
}

/// Sends line data to a Wavefront proxy over plain TCP, one listener per data kind.
#[derive(Debug)]
pub struct ProxyTransport {
    metrics: ProxyConnection,
    distributions: ProxyConnection,
    spans: ProxyConnection,
}

impl ProxyTransport {
    fn connection(&self, kind: DataKind) -> &ProxyConnection {
        match kind {
            DataKind::Metric => &self.metrics,
            DataKind::Distribution => &self.distributions,
            DataKind::Span => &self.spans,
        }
    }
}

#[async_trait]
impl Transport for ProxyTransport {
    async fn deliver(&self, kind: DataKind, lines: &[String]) -> Result<(), SenderError> {
        self.connection(kind).write_lines(lines).await
    }

    async fn close(&self) -> Result<(), SenderError> {
        self.metrics.shutdown().await?;
        self.distributions.shutdown().await?;
        self.spans.shutdown().await
    }
}

#[derive(Debug)]
pub struct ProxyClientBuilder {
    hostname: String,
    metrics_port: u16,
    distribution_port: u16,
    tracing_port: u16,
    flush_interval: Duration,
    max_queue_size: usize,
    batch_size: usize,
}

impl ProxyClientBuilder {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            metrics_port: DEFAULT_METRICS_PORT,
            distribution_port: DEFAULT_METRICS_PORT,
            tracing_port: DEFAULT_TRACING_PORT,
            flush_interval: Duration::from_secs(5),
            max_queue_size: DEFAULT_PROXY_QUEUE_SIZE,
            batch_size: DEFAULT_PROXY_BATCH_SIZE,
        }
    }

    pub fn metrics_port(mut self, port: u16) -> Self {
        self.metrics_port = port;
        self
    }

    pub fn distribution_port(mut self, port: u16) -> Self {
        self.distribution_port = port;
        self
    }

    pub fn tracing_port(mut self, port: u16) -> Self {
        self.tracing_port = port;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn build(self) -> WavefrontClient {
        let transport = ProxyTransport {
            metrics: ProxyConnection::new(&self.hostname, self.metrics_port),
            distributions: ProxyConnection::new(&self.hostname, self.distribution_port),
            spans: ProxyConnection::new(&self.hostname, self.tracing_port),
        };
        WavefrontClient::new(
            Arc::new(transport),
            self.max_queue_size,
            self.batch_size,
            self.flush_interval,
        )
    }
}
