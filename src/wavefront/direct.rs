use super::sender::{DataKind, SenderError, Transport, WavefrontClient};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_MAX_QUEUE_SIZE: usize = 50_000;
const DEFAULT_BATCH_SIZE: usize = 10_000;

/// Posts line data straight to a Wavefront cluster's `/report` endpoint.
#[derive(Debug)]
pub struct DirectIngestionTransport {
    client: reqwest::Client,
    report_url: String,
    token: String,
}

impl DirectIngestionTransport {
    pub fn new(server: &str, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            report_url: format!("{}/report", server.trim_end_matches('/')),
            token: token.into(),
        }
    }
}

#[async_trait]
impl Transport for DirectIngestionTransport {
    async fn deliver(&self, kind: DataKind, lines: &[String]) -> Result<(), SenderError> {
        let mut body = lines.join("\n");
        body.push('\n');

        let response = self
            .client
            .post(&self.report_url)
            .query(&[("f", kind.report_format())])
            .header(AUTHORIZATION, format!("Bearer {}", self.token))
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SenderError::Status(status));
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct DirectIngestionClientBuilder {
    server: String,
    token: String,
    max_queue_size: usize,
    batch_size: usize,
    flush_interval: Duration,
}

impl DirectIngestionClientBuilder {
    pub fn new(server: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: token.into(),
            max_queue_size: DEFAULT_MAX_QUEUE_SIZE,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: Duration::from_secs(1),
        }
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.max_queue_size = size;
        self
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn build(self) -> WavefrontClient {
        let transport = DirectIngestionTransport::new(&self.server, self.token);
        WavefrontClient::new(
            Arc::new(transport),
            self.max_queue_size,
            self.batch_size,
            self.flush_interval,
        )
    }
}
