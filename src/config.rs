use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const WAVEFRONT_PROXY: &str = "wavefront-proxy";
pub const WAVEFRONT_DIRECT_INGESTION: &str = "wavefront-direct-ingestion";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {section}.{field}: {reason}")]
    Invalid {
        section: &'static str,
        field: &'static str,
        reason: &'static str,
    },
}

/// Application configuration, read from `app.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(rename = "wavefront-proxy")]
    pub wavefront_proxy: Option<WavefrontProxyOptions>,
    #[serde(rename = "wavefront-direct-ingestion")]
    pub wavefront_direct_ingestion: Option<WavefrontDirectIngestionOptions>,
    #[serde(default)]
    pub forecast: ForecastConfig,
}

impl AppConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        content.parse()
    }
}

impl std::str::FromStr for AppConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: AppConfig = toml::from_str(s)?;
        if let Some(proxy) = &config.wavefront_proxy {
            proxy.credentials.validate(WAVEFRONT_PROXY)?;
        }
        if let Some(direct) = &config.wavefront_direct_ingestion {
            direct.credentials.validate(WAVEFRONT_DIRECT_INGESTION)?;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SenderKind {
    #[default]
    Proxy,
    DirectIngestion,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub sender: SenderKind,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            sender: SenderKind::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ForecastConfig {
    #[serde(default = "default_forecast_base_url")]
    pub base_url: String,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            base_url: default_forecast_base_url(),
        }
    }
}

/// Identity and timing settings shared by both Wavefront sender kinds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WavefrontCredentials {
    pub application: String,
    pub service: String,
    pub cluster: Option<String>,
    pub shard: Option<String>,
    pub source: Option<String>,
    #[serde(default = "default_reporting_interval_seconds")]
    pub reporting_interval_seconds: u64,
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
}

impl WavefrontCredentials {
    pub fn reporting_interval(&self) -> Duration {
        Duration::from_secs(self.reporting_interval_seconds)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_seconds)
    }

    fn validate(&self, section: &'static str) -> Result<(), ConfigError> {
        let zero = |field| ConfigError::Invalid {
            section,
            field,
            reason: "must be at least 1 second",
        };
        if self.reporting_interval_seconds == 0 {
            return Err(zero("reporting_interval_seconds"));
        }
        if self.flush_interval_seconds == 0 {
            return Err(zero("flush_interval_seconds"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WavefrontProxyOptions {
    #[serde(flatten)]
    pub credentials: WavefrontCredentials,
    pub hostname: String,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    #[serde(default = "default_metrics_port")]
    pub distribution_port: u16,
    #[serde(default = "default_tracing_port")]
    pub tracing_port: u16,
}

#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct WavefrontDirectIngestionOptions {
    #[serde(flatten)]
    pub credentials: WavefrontCredentials,
    pub hostname: String,
    pub token: String,
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

// Keeps the API token out of logs.
impl fmt::Debug for WavefrontDirectIngestionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WavefrontDirectIngestionOptions")
            .field("credentials", &self.credentials)
            .field("hostname", &self.hostname)
            .field("token", &"<redacted>")
            .field("max_queue_size", &self.max_queue_size)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_forecast_base_url() -> String {
    "http://127.0.0.1:8080".to_string()
}

fn default_reporting_interval_seconds() -> u64 {
    30
}

fn default_flush_interval_seconds() -> u64 {
    2
}

fn default_metrics_port() -> u16 {
    2878
}

fn default_tracing_port() -> u16 {
    30000
}

fn default_max_queue_size() -> usize {
    100_000
}

fn default_batch_size() -> usize {
    20_000
}
