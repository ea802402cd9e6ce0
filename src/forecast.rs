use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const FORECAST_PATH: &str = "/weatherforecast";

const SUMMARIES: [&str; 10] = [
    "Freezing",
    "Bracing",
    "Chilly",
    "Cool",
    "Mild",
    "Warm",
    "Balmy",
    "Hot",
    "Sweltering",
    "Scorching",
];

#[derive(Error, Debug)]
pub enum ForecastError {
    #[error("forecast request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("forecast endpoint responded with {0}")]
    Status(reqwest::StatusCode),

    #[error("malformed forecast response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WeatherForecast {
    #[serde(with = "forecast_date")]
    pub date: NaiveDateTime,
    pub temperature_c: i32,
    pub summary: Option<String>,
}

impl WeatherForecast {
    pub fn temperature_f(&self) -> i32 {
        // the float-to-int cast saturates, so only the offset can overflow
        32i32.saturating_add((self.temperature_c as f64 / 0.5556) as i32)
    }
}

/// Dates arrive either as RFC 3339 timestamps, as zone-less timestamps, or as plain dates.
mod forecast_date {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
    use serde::{de, Deserialize, Deserializer, Serializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn serialize<S: Serializer>(date: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&date.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(deserializer)?;
        if let Ok(date) = DateTime::parse_from_rfc3339(&s) {
            return Ok(date.naive_local());
        }
        if let Ok(date) = NaiveDateTime::parse_from_str(&s, "%Y-%m-%dT%H:%M:%S%.f") {
            return Ok(date);
        }
        NaiveDate::parse_from_str(&s, "%Y-%m-%d")
            .map(|date| date.and_time(NaiveTime::MIN))
            .map_err(|_| de::Error::custom(format!("invalid forecast date '{}'", s)))
    }
}

#[async_trait]
pub trait WeatherForecastService: Send + Sync {
    async fn get_forecast(&self, start_date: NaiveDate)
        -> Result<Vec<WeatherForecast>, ForecastError>;
}

/// Fetches forecasts from a backend's `/weatherforecast` endpoint.
#[derive(Debug, Clone)]
pub struct HttpWeatherForecastService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWeatherForecastService {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }
}

#[async_trait]
impl WeatherForecastService for HttpWeatherForecastService {
    // The start date is not part of the request; the backend picks the range.
    #[tracing::instrument(
        skip_all,
        fields(base_url = %self.base_url, start_date = %start_date)
    )]
    async fn get_forecast(
        &self,
        start_date: NaiveDate,
    ) -> Result<Vec<WeatherForecast>, ForecastError> {
        let response = self
            .client
            .get(format!("{}{}", self.base_url, FORECAST_PATH))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ForecastError::Status(status));
        }

        let body = response.bytes().await?;
        let forecasts: Vec<WeatherForecast> = serde_json::from_slice(&body)?;
        tracing::debug!(count = forecasts.len(), "fetched forecasts");
        Ok(forecasts)
    }
}

/// Random sample forecasts for consecutive days starting at `start_date`.
pub fn generate_forecasts(start_date: NaiveDate, count: usize) -> Vec<WeatherForecast> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| WeatherForecast {
            date: (start_date + chrono::Duration::days(i as i64)).and_time(NaiveTime::MIN),
            temperature_c: rng.gen_range(-20..55),
            summary: Some(SUMMARIES[rng.gen_range(0..SUMMARIES.len())].to_string()),
        })
        .collect()
}
