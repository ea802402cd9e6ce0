use crate::forecast::WeatherForecastService;
use std::fmt;
use std::sync::Arc;

pub mod api;
pub mod config;
pub mod forecast;
pub mod middleware;
pub mod telemetry;
pub mod wavefront;

pub use config::AppConfig;

pub struct AppContext {
    forecast_service: Arc<dyn WeatherForecastService>,
}

impl AppContext {
    pub fn new(forecast_service: Arc<dyn WeatherForecastService>) -> Self {
        Self { forecast_service }
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext").finish_non_exhaustive()
    }
}
