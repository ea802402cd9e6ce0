use crate::forecast::generate_forecasts;
use crate::middleware::tracing::TraceInfo;
use crate::AppContext;
use actix_web::{get, web, HttpResponse, Responder};
use chrono::{Local, NaiveDate};
use tracing::instrument;

const FORECAST_DAYS: usize = 5;

pub fn route(cfg: &mut web::ServiceConfig) {
    cfg.service(weather_forecast).service(forecast);
}

#[get("/weatherforecast")]
pub async fn weather_forecast(trace_info: Option<web::ReqData<TraceInfo>>) -> impl Responder {
    let tomorrow = Local::now().date_naive() + chrono::Duration::days(1);
    let forecasts = match trace_info {
        Some(trace_info) => generate(trace_info.into_inner(), tomorrow).await,
        None => generate_forecasts(tomorrow, FORECAST_DAYS),
    };
    HttpResponse::Ok().json(forecasts)
}

#[instrument(parent = &_trace_info.request_span, skip(_trace_info))]
async fn generate(
    _trace_info: TraceInfo,
    start_date: NaiveDate,
) -> Vec<crate::forecast::WeatherForecast> {
    generate_forecasts(start_date, FORECAST_DAYS)
}

#[get("/forecast")]
pub async fn forecast(context: web::Data<AppContext>) -> impl Responder {
    let today = Local::now().date_naive();
    match context.forecast_service.get_forecast(today).await {
        Ok(forecasts) => HttpResponse::Ok().json(forecasts),
        Err(e) => {
            tracing::error!(error = %e, "failed to fetch forecast");
            HttpResponse::BadGateway().body(e.to_string())
        }
    }
}
