use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App, HttpServer};
use std::io;
use std::sync::Arc;
use wavefront_actix::api::route;
use wavefront_actix::forecast::HttpWeatherForecastService;
use wavefront_actix::middleware::tracing::record_trace;
use wavefront_actix::telemetry::{env_filter, init_subscriber, startup_subscriber};
use wavefront_actix::wavefront;
use wavefront_actix::{AppConfig, AppContext};

#[actix_web::main]
async fn main() -> io::Result<()> {
    let config_path = std::env::var("APP_CONFIG").unwrap_or_else(|_| "app.toml".to_string());
    let app_config = AppConfig::load(&config_path)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let startup = startup_subscriber(env_filter(&app_config.telemetry), io::stdout);
    let telemetry = tracing::subscriber::with_default(startup, || {
        wavefront::register(&app_config)
    })
    .map(Arc::new)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    telemetry.install_global();
    init_subscriber(&app_config.telemetry, telemetry.tracer());

    let forecast_service = Arc::new(HttpWeatherForecastService::new(
        app_config.forecast.base_url.clone(),
    ));
    let context = web::Data::new(AppContext::new(forecast_service));

    tracing::info!(
        host = %app_config.server.host,
        port = app_config.server.port,
        "starting server"
    );

    let app_telemetry = telemetry.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(context.clone())
            .configure(|cfg| app_telemetry.configure(cfg))
            .wrap(Logger::default())
            .wrap(from_fn(record_trace))
            .wrap(app_telemetry.http_metrics())
            .configure(route)
    })
    .bind((app_config.server.host.as_str(), app_config.server.port))?
    .run()
    .await?;

    if let Err(e) = telemetry.shutdown().await {
        tracing::warn!(error = %e, "failed to flush telemetry on shutdown");
    }

    Ok(())
}
