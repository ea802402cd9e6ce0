use actix_web::body::{BodySize, MessageBody};
use actix_web::dev::{self, Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::header::CONTENT_LENGTH;
use futures_util::future::{self, LocalBoxFuture};
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::trace::{
    HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE, URL_SCHEME,
};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

const DURATION: &str = "http.server.duration";
const ACTIVE_REQUESTS: &str = "http.server.active_requests";
const REQUEST_SIZE: &str = "http.server.request.size";
const RESPONSE_SIZE: &str = "http.server.response.size";
const SERVER_ERRORS: &str = "http.server.errors";

#[derive(Debug)]
struct Instruments {
    duration: Histogram<f64>,
    active_requests: UpDownCounter<i64>,
    request_size: Histogram<u64>,
    response_size: Histogram<u64>,
    server_errors: Counter<u64>,
}

impl Instruments {
    fn register(meter: &Meter) -> Self {
        Self {
            duration: meter
                .f64_histogram(DURATION)
                .with_description("Duration of inbound HTTP requests.")
                .with_unit("s")
                .init(),
            active_requests: meter
                .i64_up_down_counter(ACTIVE_REQUESTS)
                .with_description("HTTP requests currently in flight.")
                .init(),
            request_size: meter
                .u64_histogram(REQUEST_SIZE)
                .with_description("Declared size of HTTP request bodies.")
                .with_unit("By")
                .init(),
            response_size: meter
                .u64_histogram(RESPONSE_SIZE)
                .with_description("Size of sized HTTP response bodies.")
                .with_unit("By")
                .init(),
            server_errors: meter
                .u64_counter(SERVER_ERRORS)
                .with_description("Requests answered with a 5xx status.")
                .init(),
        }
    }
}

/// Attributes captured before the request is handed to the inner service.
struct RequestAttributes {
    method: String,
    scheme: String,
    route: String,
}

impl RequestAttributes {
    fn capture(req: &ServiceRequest) -> Self {
        Self {
            method: req.method().to_string(),
            scheme: req.connection_info().scheme().to_string(),
            route: req.match_pattern().unwrap_or_default(),
        }
    }

    // no route or status: both sides of the in-flight count share one series
    fn in_flight(&self) -> [KeyValue; 2] {
        [
            KeyValue::new(HTTP_REQUEST_METHOD, self.method.clone()),
            KeyValue::new(URL_SCHEME, self.scheme.clone()),
        ]
    }

    fn completed(self, status: u16) -> [KeyValue; 4] {
        [
            KeyValue::new(HTTP_REQUEST_METHOD, self.method),
            KeyValue::new(URL_SCHEME, self.scheme),
            KeyValue::new(HTTP_ROUTE, self.route),
            KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status)),
        ]
    }
}

fn declared_length(req: &ServiceRequest) -> u64 {
    req.headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}

/// Records per-request server metrics into the Wavefront reporter's meter.
#[derive(Clone, Debug)]
pub struct HttpMetrics {
    instruments: Arc<Instruments>,
}

impl HttpMetrics {
    pub fn new(meter: Arc<Meter>) -> Self {
        Self {
            instruments: Arc::new(Instruments::register(&meter)),
        }
    }
}

impl<S, B> Transform<S, ServiceRequest> for HttpMetrics
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Transform = HttpMetricsMiddleware<S>;
    type InitError = ();
    type Future = future::Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        future::ok(HttpMetricsMiddleware {
            service: Rc::new(service),
            instruments: self.instruments.clone(),
        })
    }
}

pub struct HttpMetricsMiddleware<S> {
    service: Rc<S>,
    instruments: Arc<Instruments>,
}

impl<S, B> Service<ServiceRequest> for HttpMetricsMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = actix_web::Error> + 'static,
    S::Future: 'static,
    B: MessageBody + 'static,
{
    type Response = ServiceResponse<B>;
    type Error = actix_web::Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    dev::forward_ready!(service);

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let started = Instant::now();
        let instruments = self.instruments.clone();
        let service = self.service.clone();
        let attributes = RequestAttributes::capture(&req);
        let request_size = declared_length(&req);
        let in_flight = attributes.in_flight();

        Box::pin(async move {
            instruments.active_requests.add(1, &in_flight);
            let outcome = service.call(req).await;
            instruments.active_requests.add(-1, &in_flight);
            let res = outcome?;

            let status = res.status();
            let completed = attributes.completed(status.as_u16());
            if status.is_server_error() {
                instruments.server_errors.add(1, &completed);
            }

            let response_size = match res.response().body().size() {
                BodySize::Sized(size) => size,
                _ => 0,
            };
            instruments.request_size.record(request_size, &completed);
            instruments.response_size.record(response_size, &completed);
            instruments
                .duration
                .record(started.elapsed().as_secs_f64(), &completed);

            Ok(res)
        })
    }
}
