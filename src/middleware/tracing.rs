use actix_web::body::MessageBody;
use actix_web::dev::{ServiceRequest, ServiceResponse};
use actix_web::http::header::{HeaderMap, USER_AGENT};
use actix_web::http::StatusCode;
use actix_web::middleware::Next;
use actix_web::{Error, HttpMessage};
use opentelemetry::propagation::Extractor;
use opentelemetry::trace::{TraceContextExt, TraceId};
use opentelemetry_semantic_conventions::trace::{
    CLIENT_ADDRESS, ERROR_TYPE, HTTP_REQUEST_METHOD, HTTP_RESPONSE_STATUS_CODE, HTTP_ROUTE,
    NETWORK_PROTOCOL_VERSION, URL_PATH, USER_AGENT_ORIGINAL,
};
use tracing::{field, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

/// Request-scoped trace handle, available to handlers as `web::ReqData<TraceInfo>`.
#[derive(Clone, Debug)]
pub struct TraceInfo {
    pub trace_id: TraceId,
    pub request_span: Span,
}

struct RequestHeaders<'a>(&'a HeaderMap);

impl Extractor for RequestHeaders<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|name| name.as_str()).collect()
    }
}

fn server_span(req: &ServiceRequest) -> Span {
    let route = req.match_pattern();
    let name = format!(
        "{} {}",
        req.method(),
        route.as_deref().unwrap_or_else(|| req.path())
    );
    let connection = req.connection_info();
    let user_agent = req
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok());

    let span = tracing::info_span!(
        "HTTP request",
        otel.name = name,
        otel.kind = "server",
        otel.status_code = field::Empty,
        { URL_PATH } = req.path(),
        { HTTP_ROUTE } = route.as_deref(),
        { HTTP_REQUEST_METHOD } = req.method().as_str(),
        { NETWORK_PROTOCOL_VERSION } = field::debug(req.version()),
        { CLIENT_ADDRESS } = connection.peer_addr(),
        { USER_AGENT_ORIGINAL } = user_agent,
        { HTTP_RESPONSE_STATUS_CODE } = field::Empty,
        { ERROR_TYPE } = field::Empty,
    );

    let parent = opentelemetry::global::get_text_map_propagator(|propagator| {
        propagator.extract(&RequestHeaders(req.headers()))
    });
    span.set_parent(parent);
    span
}

fn record_status(span: &Span, status: StatusCode) {
    span.record(HTTP_RESPONSE_STATUS_CODE, status.as_u16());
    if status.is_client_error() || status.is_server_error() {
        span.record(ERROR_TYPE, field::display(status));
        span.record("otel.status_code", "ERROR");
    }
}

/// Opens a server span per request, continuing any incoming W3C trace context.
pub async fn record_trace(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let span = server_span(&req);
    let trace_id = span.context().span().span_context().trace_id();
    req.extensions_mut().insert(TraceInfo {
        trace_id,
        request_span: span.clone(),
    });

    match next.call(req).await {
        Ok(res) => {
            record_status(&span, res.status());
            Ok(res)
        }
        Err(e) => {
            record_status(&span, e.as_response_error().status_code());
            Err(e)
        }
    }
}
