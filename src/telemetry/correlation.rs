//! Correlation id propagation.
//! Mission: tag every inbound request with a fresh id if none is supplied,
//! and carry it through logs, outbound adapter calls, and the response.

use axum::{
    body::Body,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const CORRELATION_HEADER: &str = "X-Request-ID";

/// Extension type carried on the request/response so downstream handlers
/// and outbound adapter calls can read the id without re-parsing headers.
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

impl CorrelationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub async fn correlation_id(mut request: Request<Body>, next: Next) -> Response {
    let incoming = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string());

    let id = CorrelationId(incoming.unwrap_or_else(|| Uuid::new_v4().to_string()));
    request.extensions_mut().insert(id.clone());

    let span = tracing::info_span!("request", correlation_id = %id.0);
    let _guard = span.enter();

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&id.0) {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}
