//! Request middleware.
//!
//! - Request IDs: generates a UUID v4 for each incoming request and creates a
//!   tracing span that wraps the entire request lifecycle, so every log line
//!   emitted while handling it carries the `request_id` field. Request counts
//!   and latencies are recorded through the `metrics` facade; they are only
//!   exported when the metrics recorder is installed.
//! - Maintenance mode: answers every request with the configured message.

use std::time::Instant;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::Instrument;
use uuid::Uuid;

use crate::state::AppState;

/// Extension type for accessing request ID in handlers if needed.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Middleware that generates a request ID and creates a request span.
///
/// This should be the outermost middleware layer so the span wraps
/// all request processing, including other middleware and handlers.
pub async fn request_id_layer(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let path = uri.path();

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %path,
        duration_ms = tracing::field::Empty,
    );

    let start = Instant::now();

    let mut request = request;
    request.extensions_mut().insert(RequestId(request_id));

    async move {
        let response = next.run(request).await;
        let elapsed = start.elapsed();
        let duration_ms = elapsed.as_millis() as u64;
        let status = response.status().as_u16();

        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::info!(status, duration_ms, "Request completed");

        metrics::counter!(
            "http_requests_total",
            "method" => method.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
        metrics::histogram!(
            "http_request_duration_seconds",
            "method" => method.to_string()
        )
        .record(elapsed.as_secs_f64());

        response
    }
    .instrument(span)
    .await
}

/// Middleware that short-circuits every request while maintenance mode is on.
pub async fn maintenance_layer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if state.config.maintenance.enabled {
        return state.config.maintenance.message.clone().into_response();
    }
    next.run(request).await
}
