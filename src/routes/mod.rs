//! Routes owned by the transport layer.
//!
//! `/healthcheck` and `/version` are always mounted; `/metrics` only when the
//! metrics feature is enabled, behind the access guard. The guard sees every
//! method, so a denied caller cannot tell the route exists. The application's own
//! routes are merged in by the caller, and the whole tree is wrapped in the
//! maintenance, timeout and request-id layers and nested under the base path.

pub mod health;
pub mod metrics;
pub mod version;

use axum::{
    middleware,
    routing::{any, get},
    Router,
};
use tower_http::timeout::TimeoutLayer;

use crate::guard::metrics_gate;
use crate::middleware::{maintenance_layer, request_id_layer};
use crate::state::AppState;

/// Creates the router: transport probes merged with `application`.
pub fn create_router(state: AppState, application: Router) -> Router {
    let mut probe_routes = Router::new()
        .route("/healthcheck", get(health::healthcheck))
        .route("/version", get(version::version));

    if state.config.metrics.enabled {
        probe_routes = probe_routes.route(
            "/metrics",
            any(metrics::render).route_layer(middleware::from_fn_with_state(
                state.clone(),
                metrics_gate,
            )),
        );
        if state.access.is_open() {
            tracing::warn!("Metrics endpoint enabled without credentials or network restrictions");
        }
    }

    let mut router = probe_routes.with_state(state.clone()).merge(application);

    if state.config.maintenance.enabled {
        tracing::warn!("Maintenance mode enabled");
        router = router.layer(middleware::from_fn_with_state(state.clone(), maintenance_layer));
    }

    let timeout = state.config.http.timeout();
    let router = router
        .layer(TimeoutLayer::new(timeout))
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer));

    match state.config.http.base_path() {
        Some(base_path) => Router::new().nest(base_path, router),
        None => router,
    }
}
