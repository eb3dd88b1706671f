//! Health check endpoint for container orchestration.
//!
//! Unlike a bare liveness probe, `/healthcheck` also pings the storage
//! collaborator, so a process that has lost its database reports 500.

use axum::extract::State;

use crate::error::AppError;
use crate::state::AppState;

/// Body returned when storage is reachable
pub const HEALTHY_BODY: &str = "OK";

/// Health check handler.
pub async fn healthcheck(State(state): State<AppState>) -> Result<&'static str, AppError> {
    state.storage.ping().await?;
    Ok(HEALTHY_BODY)
}
