//! Admission control for the `/metrics` endpoint.
//!
//! The decision is a pure function of the configured policy, the Basic
//! credentials the caller presented, and the transport peer address. Forwarded
//! headers never influence admission; they are only used to make denial logs
//! more useful. A denied caller gets the same 404 as for an unknown route.

use std::net::{IpAddr, SocketAddr};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::{Authorization, HeaderMapExt};
use ipnet::IpNet;

use crate::config::MetricsConfig;
use crate::state::AppState;

/// Credentials presented by the caller.
#[derive(Debug, Clone, Copy)]
pub struct BasicCredentials<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Why a caller was turned away. Logged, never returned to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Denial {
    #[error("No authentication header sent")]
    MissingCredentials,
    #[error("Empty username or password")]
    EmptyCredentials,
    #[error("Invalid username or password")]
    InvalidCredentials,
    #[error("Peer address unavailable")]
    UnknownOrigin,
    #[error("Client not allowed")]
    OriginNotAllowed,
}

/// Static admission policy derived from `[metrics]`.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
    credentials: Option<(String, String)>,
    networks: Vec<IpNet>,
}

impl AccessPolicy {
    pub fn new(credentials: Option<(String, String)>, networks: Vec<IpNet>) -> Self {
        Self {
            credentials: credentials.filter(|(u, p)| !u.is_empty() && !p.is_empty()),
            networks,
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(
            config
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
            config.allowed_networks.clone(),
        )
    }

    /// True when neither credentials nor networks restrict access.
    pub fn is_open(&self) -> bool {
        self.credentials.is_none() && self.networks.is_empty()
    }

    /// Evaluate a request: credentials first, then the peer's network.
    pub fn evaluate(
        &self,
        presented: Option<BasicCredentials<'_>>,
        peer: Option<IpAddr>,
    ) -> Result<(), Denial> {
        if let Some((username, password)) = &self.credentials {
            let presented = presented.ok_or(Denial::MissingCredentials)?;
            if presented.username.is_empty() || presented.password.is_empty() {
                return Err(Denial::EmptyCredentials);
            }
            // both comparisons always run
            let user_ok = constant_time_eq(presented.username, username);
            let pass_ok = constant_time_eq(presented.password, password);
            if !(user_ok && pass_ok) {
                return Err(Denial::InvalidCredentials);
            }
        }

        if !self.networks.is_empty() {
            let peer = peer.ok_or(Denial::UnknownOrigin)?.to_canonical();
            if !self.networks.iter().any(|network| network.contains(&peer)) {
                return Err(Denial::OriginNotAllowed);
            }
        }

        Ok(())
    }

    pub fn allowed(&self, presented: Option<BasicCredentials<'_>>, peer: Option<IpAddr>) -> bool {
        self.evaluate(presented, peer).is_ok()
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Best-effort client address for audit logs: forwarded headers, then peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> String {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    forwarded
        .or(real_ip)
        .map(str::to_string)
        .or_else(|| peer.map(|ip| ip.to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Middleware gating the metrics handler.
pub async fn metrics_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let authorization = request.headers().typed_get::<Authorization<Basic>>();
    let presented = authorization.as_ref().map(|auth| BasicCredentials {
        username: auth.username(),
        password: auth.password(),
    });

    if let Err(denial) = state.access.evaluate(presented, peer) {
        let client = client_ip(request.headers(), peer);
        let remote = peer.map(|ip| ip.to_string()).unwrap_or_default();
        match denial {
            Denial::MissingCredentials | Denial::EmptyCredentials => {
                tracing::info!(client_ip = %client, remote_addr = %remote, reason = %denial, "Metrics access denied");
            }
            _ => {
                tracing::error!(client_ip = %client, remote_addr = %remote, reason = %denial, "Metrics access denied");
            }
        }
        return StatusCode::NOT_FOUND.into_response();
    }

    next.run(request).await
}
