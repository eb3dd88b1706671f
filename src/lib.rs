//! Feedhost - HTTP transport layer for a feed reader service
//!
//! Selects and runs exactly one listener (inherited socket, Unix socket,
//! ACME-managed TLS, static TLS or plain HTTP), applies a hardened TLS policy,
//! and mounts the operational routes: `/healthcheck`, `/version` and a guarded
//! `/metrics`.

pub mod config;
pub mod error;
pub mod guard;
pub mod http;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod storage;

pub use config::ServerConfig;
pub use error::AppError;
pub use routes::create_router;
pub use state::AppState;
