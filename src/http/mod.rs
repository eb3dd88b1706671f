//! Transport bootstrap.
//!
//! Exactly one listener mode runs per process, chosen in fixed precedence:
//! - **InheritedSocket**: socket passed down by a supervisor (`LISTEN_PID`)
//! - **UnixSocket**: listen address is a filesystem path
//! - **AutoCertTls**: ACME certificates for one domain, plus an HTTP-01
//!   challenge listener on port 80
//! - **StaticTls**: configured certificate and key
//! - **PlainHttp**: no TLS
//!
//! The server includes:
//! - A hardened rustls policy shared by both TLS modes
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Certificate hot-reload via SIGHUP (static TLS mode)

pub mod acme;
pub mod mode;
mod redirect;
pub mod server;
pub mod shutdown;
pub mod tls;

pub use mode::{select, Environment, ListenerMode};
pub use server::{start, Listeners, ServerError};
pub use shutdown::{Shutdown, ShutdownTrigger};
pub use tls::TlsPolicy;
