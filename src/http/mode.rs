//! Listener mode selection.
//!
//! The precedence rule lives in [`PRECEDENCE`]: an ordered table of
//! (mode, predicate) pairs, evaluated top to bottom, first match wins. The
//! last entry always matches, so selection is total.

use std::fmt;

use crate::config::{ServerConfig, LISTEN_PID_ENV};

/// The single serving strategy a process runs with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerMode {
    /// Socket handed down by a supervisor (systemd socket activation)
    InheritedSocket,
    /// Unix domain socket at a filesystem path
    UnixSocket,
    /// TLS with certificates obtained on demand through ACME
    AutoCertTls,
    /// TLS with a configured certificate and key
    StaticTls,
    /// No transport encryption
    PlainHttp,
}

impl fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ListenerMode::InheritedSocket => "inherited-socket",
            ListenerMode::UnixSocket => "unix-socket",
            ListenerMode::AutoCertTls => "auto-cert-tls",
            ListenerMode::StaticTls => "static-tls",
            ListenerMode::PlainHttp => "plain-http",
        };
        f.write_str(name)
    }
}

/// The parts of the process environment that influence selection.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    /// Value of `LISTEN_PID`, if set
    pub listen_pid: Option<String>,
    /// This process's PID
    pub pid: u32,
}

impl Environment {
    pub fn from_process() -> Self {
        Self {
            listen_pid: std::env::var(LISTEN_PID_ENV).ok(),
            pid: std::process::id(),
        }
    }

    /// True when a supervisor passed sockets meant for this exact process.
    ///
    /// The value must spell this process's PID exactly.
    pub fn socket_activated(&self) -> bool {
        self.listen_pid.as_deref() == Some(self.pid.to_string().as_str())
    }
}

type Predicate = fn(&ServerConfig, &Environment) -> bool;

/// Selection order. Changing it changes which transport wins when several
/// are configured.
pub const PRECEDENCE: [(ListenerMode, Predicate); 5] = [
    (ListenerMode::InheritedSocket, is_socket_activated),
    (ListenerMode::UnixSocket, has_unix_socket_path),
    (ListenerMode::AutoCertTls, has_cert_domain),
    (ListenerMode::StaticTls, has_cert_pair),
    (ListenerMode::PlainHttp, always),
];

fn is_socket_activated(_: &ServerConfig, env: &Environment) -> bool {
    env.socket_activated()
}

fn has_unix_socket_path(config: &ServerConfig, _: &Environment) -> bool {
    config.http.unix_socket_path().is_some()
}

fn has_cert_domain(config: &ServerConfig, _: &Environment) -> bool {
    config.http.cert_domain().is_some()
}

fn has_cert_pair(config: &ServerConfig, _: &Environment) -> bool {
    config.http.cert_pair().is_some()
}

fn always(_: &ServerConfig, _: &Environment) -> bool {
    true
}

/// Pick the listener mode for this process.
pub fn select(config: &ServerConfig, env: &Environment) -> ListenerMode {
    PRECEDENCE
        .iter()
        .find(|(_, matches)| matches(config, env))
        .map(|(mode, _)| *mode)
        .unwrap_or(ListenerMode::PlainHttp)
}
