//! Graceful shutdown and signal handling.
//!
//! Handles:
//! - SIGTERM/SIGINT: graceful shutdown of every listener with connection draining
//! - SIGHUP: certificate reload (static TLS mode only)

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use tokio::sync::watch;

use crate::config::SHUTDOWN_GRACE_SECS;

use super::tls::TlsPolicy;

/// Process-wide shutdown broadcast shared by all listeners.
#[derive(Clone, Debug)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
    grace: Duration,
}

/// Sending half of [`Shutdown`].
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        let _ = self.tx.send(true);
    }
}

impl Shutdown {
    /// A shutdown that fires only when the returned trigger is used.
    pub fn manual() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        let grace = Duration::from_secs(SHUTDOWN_GRACE_SECS);
        (ShutdownTrigger { tx }, Shutdown { rx, grace })
    }

    /// Override how long listeners drain before open connections are dropped.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// A shutdown that fires on SIGTERM or Ctrl+C.
    pub fn on_signals() -> Shutdown {
        let (trigger, shutdown) = Self::manual();

        tokio::spawn(async move {
            wait_for_signal().await;
            trigger.trigger();
        });

        shutdown
    }

    /// Resolves once shutdown has been requested.
    pub fn requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let mut rx = self.rx.clone();
        async move {
            let fired = rx.wait_for(|requested| *requested).await.is_ok();
            if !fired {
                // Trigger dropped without firing: never shut down.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Drive `handle` into a graceful shutdown once shutdown is requested.
    ///
    /// When requested, the server will:
    /// 1. Stop accepting new connections
    /// 2. Wait for existing connections to complete
    /// 3. Shutdown gracefully
    pub fn attach(&self, handle: Handle) {
        let requested = self.requested();
        let grace = self.grace;
        tokio::spawn(async move {
            requested.await;
            handle.graceful_shutdown(Some(grace));
            tracing::info!(
                grace_ms = grace.as_millis() as u64,
                "Graceful shutdown initiated, waiting for connections to close"
            );
        });
    }
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}

/// Setup SIGHUP handler for certificate reload (static TLS mode).
///
/// On SIGHUP the certificate and key are re-read and swapped in under the same
/// hardened policy. A failed reload keeps the previous pair.
#[cfg(unix)]
pub fn setup_reload_handler(
    rustls_config: RustlsConfig,
    policy: Arc<TlsPolicy>,
    cert_path: PathBuf,
    key_path: PathBuf,
) {
    tokio::spawn(async move {
        let mut sighup =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                Ok(signal) => signal,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to install SIGHUP handler");
                    return;
                }
            };

        loop {
            sighup.recv().await;
            tracing::info!("Received SIGHUP, reloading TLS certificates");

            match policy.with_pem_files(&cert_path, &key_path) {
                Ok(config) => {
                    rustls_config.reload_from_config(Arc::new(config));
                    tracing::info!(
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "TLS certificates reloaded successfully"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        cert = %cert_path.display(),
                        key = %key_path.display(),
                        "Failed to reload TLS certificates"
                    );
                }
            }
        }
    });
}

/// No-op reload handler for non-Unix platforms.
#[cfg(not(unix))]
pub fn setup_reload_handler(
    _rustls_config: RustlsConfig,
    _policy: Arc<TlsPolicy>,
    _cert_path: PathBuf,
    _key_path: PathBuf,
) {
    tracing::warn!("Certificate hot-reload via SIGHUP not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manual_trigger_resolves_requested() {
        let (trigger, shutdown) = Shutdown::manual();
        let waiter = tokio::spawn(shutdown.requested());

        trigger.trigger();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("shutdown not observed")
            .unwrap();
    }

    #[test]
    fn test_default_grace_period() {
        let (_trigger, shutdown) = Shutdown::manual();
        assert_eq!(shutdown.grace(), Duration::from_secs(SHUTDOWN_GRACE_SECS));
        let shutdown = shutdown.with_grace(Duration::from_millis(250));
        assert_eq!(shutdown.grace(), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_dropped_trigger_never_resolves() {
        let (trigger, shutdown) = Shutdown::manual();
        drop(trigger);

        let result = tokio::time::timeout(Duration::from_millis(50), shutdown.requested()).await;
        assert!(result.is_err());
    }
}
