//! Shared application state for request handlers.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::config::ServerConfig;
use crate::guard::AccessPolicy;
use crate::storage::StorageProbe;

/// Shared application state, cloneable across handlers via Arc-wrapped fields.
///
/// Holds the immutable configuration, the storage liveness probe, the metrics
/// admission policy, and the Prometheus exporter when metrics are enabled.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub storage: Arc<dyn StorageProbe>,
    pub access: Arc<AccessPolicy>,
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Creates the state; the access policy is derived from `config.metrics`.
    pub fn new(
        config: Arc<ServerConfig>,
        storage: Arc<dyn StorageProbe>,
        metrics: Option<PrometheusHandle>,
    ) -> Self {
        let access = Arc::new(AccessPolicy::from_config(&config.metrics));
        Self {
            config,
            storage,
            access,
            metrics,
        }
    }
}
