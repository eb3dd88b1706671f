//! Configuration loading and constants.
//!
//! Loads the server configuration from a TOML file once at startup. The
//! resulting `ServerConfig` is immutable and is handed by reference to the
//! listener selector and by `Arc` to request handlers; nothing reads
//! configuration through globals.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use ipnet::IpNet;
use serde::Deserialize;

// =============================================================================
// Transport Constants
// =============================================================================

/// Conventional port for the TLS listener in ACME mode
pub const HTTPS_PORT: u16 = 443;

/// Conventional port for the ACME HTTP-01 challenge listener
pub const HTTP_PORT: u16 = 80;

/// First file descriptor handed down by a socket-activating supervisor
pub const LISTEN_FDS_START: i32 = 3;

/// Environment variable carrying the PID the inherited sockets are meant for
pub const LISTEN_PID_ENV: &str = "LISTEN_PID";

/// How long connections may drain after a shutdown signal
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

// =============================================================================
// Default Values
// =============================================================================

/// Default configuration file path
pub const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Default log filter when RUST_LOG is not set
pub const DEFAULT_LOG_FILTER: &str = "feedhost=info,tower_http=info";

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:8080";

pub const DEFAULT_TIMEOUT_SECS: u64 = 300;

pub const DEFAULT_MAINTENANCE_MESSAGE: &str = "The service is currently under maintenance";

pub const DEFAULT_METRICS_NETWORK: &str = "127.0.0.1/8";

pub const DEFAULT_STORAGE_PATH: &str = "data";

/// Build version reported by `/version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Listener and TLS settings
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub maintenance: MaintenanceConfig,
    /// Diagnostics endpoint settings
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// Persistent state (certificate cache)
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// `host:port`, `:port`, or an absolute Unix socket path
    #[serde(default = "HttpConfig::default_listen_addr")]
    pub listen_addr: String,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    /// Domain for automatic ACME certificates; takes precedence over cert/key files
    pub cert_domain: Option<String>,
    /// Contact address registered with the ACME account
    pub acme_email: Option<String>,
    /// Use the Let's Encrypt staging directory instead of production
    #[serde(default)]
    pub acme_staging: bool,
    /// Port of the TLS listener in ACME mode
    #[serde(default = "HttpConfig::default_acme_tls_port")]
    pub acme_tls_port: u16,
    /// Port of the HTTP-01 challenge listener in ACME mode
    #[serde(default = "HttpConfig::default_acme_challenge_port")]
    pub acme_challenge_port: u16,
    /// Prefix every route is mounted under, e.g. "/reader"
    #[serde(default)]
    pub base_path: String,
    /// Per-request timeout in seconds
    #[serde(default = "HttpConfig::default_timeout")]
    pub timeout_seconds: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            listen_addr: Self::default_listen_addr(),
            cert_file: None,
            key_file: None,
            cert_domain: None,
            acme_email: None,
            acme_staging: false,
            acme_tls_port: Self::default_acme_tls_port(),
            acme_challenge_port: Self::default_acme_challenge_port(),
            base_path: String::new(),
            timeout_seconds: Self::default_timeout(),
        }
    }
}

impl HttpConfig {
    fn default_listen_addr() -> String {
        DEFAULT_LISTEN_ADDR.to_string()
    }

    fn default_timeout() -> u64 {
        DEFAULT_TIMEOUT_SECS
    }

    fn default_acme_tls_port() -> u16 {
        HTTPS_PORT
    }

    fn default_acme_challenge_port() -> u16 {
        HTTP_PORT
    }

    /// Per-request timeout as a `Duration`
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Socket path when the listen address names a filesystem path.
    pub fn unix_socket_path(&self) -> Option<&Path> {
        self.listen_addr
            .starts_with('/')
            .then(|| Path::new(&self.listen_addr))
    }

    /// ACME domain, ignoring empty values
    pub fn cert_domain(&self) -> Option<&str> {
        self.cert_domain.as_deref().filter(|d| !d.is_empty())
    }

    /// Certificate and key paths, only when both are configured
    pub fn cert_pair(&self) -> Option<(&Path, &Path)> {
        let cert = non_empty_path(self.cert_file.as_deref())?;
        let key = non_empty_path(self.key_file.as_deref())?;
        Some((cert, key))
    }

    /// Normalized base path: empty, or a leading slash without a trailing one.
    pub fn base_path(&self) -> Option<&str> {
        let trimmed = self.base_path.trim_end_matches('/');
        (!trimmed.is_empty()).then_some(trimmed)
    }

    /// Resolve the listen address into a bindable socket address.
    ///
    /// A bare `:port` binds every interface.
    pub fn socket_addr(&self) -> std::io::Result<SocketAddr> {
        let addr = if self.listen_addr.starts_with(':') {
            format!("0.0.0.0{}", self.listen_addr)
        } else {
            self.listen_addr.clone()
        };

        addr.to_socket_addrs()?.next().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                format!("listen address '{}' did not resolve", self.listen_addr),
            )
        })
    }
}

fn non_empty_path(path: Option<&Path>) -> Option<&Path> {
    path.filter(|p| !p.as_os_str().is_empty())
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "MaintenanceConfig::default_message")]
    pub message: String,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            message: Self::default_message(),
        }
    }
}

impl MaintenanceConfig {
    fn default_message() -> String {
        DEFAULT_MAINTENANCE_MESSAGE.to_string()
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Networks allowed to scrape `/metrics`, matched against the peer address
    #[serde(default = "MetricsConfig::default_allowed_networks")]
    pub allowed_networks: Vec<IpNet>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            username: None,
            password: None,
            allowed_networks: Self::default_allowed_networks(),
        }
    }
}

impl MetricsConfig {
    fn default_allowed_networks() -> Vec<IpNet> {
        DEFAULT_METRICS_NETWORK.parse::<IpNet>().into_iter().collect()
    }

    /// Username and password, only when both are non-empty
    pub fn credentials(&self) -> Option<(&str, &str)> {
        let username = self.username.as_deref().filter(|u| !u.is_empty())?;
        let password = self.password.as_deref().filter(|p| !p.is_empty())?;
        Some((username, password))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Directory holding persisted state such as ACME certificates
    #[serde(default = "StorageConfig::default_path")]
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
        }
    }
}

impl StorageConfig {
    fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_STORAGE_PATH)
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

impl ServerConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.http.listen_addr.trim().is_empty() {
            return Err(ConfigError::Validation(
                "http.listen_addr must not be empty".to_string(),
            ));
        }

        if self.http.timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "http.timeout_seconds must be greater than zero".to_string(),
            ));
        }

        if !self.http.base_path.is_empty() && !self.http.base_path.starts_with('/') {
            return Err(ConfigError::Validation(format!(
                "http.base_path '{}' must start with '/'",
                self.http.base_path
            )));
        }

        let has_cert = non_empty_path(self.http.cert_file.as_deref()).is_some();
        let has_key = non_empty_path(self.http.key_file.as_deref()).is_some();
        if has_cert != has_key {
            return Err(ConfigError::Validation(
                "http.cert_file and http.key_file must be set together".to_string(),
            ));
        }

        let has_username = self.metrics.username.as_deref().is_some_and(|u| !u.is_empty());
        let has_password = self.metrics.password.as_deref().is_some_and(|p| !p.is_empty());
        if has_username != has_password {
            return Err(ConfigError::Validation(
                "metrics.username and metrics.password must be set together".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Configuration error: {0}")]
    Validation(String),
}
