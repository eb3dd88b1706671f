//! ACME certificate bootstrap.
//!
//! Wraps a `rustls-acme` manager restricted to a single domain. Certificates
//! and the ACME account are persisted through the storage collaborator's
//! `CertificateCache`; this module holds no certificate state of its own.
//! Domain validation uses HTTP-01, answered by the challenge router on the
//! insecure port.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{Method, StatusCode, Uri};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use axum_extra::extract::Host;
use futures::StreamExt;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_acme::{AccountCache, AcmeConfig, CertCache, ResolvesServerCertAcme, UseChallenge};
use sha2::{Digest, Sha256};

use crate::config::HttpConfig;
use crate::storage::{CertificateCache, StorageError};

use super::redirect;

/// Path prefix the ACME CA fetches HTTP-01 key authorizations from
pub const CHALLENGE_PATH: &str = "/.well-known/acme-challenge/{token}";

/// Adapts the storage collaborator to the rustls-acme cache traits.
#[derive(Clone)]
pub struct AcmeCache {
    store: Arc<dyn CertificateCache>,
}

impl AcmeCache {
    pub fn new(store: Arc<dyn CertificateCache>) -> Self {
        Self { store }
    }

    pub fn cert_key(domains: &[String], directory_url: &str) -> String {
        format!("cert:{}:{}", domains.join(","), directory_digest(directory_url))
    }

    pub fn account_key(contact: &[String], directory_url: &str) -> String {
        format!("account:{}:{}", contact.join(","), directory_digest(directory_url))
    }
}

/// Short digest so staging and production entries never collide.
fn directory_digest(directory_url: &str) -> String {
    let digest = Sha256::digest(directory_url.as_bytes());
    hex::encode(&digest[..8])
}

#[async_trait]
impl CertCache for AcmeCache {
    type EC = StorageError;

    async fn load_cert(
        &self,
        domains: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EC> {
        self.store.get(&Self::cert_key(domains, directory_url)).await
    }

    async fn store_cert(
        &self,
        domains: &[String],
        directory_url: &str,
        cert: &[u8],
    ) -> Result<(), Self::EC> {
        self.store
            .put(&Self::cert_key(domains, directory_url), cert)
            .await
    }
}

#[async_trait]
impl AccountCache for AcmeCache {
    type EA = StorageError;

    async fn load_account(
        &self,
        contact: &[String],
        directory_url: &str,
    ) -> Result<Option<Vec<u8>>, Self::EA> {
        self.store
            .get(&Self::account_key(contact, directory_url))
            .await
    }

    async fn store_account(
        &self,
        contact: &[String],
        directory_url: &str,
        account: &[u8],
    ) -> Result<(), Self::EA> {
        self.store
            .put(&Self::account_key(contact, directory_url), account)
            .await
    }
}

/// Host policy: only handshakes naming the configured domain get a certificate.
#[derive(Debug, Clone)]
pub struct HostPolicy {
    domain: String,
}

impl HostPolicy {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.trim_end_matches('.').to_ascii_lowercase(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Server names compare case-insensitively, ignoring a trailing dot.
    pub fn permits(&self, server_name: Option<&str>) -> bool {
        match server_name {
            Some(name) => name.trim_end_matches('.').eq_ignore_ascii_case(&self.domain),
            None => false,
        }
    }
}

/// Certificate resolver that applies the host policy before consulting ACME.
pub struct HostPolicyResolver {
    policy: HostPolicy,
    inner: Arc<dyn ResolvesServerCert>,
}

impl HostPolicyResolver {
    pub fn new(policy: HostPolicy, inner: Arc<dyn ResolvesServerCert>) -> Self {
        Self { policy, inner }
    }
}

impl fmt::Debug for HostPolicyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostPolicyResolver")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl ResolvesServerCert for HostPolicyResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let server_name = client_hello.server_name();
        if !self.policy.permits(server_name) {
            tracing::warn!(
                server_name = server_name.unwrap_or("<none>"),
                allowed = %self.policy.domain(),
                "Rejected TLS handshake for host outside ACME policy"
            );
            return None;
        }
        self.inner.resolve(client_hello)
    }
}

/// Source of HTTP-01 key authorizations.
pub trait ChallengeResponder: Send + Sync {
    fn key_authorization(&self, token: &str) -> Option<String>;
}

impl ChallengeResponder for ResolvesServerCertAcme {
    fn key_authorization(&self, token: &str) -> Option<String> {
        self.get_http_01_key_auth(token)
    }
}

/// Router for the insecure challenge listener.
///
/// Challenge tokens are answered from `responder`; every other request is
/// sent to the HTTPS listener.
pub fn challenge_router(responder: Arc<dyn ChallengeResponder>, https_port: u16) -> Router {
    Router::new()
        .route(CHALLENGE_PATH, get(answer_challenge))
        .with_state(responder)
        .fallback(move |method: Method, host: Host, uri: Uri| {
            redirect::redirect_to_https(method, host, uri, https_port)
        })
}

async fn answer_challenge(
    State(responder): State<Arc<dyn ChallengeResponder>>,
    Path(token): Path<String>,
) -> impl IntoResponse {
    match responder.key_authorization(&token) {
        Some(key_auth) => {
            tracing::info!(token = %token, "Answered ACME HTTP-01 challenge");
            (StatusCode::OK, key_auth)
        }
        None => {
            tracing::debug!(token = %token, "Unknown ACME challenge token");
            (StatusCode::NOT_FOUND, String::new())
        }
    }
}

/// A started ACME manager: the TLS acceptor for the secure listener and the
/// responder for the challenge listener.
pub struct AcmeBootstrap {
    pub acceptor: rustls_acme::axum::AxumAcceptor,
    pub responder: Arc<dyn ChallengeResponder>,
}

impl AcmeBootstrap {
    /// Configure the manager for `domain` and spawn its event loop.
    ///
    /// Terms of service are accepted implicitly by registering the account.
    /// Must be called from within a Tokio runtime.
    pub fn start(
        domain: &str,
        http: &HttpConfig,
        store: Arc<dyn CertificateCache>,
        tls_policy: &super::tls::TlsPolicy,
    ) -> Result<Self, super::tls::TlsError> {
        let production = !http.acme_staging;

        let mut config = AcmeConfig::new([domain])
            .cache(AcmeCache::new(store))
            .directory_lets_encrypt(production)
            .challenge_type(UseChallenge::Http01);
        if let Some(email) = http.acme_email.as_deref().filter(|e| !e.is_empty()) {
            config = config.contact_push(format!("mailto:{}", email));
        }

        let mut state = config.state();
        let acme_resolver = state.resolver();

        let resolver = HostPolicyResolver::new(HostPolicy::new(domain), acme_resolver.clone());
        let rustls_config = tls_policy.with_cert_resolver(Arc::new(resolver))?;
        let acceptor = state.axum_acceptor(Arc::new(rustls_config));

        let environment = if production { "production" } else { "staging" };
        tracing::info!(domain = %domain, environment = %environment, "ACME manager configured");
        if !production {
            tracing::warn!(
                "Using Let's Encrypt staging environment - certificates will NOT be trusted by browsers"
            );
        }

        // Issuance and renewal failures surface here and on the affected
        // handshake only.
        tokio::spawn(async move {
            loop {
                match state.next().await {
                    Some(Ok(event)) => {
                        tracing::info!(event = ?event, "ACME event");
                    }
                    Some(Err(err)) => {
                        tracing::error!(error = ?err, "ACME error");
                    }
                    None => {
                        tracing::debug!("ACME state stream ended");
                        break;
                    }
                }
            }
        });

        Ok(Self {
            acceptor,
            responder: acme_resolver,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    use super::*;
    use crate::http::tls::TlsPolicy;
    use crate::storage::MemoryStore;

    #[derive(Debug, Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl ResolvesServerCert for CountingResolver {
        fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            None
        }
    }

    /// Runs a client hello for `server_name` through the ACME server config and
    /// returns how often the inner resolver was consulted.
    fn handshake(server_name: &str) -> usize {
        let inner = Arc::new(CountingResolver::default());
        let resolver = HostPolicyResolver::new(HostPolicy::new("example.org"), inner.clone());
        let server_config = TlsPolicy::hardened(true)
            .with_cert_resolver(Arc::new(resolver))
            .unwrap();
        let mut server = rustls::ServerConnection::new(Arc::new(server_config)).unwrap();

        let client_config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::aws_lc_rs::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
        let name = rustls_pki_types::ServerName::try_from(server_name.to_string()).unwrap();
        let mut client = rustls::ClientConnection::new(Arc::new(client_config), name).unwrap();

        let mut client_hello = Vec::new();
        client.write_tls(&mut client_hello).unwrap();
        server.read_tls(&mut client_hello.as_slice()).unwrap();
        // the inner resolver has no certificate either, so every handshake fails
        assert!(server.process_new_packets().is_err());

        inner.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_handshake_for_other_host_never_reaches_acme() {
        assert_eq!(handshake("other.org"), 0);
    }

    #[test]
    fn test_handshake_for_configured_host_reaches_acme() {
        assert_eq!(handshake("example.org"), 1);
        assert_eq!(handshake("EXAMPLE.ORG"), 1);
    }

    struct StaticResponder(HashMap<String, String>);

    impl ChallengeResponder for StaticResponder {
        fn key_authorization(&self, token: &str) -> Option<String> {
            self.0.get(token).cloned()
        }
    }

    fn responder() -> Arc<dyn ChallengeResponder> {
        let mut tokens = HashMap::new();
        tokens.insert("tok123".to_string(), "tok123.thumbprint".to_string());
        Arc::new(StaticResponder(tokens))
    }

    #[test]
    fn test_host_policy_accepts_only_configured_domain() {
        let policy = HostPolicy::new("example.org");
        assert!(policy.permits(Some("example.org")));
        assert!(policy.permits(Some("EXAMPLE.org.")));
        assert!(!policy.permits(Some("other.org")));
        assert!(!policy.permits(Some("www.example.org")));
        assert!(!policy.permits(None));
    }

    #[test]
    fn test_cache_keys_separate_directories() {
        let domains = vec!["example.org".to_string()];
        let production = AcmeCache::cert_key(&domains, "https://acme-v02.api.letsencrypt.org/directory");
        let staging = AcmeCache::cert_key(&domains, "https://acme-staging-v02.api.letsencrypt.org/directory");
        assert!(production.starts_with("cert:example.org:"));
        assert_ne!(production, staging);
    }

    #[tokio::test]
    async fn test_acme_cache_delegates_to_store() {
        let store = Arc::new(MemoryStore::new());
        let cache = AcmeCache::new(store.clone());
        let domains = vec!["example.org".to_string()];
        let directory = "https://acme.test/directory";

        assert!(cache.load_cert(&domains, directory).await.unwrap().is_none());
        cache.store_cert(&domains, directory, b"pem").await.unwrap();
        assert_eq!(
            cache.load_cert(&domains, directory).await.unwrap().as_deref(),
            Some(&b"pem"[..])
        );

        let contact = vec!["mailto:ops@example.org".to_string()];
        cache.store_account(&contact, directory, b"account").await.unwrap();
        assert_eq!(store.len().await, 2);
    }

    #[tokio::test]
    async fn test_challenge_token_is_answered() {
        let app = challenge_router(responder(), 443);
        let response = app
            .oneshot(
                Request::get("/.well-known/acme-challenge/tok123")
                    .header(header::HOST, "example.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"tok123.thumbprint");
    }

    #[tokio::test]
    async fn test_unknown_challenge_token_is_not_found() {
        let app = challenge_router(responder(), 443);
        let response = app
            .oneshot(
                Request::get("/.well-known/acme-challenge/missing")
                    .header(header::HOST, "example.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_other_paths_redirect_to_https() {
        let app = challenge_router(responder(), 443);
        let response = app
            .oneshot(
                Request::get("/feeds?page=2")
                    .header(header::HOST, "example.org")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PERMANENT_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "https://example.org/feeds?page=2"
        );
    }
}
