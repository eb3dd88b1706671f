//! Listener lifecycle tests against real sockets.
//!
//! Run with: cargo test --test listener_tests
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

use feedhost::config::ServerConfig;
use feedhost::http::{self, Environment, ListenerMode, ServerError, Shutdown};
use feedhost::storage::MemoryStore;
use feedhost::{create_router, AppState};

const HEALTHCHECK_REQUEST: &[u8] =
    b"GET /healthcheck HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n";

fn config(listen_addr: &str) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.http.listen_addr = listen_addr.to_string();
    config
}

fn app(config: &ServerConfig, store: Arc<MemoryStore>) -> Router {
    let state = AppState::new(Arc::new(config.clone()), store, None);
    create_router(state, Router::new())
}

/// Router with a route whose handler never completes.
fn hanging_app(config: &ServerConfig, store: Arc<MemoryStore>) -> Router {
    let state = AppState::new(Arc::new(config.clone()), store, None);
    let application = Router::new().route("/hang", get(|| std::future::pending::<&'static str>()));
    create_router(state, application)
}

fn no_activation() -> Environment {
    Environment {
        listen_pid: None,
        pid: std::process::id(),
    }
}

async fn exchange<S>(mut stream: S) -> String
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream.write_all(HEALTHCHECK_REQUEST).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_plain_http_serves_and_drains() {
    let config = config("127.0.0.1:0");
    let store = Arc::new(MemoryStore::new());
    let (trigger, shutdown) = Shutdown::manual();

    let listeners = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();
    assert_eq!(listeners.mode(), ListenerMode::PlainHttp);
    let addr = listeners.local_addrs()[0];
    assert_ne!(addr.port(), 0);

    let response = exchange(TcpStream::connect(addr).await.unwrap()).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");
    assert!(response.ends_with("OK"), "{response}");

    trigger.trigger();
    let stopped = tokio::time::timeout(Duration::from_secs(5), listeners.wait())
        .await
        .expect("listeners did not stop");
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_unix_socket_replaces_stale_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("feedhost.sock");
    std::fs::write(&path, b"stale").unwrap();

    let config = config(path.to_str().unwrap());
    let store = Arc::new(MemoryStore::new());
    let (trigger, shutdown) = Shutdown::manual();

    let listeners = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();
    assert_eq!(listeners.mode(), ListenerMode::UnixSocket);
    assert!(listeners.local_addrs().is_empty());

    let metadata = std::fs::metadata(&path).unwrap();
    assert!(metadata.file_type().is_socket());
    assert_eq!(metadata.permissions().mode() & 0o777, 0o666);

    let response = exchange(UnixStream::connect(&path).await.unwrap()).await;
    assert!(response.starts_with("HTTP/1.1 200"), "{response}");

    trigger.trigger();
    let stopped = tokio::time::timeout(Duration::from_secs(5), listeners.wait())
        .await
        .expect("listeners did not stop");
    assert!(stopped.is_ok());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_bind_conflict_fails_before_serving() {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = occupied.local_addr().unwrap();

    let config = config(&addr.to_string());
    let store = Arc::new(MemoryStore::new());
    let (_trigger, shutdown) = Shutdown::manual();

    let result = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown);
    assert!(matches!(result, Err(ServerError::Bind { .. })));
}

#[tokio::test]
async fn test_static_tls_with_missing_files_fails_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config("127.0.0.1:0");
    config.http.cert_file = Some(dir.path().join("cert.pem"));
    config.http.key_file = Some(dir.path().join("key.pem"));

    let store = Arc::new(MemoryStore::new());
    let (_trigger, shutdown) = Shutdown::manual();

    let result = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown);
    assert!(matches!(result, Err(ServerError::TlsConfig(_))));
}

#[tokio::test]
async fn test_unix_socket_in_missing_directory_is_a_bind_error() {
    let result = http::server::bind_unix_socket(Path::new("/nonexistent-feedhost-dir/app.sock"));
    assert!(matches!(result, Err(ServerError::Bind { .. })));
}

/// Sends an unterminated request head and reports whether the server hung up
/// within `limit`.
async fn closed_while_stalled<S>(mut stream: S, limit: Duration) -> bool
where
    S: AsyncReadExt + AsyncWriteExt + Unpin,
{
    stream
        .write_all(b"GET /healthcheck HTTP/1.1\r\nHost: x\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(limit, stream.read_to_end(&mut response))
        .await
        .is_ok()
}

#[tokio::test]
async fn test_plain_http_closes_stalled_request_head() {
    let mut config = config("127.0.0.1:0");
    config.http.timeout_seconds = 1;
    let store = Arc::new(MemoryStore::new());
    let (_trigger, shutdown) = Shutdown::manual();

    let listeners = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();
    let stream = TcpStream::connect(listeners.local_addrs()[0]).await.unwrap();
    assert!(closed_while_stalled(stream, Duration::from_secs(4)).await);
}

#[tokio::test]
async fn test_unix_socket_closes_stalled_request_head() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stalled.sock");
    let mut config = config(path.to_str().unwrap());
    config.http.timeout_seconds = 1;
    let store = Arc::new(MemoryStore::new());
    let (_trigger, shutdown) = Shutdown::manual();

    let _listeners = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();
    let stream = UnixStream::connect(&path).await.unwrap();
    assert!(closed_while_stalled(stream, Duration::from_secs(4)).await);
}

#[tokio::test]
async fn test_unix_socket_drain_is_bounded_by_grace_period() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("drain.sock");
    let config = config(path.to_str().unwrap());
    let store = Arc::new(MemoryStore::new());
    let (trigger, shutdown) = Shutdown::manual();
    let shutdown = shutdown.with_grace(Duration::from_millis(200));

    let listeners = http::start(hanging_app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();

    let mut held = UnixStream::connect(&path).await.unwrap();
    held.write_all(b"GET /hang HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    trigger.trigger();
    let stopped = tokio::time::timeout(Duration::from_secs(5), listeners.wait())
        .await
        .expect("drain exceeded the grace period");
    assert!(stopped.is_ok());
    assert!(!path.exists());
}

#[tokio::test]
async fn test_plain_http_drain_is_bounded_by_grace_period() {
    let config = config("127.0.0.1:0");
    let store = Arc::new(MemoryStore::new());
    let (trigger, shutdown) = Shutdown::manual();
    let shutdown = shutdown.with_grace(Duration::from_millis(200));

    let listeners = http::start(hanging_app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();

    let mut held = TcpStream::connect(listeners.local_addrs()[0]).await.unwrap();
    held.write_all(b"GET /hang HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    trigger.trigger();
    let stopped = tokio::time::timeout(Duration::from_secs(5), listeners.wait())
        .await
        .expect("drain exceeded the grace period");
    assert!(stopped.is_ok());
}

async fn plain_get(addr: std::net::SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: example.org\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await.unwrap();
    String::from_utf8(response).unwrap()
}

#[tokio::test]
async fn test_acme_mode_runs_tls_and_challenge_listeners() {
    let mut config = config("127.0.0.1:0");
    config.http.cert_domain = Some("example.org".to_string());
    config.http.acme_staging = true;
    config.http.acme_tls_port = 0;
    config.http.acme_challenge_port = 0;
    let store = Arc::new(MemoryStore::new());
    let (trigger, shutdown) = Shutdown::manual();

    let listeners = http::start(app(&config, store.clone()), &config, &no_activation(), store, &shutdown)
        .unwrap();
    assert_eq!(listeners.mode(), ListenerMode::AutoCertTls);

    let addrs = listeners.local_addrs().to_vec();
    assert_eq!(addrs.len(), 2);
    assert!(addrs.iter().all(|addr| addr.port() != 0));
    assert_ne!(addrs[0].port(), addrs[1].port());

    let challenge = addrs[1];
    let unknown_token = plain_get(challenge, "/.well-known/acme-challenge/unknown").await;
    assert!(unknown_token.starts_with("HTTP/1.1 404"), "{unknown_token}");

    let redirected = plain_get(challenge, "/feeds").await;
    assert!(redirected.starts_with("HTTP/1.1 308"), "{redirected}");
    let location = format!("location: https://example.org:{}/feeds", addrs[0].port());
    assert!(redirected.to_ascii_lowercase().contains(&location), "{redirected}");

    // the TLS listener accepts connections too
    TcpStream::connect(("127.0.0.1", addrs[0].port())).await.unwrap();

    trigger.trigger();
    let stopped = tokio::time::timeout(Duration::from_secs(5), listeners.wait())
        .await
        .expect("listeners did not stop");
    assert!(stopped.is_ok());
}

#[tokio::test]
async fn test_dual_stack_listener_accepts_ipv4_and_ipv6() {
    let listener = http::server::bind_dual_stack(0).unwrap();
    let addr = listener.local_addr().unwrap();
    let listener = tokio::net::TcpListener::from_std(listener).unwrap();

    TcpStream::connect(("127.0.0.1", addr.port())).await.unwrap();
    listener.accept().await.unwrap();

    let ipv6_loopback = std::net::TcpListener::bind("[::1]:0").is_ok();
    if addr.is_ipv6() && ipv6_loopback {
        TcpStream::connect(("::1", addr.port())).await.unwrap();
        listener.accept().await.unwrap();
    }
}
