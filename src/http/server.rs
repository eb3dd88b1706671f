//! Listener startup.
//!
//! `start` selects the listener mode, binds every socket the mode needs, and
//! spawns one serve task per socket. Binding happens before `start` returns, so
//! a misconfigured transport fails immediately; serving happens in the
//! background and is observed through [`Listeners::wait`].

use std::future::Future;
use std::net::{Ipv6Addr, SocketAddr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::{Handle, Server};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use hyper_util::service::TowerToHyperService;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use tokio::net::UnixListener;
use tokio::task::JoinSet;

use crate::config::{ServerConfig, LISTEN_FDS_START};
use crate::storage::CertificateCache;

use super::acme::{self, AcmeBootstrap};
use super::mode::{self, Environment, ListenerMode};
use super::shutdown::{self, Shutdown};
use super::tls::{TlsError, TlsPolicy};

/// Permissions for the Unix socket: any local user may connect
const UNIX_SOCKET_MODE: u32 = 0o666;

/// Accept backlog for sockets bound through socket2
const LISTEN_BACKLOG: i32 = 1024;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Invalid listen address '{addr}': {source}")]
    Address {
        addr: String,
        source: std::io::Error,
    },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Unable to create listener from inherited socket: {0}")]
    SocketActivation(std::io::Error),

    #[error("Unable to change socket permission on {path}: {source}")]
    SocketPermissions {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(#[from] TlsError),

    #[error("{mode} listener failed: {source}")]
    Serve {
        mode: ListenerMode,
        source: std::io::Error,
    },

    #[error("Listener task failed: {0}")]
    Task(String),
}

/// Handle on the running listeners.
pub struct Listeners {
    mode: ListenerMode,
    local_addrs: Vec<SocketAddr>,
    tasks: JoinSet<Result<(), ServerError>>,
}

impl Listeners {
    pub fn mode(&self) -> ListenerMode {
        self.mode
    }

    /// Addresses of the bound TCP listeners, primary listener first.
    pub fn local_addrs(&self) -> &[SocketAddr] {
        &self.local_addrs
    }

    /// Wait until every listener has stopped.
    ///
    /// Returns `Ok(())` once all listeners drained after a shutdown request, or
    /// the first fatal error from any listener.
    pub async fn wait(mut self) -> Result<(), ServerError> {
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(e) => return Err(ServerError::Task(e.to_string())),
            }
        }
        Ok(())
    }
}

/// Select the listener mode, bind it, and start serving in the background.
///
/// Must be called from within a Tokio runtime.
pub fn start(
    app: Router,
    config: &ServerConfig,
    env: &Environment,
    cert_cache: Arc<dyn CertificateCache>,
    shutdown: &Shutdown,
) -> Result<Listeners, ServerError> {
    let mode = mode::select(config, env);
    let timeout = config.http.timeout();
    let mut listeners = Listeners {
        mode,
        local_addrs: Vec::new(),
        tasks: JoinSet::new(),
    };

    tracing::info!(%mode, "Selected listener mode");

    match mode {
        ListenerMode::InheritedSocket => {
            let listener = adopt_inherited_socket()?;
            let addr = listener.local_addr().map_err(ServerError::SocketActivation)?;
            tracing::info!(%addr, "Listening on inherited socket");

            listeners.local_addrs.push(addr);
            listeners
                .tasks
                .spawn(run_listener(mode, shutdown.clone(), move |handle| {
                    with_timeouts(axum_server::from_tcp(listener), timeout)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                }));
        }
        ListenerMode::UnixSocket => {
            // selected only when a socket path is configured
            let path = config
                .http
                .unix_socket_path()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            let listener = bind_unix_socket(&path)?;
            tracing::info!(path = %path.display(), "Listening on Unix socket");

            listeners
                .tasks
                .spawn(serve_unix(listener, path, app, timeout, shutdown.clone()));
        }
        ListenerMode::AutoCertTls => {
            let domain = config.http.cert_domain().unwrap_or_default();
            if config.http.cert_pair().is_some() {
                tracing::warn!(
                    domain = %domain,
                    "Both ACME domain and certificate files configured; using ACME"
                );
            }

            let tls_listener = bind_dual_stack(config.http.acme_tls_port)?;
            let challenge_listener = bind_dual_stack(config.http.acme_challenge_port)?;

            let policy = TlsPolicy::hardened(true);
            let bootstrap = AcmeBootstrap::start(domain, &config.http, cert_cache, &policy)?;
            let tls_addr = local_addr(&tls_listener, config.http.acme_tls_port);
            let challenge_addr = local_addr(&challenge_listener, config.http.acme_challenge_port);
            listeners.local_addrs.push(tls_addr);
            listeners.local_addrs.push(challenge_addr);

            tracing::info!(
                addr = %tls_addr,
                domain = %domain,
                "Listening with auto-configured certificate"
            );
            tracing::info!(addr = %challenge_addr, "Listening for ACME HTTP-01 challenges");

            let challenge_app = acme::challenge_router(bootstrap.responder, tls_addr.port());
            listeners
                .tasks
                .spawn(run_listener(mode, shutdown.clone(), move |handle| {
                    with_timeouts(axum_server::from_tcp(challenge_listener), timeout)
                        .handle(handle)
                        .serve(challenge_app.into_make_service_with_connect_info::<SocketAddr>())
                }));

            let acceptor = bootstrap.acceptor;
            listeners
                .tasks
                .spawn(run_listener(mode, shutdown.clone(), move |handle| {
                    with_timeouts(axum_server::from_tcp(tls_listener), timeout)
                        .acceptor(acceptor)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                }));
        }
        ListenerMode::StaticTls => {
            let (cert_path, key_path) = config
                .http
                .cert_pair()
                .map(|(cert, key)| (cert.to_path_buf(), key.to_path_buf()))
                .unwrap_or_default();
            let addr = resolve(config)?;

            let policy = Arc::new(TlsPolicy::hardened(false));
            let tls_config = policy.with_pem_files(&cert_path, &key_path)?;
            let rustls_config = RustlsConfig::from_config(Arc::new(tls_config));
            shutdown::setup_reload_handler(
                rustls_config.clone(),
                policy,
                cert_path.clone(),
                key_path.clone(),
            );

            let listener = bind_tcp(addr)?;
            listeners.local_addrs.push(local_addr(&listener, addr.port()));
            tracing::info!(
                %addr,
                cert = %cert_path.display(),
                key = %key_path.display(),
                "Listening with TLS certificate"
            );

            listeners
                .tasks
                .spawn(run_listener(mode, shutdown.clone(), move |handle| {
                    with_timeouts(axum_server::from_tcp_rustls(listener, rustls_config), timeout)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                }));
        }
        ListenerMode::PlainHttp => {
            let addr = resolve(config)?;
            let listener = bind_tcp(addr)?;
            listeners.local_addrs.push(local_addr(&listener, addr.port()));
            tracing::info!(%addr, "Listening without TLS");

            listeners
                .tasks
                .spawn(run_listener(mode, shutdown.clone(), move |handle| {
                    with_timeouts(axum_server::from_tcp(listener), timeout)
                        .handle(handle)
                        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
                }));
        }
    }

    Ok(listeners)
}

fn resolve(config: &ServerConfig) -> Result<SocketAddr, ServerError> {
    config
        .http
        .socket_addr()
        .map_err(|source| ServerError::Address {
            addr: config.http.listen_addr.clone(),
            source,
        })
}

fn local_addr(listener: &std::net::TcpListener, port: u16) -> SocketAddr {
    listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from((Ipv6Addr::UNSPECIFIED, port)))
}

/// Apply the per-connection limits shared by every listener.
///
/// A client that does not finish sending request headers within `timeout`,
/// including an idle keep-alive connection, is disconnected.
fn configure_http(builder: &mut auto::Builder<TokioExecutor>, timeout: Duration) {
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(timeout);
}

fn with_timeouts<A>(mut server: Server<A>, timeout: Duration) -> Server<A> {
    configure_http(server.http_builder(), timeout);
    server
}

/// Bind a TCP listener ready to be handed to the async runtime.
pub fn bind_tcp(addr: SocketAddr) -> Result<std::net::TcpListener, ServerError> {
    let bind_error = |source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let listener = std::net::TcpListener::bind(addr).map_err(bind_error)?;
    listener.set_nonblocking(true).map_err(bind_error)?;
    Ok(listener)
}

/// Bind `[::]:port` for both IPv6 and IPv4 clients.
///
/// Hosts without IPv6 support get an IPv4-only listener instead.
pub fn bind_dual_stack(port: u16) -> Result<std::net::TcpListener, ServerError> {
    let addr = SocketAddr::from((Ipv6Addr::UNSPECIFIED, port));
    let bind_error = |source| ServerError::Bind {
        addr: addr.to_string(),
        source,
    };

    let socket = match Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(error = %e, port, "IPv6 unavailable, listening on IPv4 only");
            return bind_tcp(SocketAddr::from(([0, 0, 0, 0], port)));
        }
    };

    socket.set_only_v6(false).map_err(bind_error)?;
    socket.set_reuse_address(true).map_err(bind_error)?;
    socket.bind(&addr.into()).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)?;
    socket.set_nonblocking(true).map_err(bind_error)?;
    Ok(socket.into())
}

/// Adopt the listening socket a supervisor passed as the first inherited fd.
///
/// The descriptor is inspected through a borrow first; it is only owned (and
/// therefore closed on drop) once it is known to be a TCP stream socket.
fn adopt_inherited_socket() -> Result<std::net::TcpListener, ServerError> {
    use std::os::fd::{BorrowedFd, FromRawFd};

    let not_tcp = || {
        ServerError::SocketActivation(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("fd {} is not a TCP stream socket", LISTEN_FDS_START),
        ))
    };

    // SAFETY: the borrow does not outlive this block and never closes the fd.
    // A descriptor that is not open makes the socket calls fail with EBADF.
    let inherited = unsafe { BorrowedFd::borrow_raw(LISTEN_FDS_START) };
    let socket = SockRef::from(&inherited);
    if socket.r#type().map_err(ServerError::SocketActivation)? != Type::STREAM {
        return Err(not_tcp());
    }
    let addr = socket.local_addr().map_err(ServerError::SocketActivation)?;
    if addr.as_socket().is_none() {
        return Err(not_tcp());
    }

    // SAFETY: fd 3 was verified above to be an open TCP socket, and LISTEN_PID
    // names this process, so the supervisor handed its ownership to us.
    let listener = unsafe { std::net::TcpListener::from_raw_fd(LISTEN_FDS_START) };
    listener
        .set_nonblocking(true)
        .map_err(ServerError::SocketActivation)?;
    Ok(listener)
}

/// Bind a Unix socket at `path`, replacing any stale socket file, and open it
/// to every local user.
pub fn bind_unix_socket(path: &Path) -> Result<UnixListener, ServerError> {
    let bind_error = |source| ServerError::Bind {
        addr: path.display().to_string(),
        source,
    };

    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(bind_error(e)),
    }

    let listener = UnixListener::bind(path).map_err(bind_error)?;

    std::fs::set_permissions(path, std::fs::Permissions::from_mode(UNIX_SOCKET_MODE)).map_err(
        |source| ServerError::SocketPermissions {
            path: path.display().to_string(),
            source,
        },
    )?;

    Ok(listener)
}

/// Run one TCP-based listener until it stops, tying it to the shutdown broadcast.
async fn run_listener<F, Fut>(mode: ListenerMode, shutdown: Shutdown, serve: F) -> Result<(), ServerError>
where
    F: FnOnce(Handle) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    let handle = Handle::new();
    shutdown.attach(handle.clone());

    serve(handle)
        .await
        .map_err(|source| ServerError::Serve { mode, source })?;

    tracing::info!(%mode, "Listener stopped");
    Ok(())
}

/// Serve HTTP over a Unix socket until shutdown, then drain for at most the
/// shutdown grace period.
async fn serve_unix(
    listener: UnixListener,
    path: PathBuf,
    app: Router,
    timeout: Duration,
    shutdown: Shutdown,
) -> Result<(), ServerError> {
    let mut builder = auto::Builder::new(TokioExecutor::new());
    configure_http(&mut builder, timeout);

    let graceful = GracefulShutdown::new();
    let mut connections = JoinSet::new();
    let requested = shutdown.requested();
    tokio::pin!(requested);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let stream = match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to accept Unix connection");
                        continue;
                    }
                };

                let service = TowerToHyperService::new(app.clone());
                let connection = builder
                    .serve_connection_with_upgrades(TokioIo::new(stream), service)
                    .into_owned();
                let connection = graceful.watch(connection);
                connections.spawn(async move {
                    if let Err(e) = connection.await {
                        tracing::debug!(error = %e, "Unix connection closed with error");
                    }
                });

                while connections.try_join_next().is_some() {}
            }
            _ = &mut requested => break,
        }
    }
    drop(listener);

    let grace = shutdown.grace();
    tokio::select! {
        _ = graceful.shutdown() => {}
        _ = tokio::time::sleep(grace) => {
            tracing::warn!(
                open = connections.len(),
                grace_ms = grace.as_millis() as u64,
                "Grace period elapsed, closing remaining Unix connections"
            );
        }
    }
    connections.abort_all();

    if let Err(e) = std::fs::remove_file(&path) {
        tracing::debug!(error = %e, path = %path.display(), "Socket file already gone");
    }
    tracing::info!(mode = %ListenerMode::UnixSocket, "Listener stopped");
    Ok(())
}
