//! # odac-proxy
//!
//! The public-facing reverse proxy of the odac platform. Runs as a child
//! process of the daemon so the control plane can restart without dropping
//! traffic.
//!
//! ## Core Responsibilities:
//! - **HTTP :80**: permanent redirect to HTTPS for known hosts, default page
//!   otherwise.
//! - **HTTPS :443**: TLS termination with SNI-selected certificates (ALPN
//!   HTTP/2 + HTTP/1.1) and forwarding to tenant backends, including
//!   WebSocket byte pipes and SSE streams.
//! - **Firewall**: allow/deny lists and a sliding-window rate limit, with a
//!   minute-cadence janitor.
//! - **Config intake**: `POST /config` snapshots pushed by the daemon over a
//!   Unix socket (loopback HTTP elsewhere).

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;

use odac_common::logging::setup_logging;
use odac_common::paths::OdacPaths;
use odacd::proxy::{control, forward, http as plain_http, tls, ProxyState};

#[derive(Parser, Debug)]
#[command(name = "odac-proxy", about = "TLS-terminating reverse proxy of the odac platform")]
struct ProxyOpts {
    /// Daemon instance this proxy belongs to.
    #[clap(long, env = "ODAC_INSTANCE_ID")]
    instance: String,

    #[clap(long, env = "ODAC_HTTP_PORT", default_value = "80")]
    http_port: u16,

    #[clap(long, env = "ODAC_HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Control port used on platforms without Unix sockets.
    #[clap(long, env = "ODAC_PROXY_CONTROL_PORT", default_value = "1454")]
    control_port: u16,

    #[clap(long, env = "ODAC_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

/// Bind a listener, retrying through the handover window in which the
/// previous instance still holds the port.
async fn bind_with_retry(addr: SocketAddr) -> Result<TcpListener> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(err) if tokio::time::Instant::now() < deadline => {
                log::warn!(target: "proxy", "Bind {addr} failed ({err}); retrying");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            Err(err) => {
                return Err(anyhow::anyhow!("could not bind {addr}: {err}"));
            }
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// The HTTPS accept loop: TLS handshake, then per-connection serving with
/// upgrade support and response compression.
async fn run_https(
    listener: TcpListener,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) {
    let acceptor = TlsAcceptor::from(tls::server_config(state.tls.clone()));
    loop {
        let (tcp_stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!(target: "proxy", "Accept error: {err}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            }
        };

        let acceptor = acceptor.clone();
        let state = state.clone();
        tokio::spawn(async move {
            let _ = tcp_stream.set_nodelay(true);
            let tls_stream = match acceptor.accept(tcp_stream).await {
                Ok(stream) => stream,
                Err(err) => {
                    log::debug!(target: "proxy", "TLS handshake with {peer} failed: {err}");
                    return;
                }
            };

            let svc = ServiceBuilder::new()
                .layer(CompressionLayer::new())
                .service(tower::service_fn(
                    move |req: http::Request<hyper::body::Incoming>| {
                        let state = state.clone();
                        async move {
                            Ok::<_, std::convert::Infallible>(
                                forward::handle(state, peer, true, req).await,
                            )
                        }
                    },
                ));

            let io = TokioIo::new(tls_stream);
            let builder = AutoBuilder::new(TokioExecutor::new());
            let conn = builder.serve_connection_with_upgrades(io, TowerToHyperService::new(svc));
            if let Err(err) = conn.await {
                log::debug!(target: "proxy", "Connection with {peer} ended: {err}");
            }
        });
    }
}

/// Removes the pid file when the process exits normally.
struct PidFile(std::path::PathBuf);

impl PidFile {
    fn write(path: std::path::PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, std::process::id().to_string())?;
        Ok(Self(path))
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let opts = ProxyOpts::parse();

    // Rustls needs the process-wide provider before any TLS config exists.
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let paths = OdacPaths::from_home()?;
    paths.ensure_layout()?;
    setup_logging(&paths.logs_dir(), "odac-proxy", &opts.log_level)?;
    log::info!(target: "proxy", "Proxy for instance {} starting", opts.instance);

    let _pid_file = PidFile::write(paths.proxy_pid_file(&opts.instance))?;
    let state = ProxyState::new()?;
    let shutdown = CancellationToken::new();

    // Config intake from the daemon.
    #[cfg(unix)]
    {
        let socket = paths.proxy_socket(&opts.instance);
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = control::serve_unix(socket, state, shutdown).await {
                log::error!(target: "proxy", "Control endpoint failed: {err:#}");
            }
        });
    }
    #[cfg(not(unix))]
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        let port = opts.control_port;
        tokio::spawn(async move {
            if let Err(err) = control::serve_tcp(port, state, shutdown).await {
                log::error!(target: "proxy", "Control endpoint failed: {err:#}");
            }
        });
    }

    // Firewall janitor on a minute cadence.
    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tick.tick() => state.firewall.evict_stale(),
                }
            }
        });
    }

    // Public listeners. Binds retry through the handover window.
    let http_listener = bind_with_retry(SocketAddr::from(([0, 0, 0, 0], opts.http_port))).await?;
    let https_listener =
        bind_with_retry(SocketAddr::from(([0, 0, 0, 0], opts.https_port))).await?;
    log::info!(
        target: "proxy",
        "Listening on :{} (redirect) and :{} (TLS)",
        opts.http_port,
        opts.https_port
    );

    {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let app = plain_http::router(state)
                .into_make_service_with_connect_info::<SocketAddr>();
            let serve = axum::serve(http_listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                log::error!(target: "proxy", "HTTP listener failed: {err}");
            }
        });
    }

    let https_task = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(run_https(https_listener, state, shutdown))
    };

    shutdown_signal().await;
    log::warn!(target: "proxy", "Shutdown signal received");
    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(5), https_task).await;

    Ok(())
}
