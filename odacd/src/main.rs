//! # odacd
//!
//! Entry point of the platform daemon. Boots the configuration store,
//! regenerates the control auth token, pairs with (or spawns) the reverse
//! proxy, exposes the control channel and drives the one-second reconcile
//! loop. When started with `ODAC_UPDATE_MODE=true` it first performs the
//! takeover side of a rolling self-update.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use odac_common::config::modules::RunStatus;
use odac_common::config::ConfigStore;
use odac_common::logging::setup_logging;
use odac_common::paths::OdacPaths;
use odac_common::util::random_hex;

use odacd::core::collaborators::{DisabledDns, DisabledIssuer, DisabledMail, HubRecipes};
use odacd::core::{run_reconciler, Core, SslCoordinator};
use odacd::engine::{Engine, ODAC_NETWORK};
use odacd::proxy_sync::ProxyLink;
use odacd::services::ServiceSupervisor;
use odacd::websites::WebsiteSupervisor;
use odacd::{ipc, process, updater};

#[derive(Parser, Debug)]
#[command(name = "odacd", about = "The odac platform daemon")]
struct DaemonOpts {
    /// Release channel: stable | latest | beta | dev | custom branch.
    #[clap(long, env = "ODAC_CHANNEL", default_value = "stable")]
    channel: String,

    /// Loopback control port.
    #[clap(long, env = "ODAC_CONTROL_PORT", default_value = "1453")]
    control_port: u16,

    /// Proxy control port used on platforms without Unix sockets.
    #[clap(long, env = "ODAC_PROXY_CONTROL_PORT", default_value = "1454")]
    proxy_control_port: u16,

    #[clap(long, env = "ODAC_LOG_LEVEL", default_value = "info")]
    log_level: String,
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

/// Bring persisted workloads back up after a restart or takeover.
async fn resume_workloads(core: &Arc<Core>) {
    let domains: Vec<String> = core
        .config
        .web
        .read(|web| {
            web.websites
                .iter()
                .filter(|(_, site)| {
                    matches!(site.status, RunStatus::Running | RunStatus::Starting)
                })
                .map(|(domain, _)| domain.clone())
                .collect()
        })
        .await;
    for domain in domains {
        if let Err(err) = core.websites.start(&domain).await {
            log::warn!(target: "core", "Resuming website {domain}: {err}");
        }
    }

    let services: Vec<String> = core
        .config
        .services
        .read(|s| {
            s.services
                .values()
                .filter(|svc| svc.active)
                .map(|svc| svc.name.clone())
                .collect()
        })
        .await;
    for name in services {
        if let Err(err) = core.services.start(&name).await {
            log::warn!(target: "core", "Resuming service {name}: {err}");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- Phase 1: Environment & Configuration ---
    dotenvy::dotenv().ok();
    let opts = DaemonOpts::parse();

    let paths = OdacPaths::from_home()?;
    paths
        .ensure_layout()
        .context("cannot access the odac state directory")?;
    setup_logging(&paths.logs_dir(), ".odac", &opts.log_level)?;

    let config = Arc::new(
        ConfigStore::load(&paths.config_dir()).context("loading the configuration store")?,
    );

    // Fresh auth token every startup; the instance id survives restarts
    // unless the updater injected a new one.
    let instance_id = std::env::var("ODAC_INSTANCE_ID").ok().filter(|v| !v.is_empty());
    let channel = opts.channel.clone();
    let instance = config
        .server
        .mutate(|server| {
            server.auth = random_hex(32);
            server.channel = channel.clone();
            server.server_pid = Some(std::process::id());
            if let Some(id) = &instance_id {
                server.instance_id = id.clone();
            } else if server.instance_id.is_empty() {
                server.instance_id = uuid::Uuid::new_v4().to_string();
            }
            server.instance_id.clone()
        })
        .await;
    config.force().await.context("persisting startup config")?;
    log::info!(target: "core", "odacd starting (instance {instance}, channel {})", opts.channel);

    // --- Phase 2: Container Engine ---
    let engine = Arc::new(Engine::new());
    if engine.available().await {
        if let Err(err) = engine.ensure_network(ODAC_NETWORK).await {
            log::warn!(target: "engine", "Network setup failed: {err}");
        }
    } else {
        log::warn!(target: "engine", "Engine not reachable; script services run as local processes");
    }

    // --- Phase 3: Collaborators & Supervisors ---
    let notify = Arc::new(tokio::sync::Notify::new());
    let ssl = Arc::new(SslCoordinator::new(
        Arc::new(DisabledIssuer),
        config.clone(),
        notify.clone(),
    ));
    let proxy = ProxyLink::new(
        paths.clone(),
        config.clone(),
        notify.clone(),
        instance.clone(),
        opts.proxy_control_port,
    );
    let (hub_endpoint, hub_token, hub_secret) = config
        .hub
        .read(|hub| (hub.endpoint.clone(), hub.token.clone(), hub.secret.clone()))
        .await;
    let recipes = Arc::new(HubRecipes::new(hub_endpoint, hub_token, hub_secret));

    let websites = WebsiteSupervisor::new(
        paths.clone(),
        config.clone(),
        engine.clone(),
        Arc::new(DisabledDns),
        ssl.clone(),
        proxy.clone(),
    );
    let services = ServiceSupervisor::new(
        paths.clone(),
        config.clone(),
        engine.clone(),
        recipes,
    );

    let shutdown = CancellationToken::new();
    let core = Arc::new(Core {
        paths: paths.clone(),
        config: config.clone(),
        engine: engine.clone(),
        websites,
        services,
        ssl,
        mail: Arc::new(DisabledMail),
        proxy: proxy.clone(),
        shutdown: shutdown.clone(),
        started_at: Instant::now(),
        update: tokio::sync::Mutex::new(None),
    });

    // --- Phase 4: Update-mode Handshake (successor side) ---
    let takeover = updater::begin_update_mode(&engine)
        .await
        .context("update-mode handshake")?;

    // --- Phase 5: Background Tasks & Listeners ---
    config.spawn_flusher(shutdown.clone());
    tokio::spawn(proxy.clone().run(shutdown.clone()));
    proxy.request_sync();

    let control_listener =
        tokio::net::TcpListener::bind(("127.0.0.1", opts.control_port))
            .await
            .with_context(|| format!("cannot bind control port {}", opts.control_port))?;
    tokio::spawn(ipc::serve_tcp(
        core.clone(),
        control_listener,
        shutdown.clone(),
    ));
    #[cfg(unix)]
    {
        let core = core.clone();
        let socket = paths.api_socket();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = ipc::serve_unix(core, socket, shutdown).await {
                log::error!(target: "ipc", "Unix control socket failed: {err:#}");
            }
        });
    }

    resume_workloads(&core).await;
    tokio::spawn(run_reconciler(core.clone()));

    if let Some(takeover) = takeover {
        let gc_paths = paths.clone();
        tokio::spawn(async move {
            updater::complete_update_mode(takeover, &gc_paths).await;
        });
    }
    log::info!(target: "core", "odacd is up (control port {})", opts.control_port);

    // --- Phase 6: Run Until Shutdown ---
    tokio::select! {
        _ = shutdown_signal() => {
            log::warn!(target: "core", "Shutdown signal received");
        }
        _ = shutdown.cancelled() => {
            log::warn!(target: "core", "Internal shutdown requested");
        }
    }
    shutdown.cancel();

    // --- Phase 7: Teardown ---
    core.websites.stop_all().await;
    core.services.stop_all().await;
    proxy.stop_child().await;
    // Sweep any stray pids recorded by a previous incarnation.
    process::stop_all(&config, &paths).await;
    config
        .server
        .mutate(|server| {
            server.server_pid = None;
            server.watchdog_pid = None;
        })
        .await;
    if let Err(err) = config.force().await {
        log::error!(target: "core", "Final config flush failed: {err:#}");
    }
    log::info!(target: "core", "odacd stopped");
    Ok(())
}
