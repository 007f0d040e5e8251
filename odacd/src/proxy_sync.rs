//! Daemon side of the proxy pairing: spawn or adopt the `odac-proxy` child
//! and push configuration snapshots to its control endpoint.
//!
//! Adoption is pid-file based and defensive: a pid file pointing at a
//! process whose cmdline is not an odac proxy is stale (pid reuse) — it is
//! deleted and a fresh proxy is spawned.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper_util::rt::TokioIo;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use odac_common::config::ConfigStore;
use odac_common::paths::OdacPaths;
use odac_common::wire::{ProxySite, ProxySnapshot};

use crate::process;

/// Attempts for one snapshot push.
const PUSH_ATTEMPTS: usize = 3;
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(500);
/// Background resync cadence when nothing explicitly requests one.
const RESYNC_INTERVAL: Duration = Duration::from_secs(30);

pub struct ProxyLink {
    paths: OdacPaths,
    config: Arc<ConfigStore>,
    notify: Arc<Notify>,
    instance: String,
    control_port: u16,
    child: tokio::sync::Mutex<Option<tokio::process::Child>>,
}

impl ProxyLink {
    pub fn new(
        paths: OdacPaths,
        config: Arc<ConfigStore>,
        notify: Arc<Notify>,
        instance: String,
        control_port: u16,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config,
            notify,
            instance,
            control_port,
            child: tokio::sync::Mutex::new(None),
        })
    }

    /// Ask the sync loop to push a fresh snapshot soon.
    pub fn request_sync(&self) {
        self.notify.notify_one();
    }

    /// Adopt a live proxy via its pid file, or spawn a fresh one. A pid file
    /// whose process is gone or is not an odac proxy is deleted.
    pub async fn ensure_running(&self) -> Result<()> {
        let pid_file = self.paths.proxy_pid_file(&self.instance);
        if let Ok(raw) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                if process::cmdline_matches(pid, "odac-proxy") {
                    return Ok(());
                }
            }
            log::warn!(
                target: "proxy-sync",
                "Stale proxy pid file {}; removing and respawning",
                pid_file.display()
            );
            let _ = std::fs::remove_file(&pid_file);
        }

        let mut slot = self.child.lock().await;
        if let Some(child) = slot.as_mut() {
            if child.try_wait().ok().flatten().is_none() {
                return Ok(()); // our spawn is still alive, pid file pending
            }
        }

        let own = std::env::current_exe().context("locating own binary")?;
        let proxy_bin = own
            .parent()
            .map(|dir| dir.join("odac-proxy"))
            .context("locating odac-proxy binary")?;

        log::info!(target: "proxy-sync", "Spawning proxy for instance {}", self.instance);
        let child = tokio::process::Command::new(&proxy_bin)
            .env("ODAC_INSTANCE_ID", &self.instance)
            .stdin(std::process::Stdio::null())
            .spawn()
            .with_context(|| format!("spawning {}", proxy_bin.display()))?;
        *slot = Some(child);
        Ok(())
    }

    /// Assemble the `{websites, firewall, ssl}` snapshot from config.
    pub async fn build_snapshot(&self) -> ProxySnapshot {
        let websites = self
            .config
            .web
            .read(|web| {
                web.websites
                    .iter()
                    .map(|(domain, site)| {
                        (
                            domain.clone(),
                            ProxySite {
                                port: site.port,
                                up: site.status
                                    == odac_common::config::modules::RunStatus::Running,
                                cert: site.cert.as_ref().map(|c| c.ssl.clone()),
                            },
                        )
                    })
                    .collect()
            })
            .await;
        let firewall = self.config.firewall.read(|f| f.clone()).await;
        let ssl = self.config.ssl.read(|s| s.clone()).await;
        ProxySnapshot {
            websites,
            firewall,
            ssl,
        }
    }

    /// Push the current snapshot, retrying bounded times while the proxy
    /// is still coming up.
    pub async fn push(&self) -> Result<()> {
        self.ensure_running().await?;
        let snapshot = self.build_snapshot().await;
        let body = Bytes::from(serde_json::to_vec(&snapshot)?);

        let mut last_err: Option<anyhow::Error> = None;
        for attempt in 1..=PUSH_ATTEMPTS {
            match self.post_config(body.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if retryable(&err) && attempt < PUSH_ATTEMPTS => {
                    log::debug!(
                        target: "proxy-sync",
                        "Config push attempt {attempt} failed ({err:#}); retrying"
                    );
                    last_err = Some(err);
                    tokio::time::sleep(PUSH_RETRY_DELAY).await;
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("config push failed")))
    }

    #[cfg(unix)]
    async fn post_config(&self, body: Bytes) -> Result<()> {
        let socket = self.paths.proxy_socket(&self.instance);
        let stream = tokio::net::UnixStream::connect(&socket)
            .await
            .with_context(|| format!("connecting {}", socket.display()))?;
        self.send_over(stream, body).await
    }

    #[cfg(not(unix))]
    async fn post_config(&self, body: Bytes) -> Result<()> {
        let stream = tokio::net::TcpStream::connect(("127.0.0.1", self.control_port))
            .await
            .with_context(|| format!("connecting 127.0.0.1:{}", self.control_port))?;
        self.send_over(stream, body).await
    }

    async fn send_over<S>(&self, stream: S, body: Bytes) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .context("proxy control handshake")?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let request = http::Request::post("/config")
            .header(http::header::HOST, "odac-proxy")
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Full::new(body))
            .context("building config request")?;
        let response = sender
            .send_request(request)
            .await
            .context("sending config request")?;
        // The body is ignored beyond the status line.
        if !response.status().is_success() {
            anyhow::bail!("proxy rejected config: {}", response.status());
        }
        Ok(())
    }

    /// The sync loop: push on request, and periodically as a safety net.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut tick = tokio::time::interval(RESYNC_INTERVAL);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tick.tick() => {}
            }
            if let Err(err) = self.push().await {
                log::warn!(target: "proxy-sync", "Proxy config sync failed: {err:#}");
            }
        }
    }

    /// Terminate a proxy we spawned (daemon shutdown path).
    pub async fn stop_child(&self) {
        let pid_file = self.paths.proxy_pid_file(&self.instance);
        if let Ok(raw) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                process::stop(pid, "odac-proxy");
            }
        }
        let mut slot = self.child.lock().await;
        if let Some(mut child) = slot.take() {
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
    }
}

/// Connection-level failures are retried; anything else aborts the push.
fn retryable(err: &anyhow::Error) -> bool {
    if let Some(io_err) = err.downcast_ref::<std::io::Error>() {
        return matches!(
            io_err.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::NotFound
                | std::io::ErrorKind::ConnectionReset
        );
    }
    err.downcast_ref::<hyper::Error>().is_some()
}
