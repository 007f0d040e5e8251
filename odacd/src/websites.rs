//! # Website Supervisor
//!
//! Per-domain lifecycle: creation with DNS and certificate onboarding,
//! backend start/stop (local interpreter process, or a one-shot container
//! when the engine is up), a one-second health check with restart backoff,
//! and teardown.
//!
//! The in-memory `DomainRuntime` carries what must not survive a daemon
//! restart: the active flag (which doubles as the start lock), error
//! counters for the backoff window, the live backend handle and the log
//! buffer drained to `~/.odac/logs/<domain>.log` on every tick.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::io::AsyncBufReadExt;

use odac_common::config::modules::{RunStatus, Website};
use odac_common::config::ConfigStore;
use odac_common::net;
use odac_common::paths::OdacPaths;
use odac_common::util::epoch_ms;

use crate::core::collaborators::DnsRecorder;
use crate::core::SslCoordinator;
use crate::engine::{AppSpec, Engine};
use crate::ipc::Progress;
use crate::process;
use crate::proxy_sync::ProxyLink;

#[derive(Debug, Error)]
pub enum WebError {
    #[error("invalid_domain")]
    InvalidDomain,
    #[error("Website {0} already exists.")]
    AlreadyExists(String),
    #[error("Website {0} not found.")]
    NotFound(String),
    #[error("Website {0} is already running.")]
    AlreadyRunning(String),
    #[error("Website {0} is cooling down after {1} failed starts.")]
    CoolingDown(String, u32),
    #[error("No entrypoint found in {0}.")]
    NoEntrypoint(String),
    #[error("No free backend port available.")]
    NoFreePort,
    #[error("{0}")]
    Failed(String),
}

/// Interpreters by entrypoint extension, probed in order.
const ENTRYPOINTS: &[(&str, &str, &[&str], &str)] = &[
    // (extension, interpreter, args before file, container image)
    ("js", "node", &[], "node:20-alpine"),
    ("py", "python", &["-u"], "python:3.12-slim"),
    ("php", "php", &[], "php:8.3-cli"),
    ("rb", "ruby", &[], "ruby:3-alpine"),
    ("sh", "sh", &[], "alpine:3"),
];

struct Entrypoint {
    file: String,
    interpreter: &'static str,
    args: &'static [&'static str],
    image: &'static str,
}

fn find_entrypoint(root: &Path) -> Option<Entrypoint> {
    for (ext, interpreter, args, image) in ENTRYPOINTS {
        let file = format!("index.{ext}");
        if root.join(&file).is_file() {
            return Some(Entrypoint {
                file,
                interpreter,
                args,
                image,
            });
        }
    }
    None
}

enum Backend {
    Process(tokio::process::Child),
    Container(String),
}

#[derive(Default)]
struct DomainRuntime {
    active: bool,
    error_count: u32,
    last_failure: Option<Instant>,
    backend: Option<Backend>,
    logs: Option<Arc<std::sync::Mutex<Vec<String>>>>,
    /// Output arrived since the last tick.
    watcher: bool,
}

pub struct WebsiteSupervisor {
    paths: OdacPaths,
    config: Arc<ConfigStore>,
    engine: Arc<Engine>,
    dns: Arc<dyn DnsRecorder>,
    ssl: Arc<SslCoordinator>,
    proxy: Arc<ProxyLink>,
    runtimes: tokio::sync::Mutex<HashMap<String, DomainRuntime>>,
}

impl WebsiteSupervisor {
    pub fn new(
        paths: OdacPaths,
        config: Arc<ConfigStore>,
        engine: Arc<Engine>,
        dns: Arc<dyn DnsRecorder>,
        ssl: Arc<SslCoordinator>,
        proxy: Arc<ProxyLink>,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config,
            engine,
            dns,
            ssl,
            proxy,
            runtimes: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    /// Strip scheme and trailing slash, lowercase, and validate.
    pub fn normalize_domain(raw: &str) -> Result<String, WebError> {
        let mut domain = raw.trim().to_lowercase();
        for scheme in ["https://", "http://"] {
            if let Some(rest) = domain.strip_prefix(scheme) {
                domain = rest.to_string();
            }
        }
        let domain = domain.trim_end_matches('/').to_string();

        if domain.is_empty() || (domain.len() < 4 && domain != "localhost") {
            return Err(WebError::InvalidDomain);
        }
        if net::is_ip_literal(&domain) {
            return Err(WebError::InvalidDomain);
        }
        if domain.contains('/') || domain.contains(' ') {
            return Err(WebError::InvalidDomain);
        }
        Ok(domain)
    }

    /// Create a website: validate, allocate a port, lay down the skeleton,
    /// install DNS records, register in config and request a certificate.
    pub async fn create(&self, raw_domain: &str, progress: &Progress) -> Result<String, WebError> {
        let domain = Self::normalize_domain(raw_domain)?;

        let exists = self
            .config
            .web
            .read(|web| web.websites.contains_key(&domain))
            .await;
        if exists {
            return Err(WebError::AlreadyExists(domain));
        }
        progress.emit("domain", "ok", &format!("Domain {domain} validated"));

        let mut used = self.config.web.read(|w| w.used_ports()).await;
        used.extend(self.config.services.read(|s| s.used_ports()).await);
        let port = net::find_free_port(net::WEB_PORT_RANGE, &used).ok_or(WebError::NoFreePort)?;

        let root = self.paths.web_dir().join(&domain);
        write_skeleton(&root, &domain)
            .map_err(|e| WebError::Failed(format!("creating document root: {e}")))?;
        progress.emit("files", "ok", "Document root initialized");

        if domain != "localhost" {
            match self.dns.install_records(&domain).await {
                Ok(()) => progress.emit("dns", "ok", &format!("DNS records for {domain} installed")),
                Err(err) => {
                    log::warn!(target: "web", "DNS setup for {domain} failed: {err}");
                    progress.emit("dns", "err", &err.to_string());
                }
            }
        }

        let now = epoch_ms();
        self.config
            .web
            .mutate(|web| {
                web.websites.insert(
                    domain.clone(),
                    Website {
                        root: root.clone(),
                        port,
                        pid: None,
                        subdomains: vec!["www".to_string()],
                        cert: None,
                        status: RunStatus::Stopped,
                        created_at: now,
                        updated_at: now,
                    },
                );
            })
            .await;

        self.ssl.request_renewal(&domain).await;
        progress.emit("ssl", "ok", "Certificate renewal requested");

        self.runtimes
            .lock()
            .await
            .insert(domain.clone(), DomainRuntime::default());
        self.proxy.request_sync();

        Ok(format!("Website {domain} created."))
    }

    /// Start a website backend. The runtime's `active` flag is the start
    /// lock; the error-cooldown window is `error_count` seconds long.
    pub async fn start(&self, domain: &str) -> Result<(), WebError> {
        let site = self
            .config
            .web
            .read(|web| web.websites.get(domain).cloned())
            .await
            .ok_or_else(|| WebError::NotFound(domain.to_string()))?;

        let mut runtimes = self.runtimes.lock().await;
        let runtime = runtimes.entry(domain.to_string()).or_default();
        if runtime.active {
            return Err(WebError::AlreadyRunning(domain.to_string()));
        }
        if let Some(last) = runtime.last_failure {
            let cooldown = Duration::from_secs(runtime.error_count as u64);
            if last.elapsed() < cooldown {
                return Err(WebError::CoolingDown(
                    domain.to_string(),
                    runtime.error_count,
                ));
            }
        }
        let Some(entrypoint) = find_entrypoint(&site.root) else {
            return Err(WebError::NoEntrypoint(site.root.display().to_string()));
        };

        runtime.active = true;
        let spawned = self.spawn_backend(domain, &site, &entrypoint, runtime).await;

        match spawned {
            Ok(pid) => {
                runtime.error_count = 0;
                runtime.last_failure = None;
                drop(runtimes);
                self.config
                    .web
                    .mutate(|web| {
                        if let Some(site) = web.websites.get_mut(domain) {
                            site.pid = pid;
                            site.status = RunStatus::Running;
                            site.updated_at = epoch_ms();
                        }
                    })
                    .await;
                self.proxy.request_sync();
                log::info!(target: "web", "Website {domain} started");
                Ok(())
            }
            Err(err) => {
                runtime.active = false;
                runtime.error_count += 1;
                runtime.last_failure = Some(Instant::now());
                drop(runtimes);
                self.config
                    .web
                    .mutate(|web| {
                        if let Some(site) = web.websites.get_mut(domain) {
                            site.status = RunStatus::Errored;
                            site.updated_at = epoch_ms();
                        }
                    })
                    .await;
                log::error!(target: "web", "Starting {domain} failed: {err}");
                Err(err)
            }
        }
    }

    async fn spawn_backend(
        &self,
        domain: &str,
        site: &Website,
        entrypoint: &Entrypoint,
        runtime: &mut DomainRuntime,
    ) -> Result<Option<u32>, WebError> {
        if self.engine.available().await {
            let name = container_name(domain);
            let mut env = std::collections::BTreeMap::new();
            env.insert("PORT".to_string(), site.port.to_string());
            let mut cmd = vec![entrypoint.interpreter.to_string()];
            cmd.extend(entrypoint.args.iter().map(|a| a.to_string()));
            cmd.push(format!("/app/{}", entrypoint.file));

            self.engine
                .run_app(
                    &name,
                    &AppSpec {
                        image: entrypoint.image.to_string(),
                        ports: vec![odac_common::config::modules::PortBinding {
                            host: site.port,
                            container: site.port,
                            ip: Some("127.0.0.1".to_string()),
                        }],
                        volumes: vec![odac_common::config::modules::VolumeBinding {
                            host: site.root.clone(),
                            container: "/app".to_string(),
                        }],
                        env,
                        cmd: Some(cmd),
                    },
                )
                .await
                .map_err(|e| WebError::Failed(e.to_string()))?;
            runtime.backend = Some(Backend::Container(name));
            return Ok(None);
        }

        let logs: Arc<std::sync::Mutex<Vec<String>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut child = tokio::process::Command::new(entrypoint.interpreter)
            .args(entrypoint.args)
            .arg(&entrypoint.file)
            .current_dir(&site.root)
            .env("PORT", site.port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WebError::Failed(format!("spawning {}: {e}", entrypoint.interpreter)))?;

        if let Some(stdout) = child.stdout.take() {
            spawn_log_reader(stdout, logs.clone());
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_log_reader(stderr, logs.clone());
        }

        let pid = child.id();
        runtime.backend = Some(Backend::Process(child));
        runtime.logs = Some(logs);
        Ok(pid)
    }

    /// Stop a website backend and mark it stopped.
    pub async fn stop(&self, domain: &str) -> Result<(), WebError> {
        let known = self
            .config
            .web
            .read(|web| web.websites.contains_key(domain))
            .await;
        if !known {
            return Err(WebError::NotFound(domain.to_string()));
        }

        let backend = {
            let mut runtimes = self.runtimes.lock().await;
            let runtime = runtimes.entry(domain.to_string()).or_default();
            runtime.active = false;
            runtime.backend.take()
        };
        self.teardown_backend(domain, backend).await;

        self.config
            .web
            .mutate(|web| {
                if let Some(site) = web.websites.get_mut(domain) {
                    if let Some(pid) = site.pid.take() {
                        process::stop(pid, "");
                    }
                    site.status = RunStatus::Stopped;
                    site.updated_at = epoch_ms();
                }
            })
            .await;
        self.proxy.request_sync();
        Ok(())
    }

    async fn teardown_backend(&self, domain: &str, backend: Option<Backend>) {
        match backend {
            Some(Backend::Process(mut child)) => {
                let _ = child.start_kill();
                let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
            }
            Some(Backend::Container(name)) => {
                if let Err(err) = self.engine.stop(&name).await {
                    log::debug!(target: "web", "Stopping container for {domain}: {err}");
                }
                let _ = self.engine.remove(&name).await;
            }
            None => {}
        }
    }

    /// Delete a website: stop it, drop caches and counters, tear down DNS,
    /// remove files and the config entry.
    pub async fn delete(&self, raw_domain: &str, progress: &Progress) -> Result<String, WebError> {
        let domain = Self::normalize_domain(raw_domain)?;
        let site = self
            .config
            .web
            .read(|web| web.websites.get(&domain).cloned())
            .await
            .ok_or_else(|| WebError::NotFound(domain.clone()))?;

        let _ = self.stop(&domain).await;
        self.runtimes.lock().await.remove(&domain);
        self.ssl.forget(&domain).await;
        progress.emit("stop", "ok", "Backend stopped");

        if domain != "localhost" {
            if let Err(err) = self.dns.remove_records(&domain).await {
                log::warn!(target: "web", "DNS teardown for {domain} failed: {err}");
                progress.emit("dns", "err", &err.to_string());
            } else {
                progress.emit("dns", "ok", "DNS records removed");
            }
        }

        if site.root.starts_with(self.paths.web_dir()) {
            if let Err(err) = std::fs::remove_dir_all(&site.root) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    log::warn!(target: "web", "Removing {} failed: {err}", site.root.display());
                }
            }
        }
        progress.emit("files", "ok", "Files removed");

        self.config
            .web
            .mutate(|web| {
                web.websites.remove(&domain);
            })
            .await;
        // The snapshot diff drops the cached TLS context in the proxy.
        self.proxy.request_sync();

        Ok(format!("Website {domain} deleted."))
    }

    /// The per-second health check: restart dead backends of active sites
    /// and flush buffered output to the per-domain log file.
    pub async fn check(&self) {
        let domains: Vec<String> = self
            .config
            .web
            .read(|web| web.websites.keys().cloned().collect())
            .await;

        for domain in domains {
            let (needs_restart, log_lines) = {
                let mut runtimes = self.runtimes.lock().await;
                let Some(runtime) = runtimes.get_mut(&domain) else {
                    continue;
                };
                if !runtime.active {
                    continue;
                }

                let dead = match runtime.backend.as_mut() {
                    Some(Backend::Process(child)) => child.try_wait().ok().flatten().is_some(),
                    Some(Backend::Container(name)) => !self.engine.is_running(name).await,
                    None => true,
                };

                let lines: Vec<String> = runtime
                    .logs
                    .as_ref()
                    .map(|buffer| buffer.lock().expect("log buffer poisoned").drain(..).collect())
                    .unwrap_or_default();
                runtime.watcher = !lines.is_empty();

                if dead {
                    runtime.active = false;
                    runtime.backend = None;
                    runtime.error_count += 1;
                    runtime.last_failure = Some(Instant::now());
                }
                (dead, lines)
            };

            if !log_lines.is_empty() {
                self.flush_logs(&domain, &log_lines);
            }

            if needs_restart {
                log::warn!(target: "web", "Backend of {domain} is down; restarting");
                let stale_pid = self
                    .config
                    .web
                    .read(|web| web.websites.get(&domain).and_then(|s| s.pid))
                    .await;
                if let Some(pid) = stale_pid {
                    process::stop(pid, "");
                }
                if let Err(err) = self.start(&domain).await {
                    log::debug!(target: "web", "Restart of {domain} deferred: {err}");
                }
            }
        }
    }

    fn flush_logs(&self, domain: &str, lines: &[String]) {
        let path = self.paths.domain_log(domain);
        let appended = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| {
                for line in lines {
                    writeln!(file, "{line}")?;
                }
                Ok(())
            });
        if let Err(err) = appended {
            log::warn!(target: "web", "Writing {} failed: {err}", path.display());
        }
    }

    /// Mark a website active so the reconciler brings it up.
    pub async fn activate(&self, domain: &str) -> Result<(), WebError> {
        self.start(domain).await
    }

    /// Build the document root into an image and run it as the backend.
    ///
    /// Detection, compile and packaging follow the project's own shape
    /// (`Dockerfile` or trigger files); the resulting container serves on
    /// the website's allocated port with `PORT` injected.
    pub async fn deploy(&self, raw_domain: &str, progress: &Progress) -> Result<String, WebError> {
        let domain = Self::normalize_domain(raw_domain)?;
        let site = self
            .config
            .web
            .read(|web| web.websites.get(&domain).cloned())
            .await
            .ok_or_else(|| WebError::NotFound(domain.clone()))?;

        if !self.engine.available().await {
            return Err(WebError::Failed(
                "container engine unavailable; deploy needs an engine".into(),
            ));
        }

        let image = deploy_image(&domain);
        progress.emit("build", "info", &format!("Building {image}"));
        self.engine
            .build(&site.root, &image)
            .await
            .map_err(|e| WebError::Failed(e.to_string()))?;
        progress.emit("build", "ok", &format!("Image {image} ready"));

        // Swap the backend under the active flag.
        let _ = self.stop(&domain).await;
        {
            let mut runtimes = self.runtimes.lock().await;
            let runtime = runtimes.entry(domain.clone()).or_default();

            let mut env = std::collections::BTreeMap::new();
            env.insert("PORT".to_string(), site.port.to_string());
            self.engine
                .run_app(
                    &container_name(&domain),
                    &AppSpec {
                        image: image.clone(),
                        ports: vec![odac_common::config::modules::PortBinding {
                            host: site.port,
                            container: site.port,
                            ip: Some("127.0.0.1".to_string()),
                        }],
                        volumes: Vec::new(),
                        env,
                        cmd: None,
                    },
                )
                .await
                .map_err(|e| WebError::Failed(e.to_string()))?;
            runtime.backend = Some(Backend::Container(container_name(&domain)));
            runtime.active = true;
            runtime.error_count = 0;
            runtime.last_failure = None;
        }

        self.config
            .web
            .mutate(|web| {
                if let Some(site) = web.websites.get_mut(&domain) {
                    site.pid = None;
                    site.status = RunStatus::Running;
                    site.updated_at = epoch_ms();
                }
            })
            .await;
        self.proxy.request_sync();
        progress.emit("run", "ok", "Deployed backend is up");

        Ok(format!("Website {domain} deployed."))
    }

    /// Stop every backend (shutdown, handover).
    pub async fn stop_all(&self) {
        let domains: Vec<String> = self
            .config
            .web
            .read(|web| web.websites.keys().cloned().collect())
            .await;
        for domain in domains {
            let _ = self.stop(&domain).await;
        }
    }

    /// Summaries for `web.list`.
    pub async fn list(&self) -> Vec<serde_json::Value> {
        self.config
            .web
            .read(|web| {
                web.websites
                    .iter()
                    .map(|(domain, site)| {
                        serde_json::json!({
                            "domain": domain,
                            "port": site.port,
                            "status": site.status,
                            "createdAt": site.created_at,
                            "updatedAt": site.updated_at,
                        })
                    })
                    .collect()
            })
            .await
    }
}

fn container_name(domain: &str) -> String {
    format!("odac-web-{}", domain.replace('.', "-"))
}

fn deploy_image(domain: &str) -> String {
    format!("odac/web-{}", domain.replace('.', "-"))
}

fn spawn_log_reader(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    buffer: Arc<std::sync::Mutex<Vec<String>>>,
) {
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            buffer.lock().expect("log buffer poisoned").push(line);
        }
    });
}

/// Lay down the default project: a tiny HTTP backend plus its manifest.
fn write_skeleton(root: &PathBuf, domain: &str) -> std::io::Result<()> {
    std::fs::create_dir_all(root)?;
    let index = root.join("index.js");
    if !index.exists() {
        std::fs::write(
            &index,
            format!(
                "const http = require('http');\n\
                 const port = process.env.PORT || 3000;\n\
                 http.createServer((req, res) => {{\n\
                 \x20\x20res.writeHead(200, {{ 'Content-Type': 'text/html' }});\n\
                 \x20\x20res.end('<h1>{domain}</h1><p>Powered by odac</p>');\n\
                 }}).listen(port);\n"
            ),
        )?;
    }
    let manifest = root.join("package.json");
    if !manifest.exists() {
        std::fs::write(
            &manifest,
            format!(
                "{{\n  \"name\": \"{}\",\n  \"version\": \"1.0.0\",\n  \"main\": \"index.js\"\n}}\n",
                domain.replace('.', "-")
            ),
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{DisabledDns, DisabledIssuer};
    use crate::core::SslCoordinator;
    use odac_common::config::ConfigStore;

    async fn supervisor(root: &Path) -> Arc<WebsiteSupervisor> {
        let paths = OdacPaths::rooted(root);
        paths.ensure_layout().unwrap();
        let config = Arc::new(ConfigStore::load(&paths.config_dir()).unwrap());
        let engine = Arc::new(Engine::new());
        let notify = Arc::new(tokio::sync::Notify::new());
        let ssl = Arc::new(SslCoordinator::new(
            Arc::new(DisabledIssuer),
            config.clone(),
            notify.clone(),
        ));
        let proxy = crate::proxy_sync::ProxyLink::new(
            paths.clone(),
            config.clone(),
            notify,
            "test".into(),
            1454,
        );
        WebsiteSupervisor::new(paths, config, engine, Arc::new(DisabledDns), ssl, proxy)
    }

    #[tokio::test]
    async fn create_registers_and_rejects_duplicates() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let progress = Progress::discard();

        let message = sup.create(" https://Demo.test/ ", &progress).await.unwrap();
        assert_eq!(message, "Website demo.test created.");

        let site = sup
            .config
            .web
            .read(|w| w.websites.get("demo.test").cloned())
            .await
            .expect("registered");
        assert!(net::WEB_PORT_RANGE.contains(&site.port));
        assert!(site.root.join("index.js").is_file());
        assert_eq!(site.subdomains, vec!["www".to_string()]);

        let err = sup.create("demo.test", &progress).await.unwrap_err();
        assert!(matches!(err, WebError::AlreadyExists(d) if d == "demo.test"));
    }

    #[tokio::test]
    async fn start_refuses_without_an_entrypoint() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let progress = Progress::discard();
        sup.create("bare.test", &progress).await.unwrap();

        let root = sup
            .config
            .web
            .read(|w| w.websites.get("bare.test").map(|s| s.root.clone()))
            .await
            .unwrap();
        std::fs::remove_file(root.join("index.js")).unwrap();

        let err = sup.start("bare.test").await.unwrap_err();
        assert!(matches!(err, WebError::NoEntrypoint(_)));
    }

    #[tokio::test]
    async fn shell_backend_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        // This path exercises the local-process backend; with a live engine
        // the supervisor would run containers instead.
        if sup.engine.available().await {
            return;
        }

        let progress = Progress::discard();
        sup.create("shell.test", &progress).await.unwrap();
        let root = sup
            .config
            .web
            .read(|w| w.websites.get("shell.test").map(|s| s.root.clone()))
            .await
            .unwrap();
        std::fs::remove_file(root.join("index.js")).unwrap();
        std::fs::write(root.join("index.sh"), "sleep 60\n").unwrap();

        sup.start("shell.test").await.unwrap();
        let (status, pid) = sup
            .config
            .web
            .read(|w| {
                let site = w.websites.get("shell.test").unwrap();
                (site.status, site.pid)
            })
            .await;
        assert_eq!(status, RunStatus::Running);
        let pid = pid.expect("local backend records its pid");
        assert!(crate::process::alive(pid));

        let err = sup.start("shell.test").await.unwrap_err();
        assert!(matches!(err, WebError::AlreadyRunning(_)));

        sup.stop("shell.test").await.unwrap();
        let (status, pid) = sup
            .config
            .web
            .read(|w| {
                let site = w.websites.get("shell.test").unwrap();
                (site.status, site.pid)
            })
            .await;
        assert_eq!(status, RunStatus::Stopped);
        assert!(pid.is_none());
    }

    #[tokio::test]
    async fn delete_returns_config_to_prior_state() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path()).await;
        let progress = Progress::discard();

        sup.create("gone.test", &progress).await.unwrap();
        let root = sup
            .config
            .web
            .read(|w| w.websites.get("gone.test").map(|s| s.root.clone()))
            .await
            .unwrap();
        assert!(root.is_dir());

        let message = sup.delete("gone.test", &progress).await.unwrap();
        assert_eq!(message, "Website gone.test deleted.");
        assert!(!root.exists());
        let present = sup
            .config
            .web
            .read(|w| w.websites.contains_key("gone.test"))
            .await;
        assert!(!present);
    }

    #[test]
    fn domains_are_normalized_and_validated() {
        assert_eq!(
            WebsiteSupervisor::normalize_domain(" https://Example.com/ ").unwrap(),
            "example.com"
        );
        assert_eq!(
            WebsiteSupervisor::normalize_domain("localhost").unwrap(),
            "localhost"
        );
        assert!(matches!(
            WebsiteSupervisor::normalize_domain("ab"),
            Err(WebError::InvalidDomain)
        ));
        assert!(matches!(
            WebsiteSupervisor::normalize_domain("192.0.2.10"),
            Err(WebError::InvalidDomain)
        ));
        assert!(matches!(
            WebsiteSupervisor::normalize_domain("::1"),
            Err(WebError::InvalidDomain)
        ));
        assert!(matches!(
            WebsiteSupervisor::normalize_domain("bad domain.com"),
            Err(WebError::InvalidDomain)
        ));
    }

    #[test]
    fn entrypoints_are_probed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.py"), b"").unwrap();
        std::fs::write(dir.path().join("index.sh"), b"").unwrap();
        let found = find_entrypoint(dir.path()).unwrap();
        assert_eq!(found.file, "index.py");
        assert_eq!(found.interpreter, "python");
        assert_eq!(found.args, ["-u"].as_slice());

        std::fs::write(dir.path().join("index.js"), b"").unwrap();
        let found = find_entrypoint(dir.path()).unwrap();
        assert_eq!(found.interpreter, "node");
    }

    #[test]
    fn skeleton_contains_a_working_backend() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("example.com");
        write_skeleton(&root, "example.com").unwrap();
        let index = std::fs::read_to_string(root.join("index.js")).unwrap();
        assert!(index.contains("process.env.PORT"));
        assert!(index.contains("example.com"));
        assert!(root.join("package.json").exists());
    }

    #[test]
    fn container_names_are_engine_safe() {
        assert_eq!(container_name("example.com"), "odac-web-example-com");
    }
}
