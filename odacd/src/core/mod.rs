//! The daemon's composition root: the [`Core`] context owns the config
//! store, the container engine and the collaborator handles, and every
//! subsystem receives what it consumes by injection. There are no ambient
//! singletons.

pub mod collaborators;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use odac_common::config::ConfigStore;
use odac_common::paths::OdacPaths;

use crate::engine::Engine;
use crate::proxy_sync::ProxyLink;
use crate::services::ServiceSupervisor;
use crate::updater::UpdateSession;
use crate::websites::WebsiteSupervisor;
use collaborators::{CertIssuer, MailPlane};

/// Shared context handed to IPC handlers and long-running tasks.
pub struct Core {
    pub paths: OdacPaths,
    pub config: Arc<ConfigStore>,
    pub engine: Arc<Engine>,
    pub websites: Arc<WebsiteSupervisor>,
    pub services: Arc<ServiceSupervisor>,
    pub ssl: Arc<SslCoordinator>,
    pub mail: Arc<dyn MailPlane>,
    pub proxy: Arc<ProxyLink>,
    pub shutdown: CancellationToken,
    pub started_at: Instant,
    /// The in-flight update, when one is running.
    pub update: tokio::sync::Mutex<Option<UpdateSession>>,
}

/// Serializes certificate renewals per domain.
///
/// A renewal request for a domain with a renewal still in flight cancels the
/// prior task and discards its result before the new one begins. Successful
/// renewals land in the `web` module (expiry strictly monotonic) and trigger
/// a proxy resync so the cached TLS context is dropped.
pub struct SslCoordinator {
    issuer: Arc<dyn CertIssuer>,
    config: Arc<ConfigStore>,
    sync: Arc<Notify>,
    inflight: tokio::sync::Mutex<HashMap<String, (u64, CancellationToken)>>,
    generation: std::sync::atomic::AtomicU64,
}

impl SslCoordinator {
    pub fn new(issuer: Arc<dyn CertIssuer>, config: Arc<ConfigStore>, sync: Arc<Notify>) -> Self {
        Self {
            issuer,
            config,
            sync,
            inflight: tokio::sync::Mutex::new(HashMap::new()),
            generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Request a renewal for `domain`, superseding any in-flight attempt.
    pub async fn request_renewal(self: &Arc<Self>, domain: &str) {
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let cancel = CancellationToken::new();
        {
            let mut inflight = self.inflight.lock().await;
            if let Some((_, prior)) = inflight.insert(domain.to_string(), (generation, cancel.clone()))
            {
                prior.cancel();
            }
        }

        let this = Arc::clone(self);
        let domain = domain.to_string();
        tokio::spawn(async move {
            let outcome = this.issuer.renew(&domain, cancel.clone()).await;

            // Superseded renewals are discarded wholesale.
            if cancel.is_cancelled() {
                log::debug!(target: "ssl", "Renewal for {domain} superseded; result discarded");
                return;
            }

            match outcome {
                Ok(Some(descriptor)) => {
                    let applied = this
                        .config
                        .web
                        .mutate(|web| {
                            let Some(site) = web.websites.get_mut(&domain) else {
                                return false;
                            };
                            let current_expiry =
                                site.cert.as_ref().map(|c| c.ssl.expiry).unwrap_or(0);
                            if descriptor.ssl.expiry <= current_expiry {
                                return false;
                            }
                            site.cert = Some(descriptor);
                            site.updated_at = odac_common::util::epoch_ms();
                            true
                        })
                        .await;
                    if applied {
                        log::info!(target: "ssl", "Certificate for {domain} renewed");
                        this.sync.notify_one();
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    log::error!(target: "ssl", "Renewal for {domain} failed: {err}");
                }
            }

            let mut inflight = this.inflight.lock().await;
            if let Some((r#gen, _)) = inflight.get(&domain) {
                if *r#gen == generation {
                    inflight.remove(&domain);
                }
            }
        });
    }

    /// Cancel and forget any in-flight renewal (website deletion).
    pub async fn forget(&self, domain: &str) {
        if let Some((_, token)) = self.inflight.lock().await.remove(domain) {
            token.cancel();
        }
    }

    /// Periodic expiry sweep, delegated to the issuer.
    pub async fn tick(&self) {
        self.issuer.tick().await;
    }
}

/// The one-second reconcile loop driving website, service and SSL checks.
pub async fn run_reconciler(core: Arc<Core>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => {
                log::info!(target: "core", "Reconciler stopping");
                break;
            }
            _ = tick.tick() => {
                core.websites.check().await;
                core.services.check().await;
                core.ssl.tick().await;
            }
        }
    }
}
