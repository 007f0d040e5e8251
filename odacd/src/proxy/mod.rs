//! # Reverse Proxy Runtime
//!
//! State shared by the `odac-proxy` listeners: the latest configuration
//! snapshot pushed by the daemon, the firewall engine, the SNI resolver and
//! the pooled upstream client. Port 80 redirects known hosts to HTTPS; port
//! 443 terminates TLS and forwards to tenant backends.

pub mod control;
pub mod forward;
pub mod http;
pub mod tls;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;

use odac_common::config::modules::CertFiles;
use odac_common::firewall::Firewall;
use odac_common::net::normalize_ip;
use odac_common::wire::{ProxySite, ProxySnapshot};

use tls::SniResolver;

/// Shared state of one proxy process.
pub struct ProxyState {
    snapshot: RwLock<Arc<ProxySnapshot>>,
    pub firewall: Firewall,
    pub tls: Arc<SniResolver>,
    pub client: Client<HttpConnector, axum::body::Body>,
    /// Live WebSocket pipes per peer IP, bounded by `max_ws_per_ip`.
    ws_counts: Mutex<HashMap<String, u32>>,
}

impl ProxyState {
    pub fn new() -> anyhow::Result<Arc<Self>> {
        let resolver = Arc::new(SniResolver::new(tls::self_signed_default()?));
        Ok(Arc::new(Self {
            snapshot: RwLock::new(Arc::new(ProxySnapshot::default())),
            firewall: Firewall::new(Default::default()),
            tls: resolver,
            client: Client::builder(TokioExecutor::new()).build_http(),
            ws_counts: Mutex::new(HashMap::new()),
        }))
    }

    /// Install a configuration snapshot from the daemon: firewall policy,
    /// SNI cert map (stale contexts invalidated) and routing table.
    pub fn apply(&self, snapshot: ProxySnapshot) {
        self.firewall.set_policy(snapshot.firewall.clone());

        let certs: HashMap<String, CertFiles> = snapshot
            .websites
            .iter()
            .filter_map(|(host, site)| site.cert.clone().map(|c| (host.clone(), c)))
            .collect();
        self.tls.update_sites(certs);

        if let Some(default_files) = &snapshot.ssl.default_cert {
            match tls::load_certified_key(&default_files.key, &default_files.cert) {
                Ok(key) => self.tls.set_default(Arc::new(key)),
                Err(err) => {
                    log::warn!(target: "proxy", "Configured default certificate unusable: {err}");
                }
            }
        }

        *self.snapshot.write().expect("proxy snapshot poisoned") = Arc::new(snapshot);
    }

    pub fn snapshot(&self) -> Arc<ProxySnapshot> {
        self.snapshot.read().expect("proxy snapshot poisoned").clone()
    }

    /// Find the website owning `host` by dropping leftmost labels until a
    /// registered key matches.
    pub fn resolve_site(&self, host: &str) -> Option<(String, ProxySite)> {
        let snapshot = self.snapshot();
        resolve_site(&snapshot.websites, host)
    }

    /// Reserve a WebSocket slot for `ip`. Returns false past the cap.
    pub fn ws_acquire(&self, ip: &str) -> bool {
        let max = self.snapshot().firewall.max_ws_per_ip;
        let ip = normalize_ip(ip);
        let mut counts = self.ws_counts.lock().expect("ws counts poisoned");
        let slot = counts.entry(ip).or_insert(0);
        if *slot >= max {
            return false;
        }
        *slot += 1;
        true
    }

    pub fn ws_release(&self, ip: &str) {
        let ip = normalize_ip(ip);
        let mut counts = self.ws_counts.lock().expect("ws counts poisoned");
        if let Some(slot) = counts.get_mut(&ip) {
            *slot = slot.saturating_sub(1);
            if *slot == 0 {
                counts.remove(&ip);
            }
        }
    }
}

/// Longest-suffix website lookup over a routing table.
pub fn resolve_site(
    websites: &HashMap<String, ProxySite>,
    host: &str,
) -> Option<(String, ProxySite)> {
    let mut name = host.trim().to_lowercase();
    if let Some((bare, port)) = name.rsplit_once(':') {
        if port.chars().all(|c| c.is_ascii_digit()) {
            name = bare.to_string();
        }
    }
    if name.is_empty() {
        return None;
    }

    let mut candidate = name.as_str();
    loop {
        if let Some(site) = websites.get(candidate) {
            return Some((candidate.to_string(), site.clone()));
        }
        match candidate.split_once('.') {
            Some((_, rest)) if !rest.is_empty() => candidate = rest,
            _ => return None,
        }
    }
}

/// The page served for unknown hosts and down backends.
pub fn default_page(host: &str) -> String {
    let shown = if host.is_empty() { "this server" } else { host };
    format!(
        "<!doctype html>\n<html>\n<head><title>odac</title></head>\n<body>\n\
         <h1>odac</h1>\n<p>Nothing is configured for {shown} yet.</p>\n\
         </body>\n</html>\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(hosts: &[(&str, u16)]) -> HashMap<String, ProxySite> {
        hosts
            .iter()
            .map(|(h, p)| {
                (
                    h.to_string(),
                    ProxySite {
                        port: *p,
                        up: true,
                        cert: None,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn longest_suffix_wins() {
        let sites = table(&[("example.com", 10001), ("api.example.com", 10002)]);
        let (host, site) = resolve_site(&sites, "api.example.com").unwrap();
        assert_eq!((host.as_str(), site.port), ("api.example.com", 10002));

        let (host, site) = resolve_site(&sites, "deep.api.example.com").unwrap();
        assert_eq!((host.as_str(), site.port), ("api.example.com", 10002));

        let (host, site) = resolve_site(&sites, "www.example.com").unwrap();
        assert_eq!((host.as_str(), site.port), ("example.com", 10001));
    }

    #[test]
    fn host_is_normalized_before_matching() {
        let sites = table(&[("example.com", 10001)]);
        assert!(resolve_site(&sites, "EXAMPLE.com:443").is_some());
        assert!(resolve_site(&sites, "").is_none());
        assert!(resolve_site(&sites, "other.net").is_none());
    }

    #[test]
    fn ws_slots_are_bounded_per_ip() {
        let state = ProxyState::new().unwrap();
        let mut snapshot = ProxySnapshot::default();
        snapshot.firewall.max_ws_per_ip = 2;
        state.apply(snapshot);

        assert!(state.ws_acquire("203.0.113.7"));
        assert!(state.ws_acquire("::ffff:203.0.113.7"));
        assert!(!state.ws_acquire("203.0.113.7"));
        // A separate peer is unaffected.
        assert!(state.ws_acquire("203.0.113.8"));

        state.ws_release("203.0.113.7");
        assert!(state.ws_acquire("203.0.113.7"));
    }
}
