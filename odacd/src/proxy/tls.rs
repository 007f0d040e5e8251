//! TLS termination: per-hostname certificate selection via SNI with a
//! bounded LRU of prepared contexts, falling back to the default server
//! certificate when a site has none (or its files are missing).

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use rustls::crypto::ring::sign::any_supported_type;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use odac_common::config::modules::CertFiles;

/// Upper bound on cached TLS contexts.
const CERT_CACHE_CAP: usize = 256;

/// Least-recently-used map of prepared certificates.
struct CertCache {
    map: HashMap<String, Arc<CertifiedKey>>,
    order: VecDeque<String>,
}

impl CertCache {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn get(&mut self, host: &str) -> Option<Arc<CertifiedKey>> {
        let hit = self.map.get(host).cloned()?;
        // Refresh recency.
        if let Some(pos) = self.order.iter().position(|h| h == host) {
            self.order.remove(pos);
        }
        self.order.push_back(host.to_string());
        Some(hit)
    }

    fn insert(&mut self, host: String, key: Arc<CertifiedKey>) {
        if self.map.insert(host.clone(), key).is_none() {
            self.order.push_back(host);
        }
        while self.map.len() > CERT_CACHE_CAP {
            let Some(evicted) = self.order.pop_front() else {
                break;
            };
            self.map.remove(&evicted);
        }
    }

    fn invalidate(&mut self, host: &str) {
        if self.map.remove(host).is_some() {
            if let Some(pos) = self.order.iter().position(|h| h == host) {
                self.order.remove(pos);
            }
        }
    }
}

struct ResolverInner {
    /// Hostname -> certificate files, from the latest snapshot.
    sites: HashMap<String, CertFiles>,
    cache: CertCache,
    default_cert: Arc<CertifiedKey>,
}

/// SNI resolver: lower-case and port-strip the name, walk suffixes from the
/// most specific, read the matching site's key/cert, cache the context.
pub struct SniResolver {
    inner: Mutex<ResolverInner>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SniResolver")
    }
}

impl SniResolver {
    pub fn new(default_cert: Arc<CertifiedKey>) -> Self {
        Self {
            inner: Mutex::new(ResolverInner {
                sites: HashMap::new(),
                cache: CertCache::new(),
                default_cert,
            }),
        }
    }

    /// Install the hostname->cert map of a fresh snapshot, invalidating the
    /// cache entry of every hostname whose files changed or disappeared.
    pub fn update_sites(&self, sites: HashMap<String, CertFiles>) {
        let mut inner = self.inner.lock().expect("tls resolver poisoned");
        let stale: Vec<String> = inner
            .sites
            .iter()
            .filter(|(host, files)| sites.get(*host) != Some(files))
            .map(|(host, _)| host.clone())
            .collect();
        for host in stale {
            inner.cache.invalidate(&host);
        }
        inner.sites = sites;
    }

    /// Drop one hostname's cached context (renewal, deletion).
    pub fn clear(&self, host: &str) {
        self.inner
            .lock()
            .expect("tls resolver poisoned")
            .cache
            .invalidate(host);
    }

    pub fn set_default(&self, default_cert: Arc<CertifiedKey>) {
        self.inner.lock().expect("tls resolver poisoned").default_cert = default_cert;
    }

    fn resolve_name(&self, raw_name: &str) -> Arc<CertifiedKey> {
        let name = raw_name
            .to_lowercase()
            .rsplit_once(':')
            .map(|(host, port)| {
                if port.chars().all(|c| c.is_ascii_digit()) {
                    host.to_string()
                } else {
                    raw_name.to_lowercase()
                }
            })
            .unwrap_or_else(|| raw_name.to_lowercase());

        let mut inner = self.inner.lock().expect("tls resolver poisoned");

        // Longest registered suffix wins: drop leftmost labels until a site
        // matches.
        let mut candidate = name.as_str();
        loop {
            if inner.sites.contains_key(candidate) {
                break;
            }
            match candidate.split_once('.') {
                Some((_, rest)) if !rest.is_empty() => candidate = rest,
                _ => return inner.default_cert.clone(),
            }
        }
        let matched = candidate.to_string();

        if let Some(cached) = inner.cache.get(&matched) {
            return cached;
        }

        let files = inner.sites.get(&matched).cloned();
        let loaded = files.as_ref().and_then(|f| {
            load_certified_key(&f.key, &f.cert)
                .map_err(|err| {
                    log::warn!(target: "proxy", "Certificate for {matched} unusable: {err}");
                })
                .ok()
        });
        match loaded {
            Some(key) => {
                let key = Arc::new(key);
                inner.cache.insert(matched, key.clone());
                key
            }
            None => inner.default_cert.clone(),
        }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let name = client_hello.server_name().unwrap_or("");
        Some(self.resolve_name(name))
    }
}

/// Read a PEM key/cert pair into a rustls `CertifiedKey`.
pub fn load_certified_key(key_path: &Path, cert_path: &Path) -> anyhow::Result<CertifiedKey> {
    let cert_pem = std::fs::read(cert_path)?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in {}", cert_path.display());
    }

    let key_pem = std::fs::read(key_path)?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
        .ok_or_else(|| anyhow::anyhow!("no private key in {}", key_path.display()))?;
    let signing_key = any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported key in {}: {e}", key_path.display()))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Generate the fallback self-signed certificate used when neither a site
/// cert nor a configured default is available.
pub fn self_signed_default() -> anyhow::Result<Arc<CertifiedKey>> {
    let generated = rcgen::generate_simple_self_signed(vec!["odac.local".to_string()])?;
    let cert_der: CertificateDer<'static> = generated.cert.der().clone();
    let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        generated.key_pair.serialize_der(),
    ));
    let signing_key =
        any_supported_type(&key_der).map_err(|e| anyhow::anyhow!("self-signed key: {e}"))?;
    Ok(Arc::new(CertifiedKey::new(vec![cert_der], signing_key)))
}

/// The server TLS configuration: TLS >= 1.2, ALPN h2 + http/1.1, SNI-driven
/// certificate selection.
pub fn server_config(resolver: Arc<SniResolver>) -> Arc<rustls::ServerConfig> {
    let mut config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}
