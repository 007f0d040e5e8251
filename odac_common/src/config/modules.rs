//! Schema of the persisted configuration modules.
//!
//! Each top-level struct here maps to one `<name>.json` file under
//! `~/.odac/config/`. Field names stay camelCase on disk so existing
//! installations keep their files readable across upgrades.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

/// Runtime state of a website or service backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Starting,
    Running,
    #[default]
    Stopped,
    Errored,
}

/// Key/certificate pair on disk plus its expiry instant (epoch-ms).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertFiles {
    pub key: PathBuf,
    pub cert: PathBuf,
    /// Monotonically increases on every successful renewal.
    pub expiry: u64,
}

/// DKIM signing material issued alongside a certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DkimKeys {
    pub private: PathBuf,
    pub public: PathBuf,
    pub selector: String,
}

/// Certificate descriptor attached to a website.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CertDescriptor {
    pub ssl: CertFiles,
    #[serde(default)]
    pub subject_alt_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dkim: Option<DkimKeys>,
}

/// One domain served by the proxy with its own backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Website {
    /// Document root holding the entrypoint and tenant files.
    pub root: PathBuf,
    /// Backend port, unique across all websites and services.
    pub port: u16,
    /// Pid of the running backend process, when started locally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Ordered subdomain labels; treated as a set.
    #[serde(default)]
    pub subdomains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertDescriptor>,
    #[serde(default)]
    pub status: RunStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Host/container port pair of a container app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortBinding {
    pub host: u16,
    pub container: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
}

/// Host/container mount pair of a container app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBinding {
    pub host: PathBuf,
    pub container: String,
}

/// Backend shape of a service. Scripts carry a source path, containers an
/// image with its bindings, so the per-type invariants hold by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type")]
pub enum ServiceBackend {
    Script {
        source: PathBuf,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pid: Option<u32>,
    },
    Container {
        image: String,
        #[serde(default)]
        ports: Vec<PortBinding>,
        #[serde(default)]
        volumes: Vec<VolumeBinding>,
        #[serde(default)]
        env: BTreeMap<String, String>,
    },
}

/// A user workload that is not a website.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub id: u64,
    pub name: String,
    #[serde(flatten)]
    pub backend: ServiceBackend,
    #[serde(default)]
    pub status: RunStatus,
    /// Whether the reconciler should keep this service running.
    #[serde(default)]
    pub active: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Sliding-window rate limit settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub window_ms: u64,
    pub max: u64,
    pub enabled: bool,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max: 300,
            enabled: true,
        }
    }
}

/// Firewall policy persisted in the `firewall` module and synced to the
/// proxy process on every change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallPolicy {
    pub enabled: bool,
    #[serde(default)]
    pub blacklist: Vec<String>,
    #[serde(default)]
    pub whitelist: Vec<String>,
    #[serde(default)]
    pub rate_limit: RateLimitPolicy,
    pub max_ws_per_ip: u32,
}

impl Default for FirewallPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            blacklist: Vec::new(),
            whitelist: Vec::new(),
            rate_limit: RateLimitPolicy::default(),
            max_ws_per_ip: 16,
        }
    }
}

/// Hub credential. The secret signs outbound hub messages (HMAC-SHA256).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct HubModule {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// The `server` module: daemon identity, control auth and adopted pids.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerModule {
    /// Control-channel token, regenerated on every daemon startup.
    #[serde(default)]
    pub auth: String,
    #[serde(default)]
    pub instance_id: String,
    /// Release channel: stable | latest | beta | dev | custom branch.
    pub channel: String,
    /// Remote addresses allowed on the control TCP listener besides loopback.
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_pid: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watchdog_pid: Option<u32>,
    #[serde(default)]
    pub next_service_id: u64,
}

impl Default for ServerModule {
    fn default() -> Self {
        Self {
            auth: String::new(),
            instance_id: String::new(),
            channel: "stable".to_string(),
            allowed_ips: Vec::new(),
            server_pid: None,
            watchdog_pid: None,
            next_service_id: 1,
        }
    }
}

/// The `web` module: every website keyed by domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct WebModule {
    #[serde(default)]
    pub websites: HashMap<String, Website>,
}

/// The `services` module: every service keyed by unique name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ServicesModule {
    #[serde(default)]
    pub services: HashMap<String, Service>,
}

/// The `ssl` module: issuer account plus the default server certificate the
/// proxy falls back to when a site has none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SslModule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_cert: Option<CertFiles>,
}

impl WebModule {
    /// Every backend port currently claimed by a website.
    pub fn used_ports(&self) -> std::collections::HashSet<u16> {
        self.websites.values().map(|w| w.port).collect()
    }
}

impl ServicesModule {
    /// Every host port claimed by a container service.
    pub fn used_ports(&self) -> std::collections::HashSet<u16> {
        self.services
            .values()
            .filter_map(|s| match &s.backend {
                ServiceBackend::Container { ports, .. } => {
                    Some(ports.iter().map(|p| p.host).collect::<Vec<_>>())
                }
                ServiceBackend::Script { .. } => None,
            })
            .flatten()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RunStatus::Errored).unwrap(),
            "\"errored\""
        );
    }

    #[test]
    fn service_backend_tags_by_type() {
        let svc = Service {
            id: 7,
            name: "worker".into(),
            backend: ServiceBackend::Script {
                source: PathBuf::from("/srv/worker/app.py"),
                pid: None,
            },
            status: RunStatus::Stopped,
            active: false,
            created_at: 0,
            updated_at: 0,
        };
        let json = serde_json::to_value(&svc).unwrap();
        assert_eq!(json["type"], "script");
        assert_eq!(json["source"], "/srv/worker/app.py");

        let back: Service = serde_json::from_value(json).unwrap();
        assert_eq!(back, svc);
    }

    #[test]
    fn used_ports_cover_both_kinds() {
        let mut web = WebModule::default();
        web.websites.insert(
            "example.com".into(),
            Website {
                root: PathBuf::from("/srv/example.com"),
                port: 10001,
                pid: None,
                subdomains: vec!["www".into()],
                cert: None,
                status: RunStatus::Stopped,
                created_at: 0,
                updated_at: 0,
            },
        );
        assert!(web.used_ports().contains(&10001));

        let mut services = ServicesModule::default();
        services.services.insert(
            "cache".into(),
            Service {
                id: 1,
                name: "cache".into(),
                backend: ServiceBackend::Container {
                    image: "redis:7-alpine".into(),
                    ports: vec![PortBinding {
                        host: 30000,
                        container: 6379,
                        ip: None,
                    }],
                    volumes: vec![],
                    env: BTreeMap::new(),
                },
                status: RunStatus::Stopped,
                active: false,
                created_at: 0,
                updated_at: 0,
            },
        );
        assert!(services.used_ports().contains(&30000));
    }
}
