//! Interfaces to the external collaborators the core consumes.
//!
//! The ACME driver, authoritative DNS server, mail plane and hub are
//! separate subsystems; the core only depends on the traits below and
//! receives concrete handles by injection. Disabled implementations keep the
//! daemon fully operational when a driver is not wired in.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use odac_common::config::modules::CertDescriptor;
use odac_common::util::sign_message;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator is not configured; callers surface the message as-is.
    #[error("{0}")]
    Disabled(&'static str),
    #[error("{0}")]
    Failed(String),
}

/// Installs and removes the DNS record set of a domain
/// (A, AAAA when available, CNAME `www`, MX, SPF TXT, DMARC TXT).
#[async_trait]
pub trait DnsRecorder: Send + Sync {
    async fn install_records(&self, domain: &str) -> Result<(), CollaboratorError>;
    async fn remove_records(&self, domain: &str) -> Result<(), CollaboratorError>;
}

/// Drives certificate issuance and renewal.
///
/// `renew` observes the cancellation token: when a newer renewal request for
/// the same domain supersedes this one, the token fires and the result is
/// discarded by the caller.
#[async_trait]
pub trait CertIssuer: Send + Sync {
    async fn renew(
        &self,
        domain: &str,
        cancel: CancellationToken,
    ) -> Result<Option<CertDescriptor>, CollaboratorError>;

    /// Periodic expiry sweep, driven by the reconcile tick.
    async fn tick(&self) {}
}

/// Sends mail through the platform mail plane (`mail.send`).
#[async_trait]
pub trait MailPlane: Send + Sync {
    async fn send(
        &self,
        from: &str,
        to: &str,
        subject: &str,
        body: &str,
    ) -> Result<(), CollaboratorError>;
}

/// Port side of a recipe: a fixed host port or `"auto"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PortSpec {
    Fixed(u16),
    Named(String),
}

impl PortSpec {
    pub fn is_auto(&self) -> bool {
        matches!(self, PortSpec::Named(s) if s == "auto")
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipePort {
    pub host: PortSpec,
    pub container: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecipeVolume {
    /// Absolute host path, or a bare directory name resolved under the
    /// service's data directory.
    pub host: String,
    pub container: String,
}

/// Environment value of a recipe: a literal, or generated random hex.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RecipeEnv {
    Generated { generate: bool, length: usize },
    Literal(String),
}

/// Declarative description of an installable app, fetched by name.
#[derive(Debug, Clone, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub image: String,
    #[serde(default)]
    pub ports: Vec<RecipePort>,
    #[serde(default)]
    pub volumes: Vec<RecipeVolume>,
    #[serde(default)]
    pub env: BTreeMap<String, RecipeEnv>,
    #[serde(default)]
    pub cmd: Option<Vec<String>>,
}

/// Fetches recipes from the remote control plane.
#[async_trait]
pub trait RecipeSource: Send + Sync {
    async fn fetch(&self, name: &str) -> Result<Recipe, CollaboratorError>;
}

/// DNS recorder used when no authoritative DNS driver is wired in.
pub struct DisabledDns;

#[async_trait]
impl DnsRecorder for DisabledDns {
    async fn install_records(&self, domain: &str) -> Result<(), CollaboratorError> {
        log::debug!(target: "dns", "DNS driver disabled; skipping records for {domain}");
        Ok(())
    }

    async fn remove_records(&self, domain: &str) -> Result<(), CollaboratorError> {
        log::debug!(target: "dns", "DNS driver disabled; skipping teardown for {domain}");
        Ok(())
    }
}

/// Issuer used when no ACME driver is wired in; websites then stay on the
/// default server certificate.
pub struct DisabledIssuer;

#[async_trait]
impl CertIssuer for DisabledIssuer {
    async fn renew(
        &self,
        domain: &str,
        _cancel: CancellationToken,
    ) -> Result<Option<CertDescriptor>, CollaboratorError> {
        log::debug!(target: "ssl", "SSL driver disabled; {domain} keeps the default certificate");
        Ok(None)
    }
}

/// Mail plane used when the mail subsystem is not running.
pub struct DisabledMail;

#[async_trait]
impl MailPlane for DisabledMail {
    async fn send(
        &self,
        _from: &str,
        _to: &str,
        _subject: &str,
        _body: &str,
    ) -> Result<(), CollaboratorError> {
        Err(CollaboratorError::Disabled("mail_unavailable"))
    }
}

/// Recipe source backed by the hub HTTP API. Requests carry the hub token
/// and an HMAC-SHA256 signature of the requested path.
pub struct HubRecipes {
    http: reqwest::Client,
    endpoint: Option<String>,
    token: String,
    secret: String,
}

impl HubRecipes {
    pub fn new(endpoint: Option<String>, token: String, secret: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint,
            token,
            secret,
        }
    }
}

#[async_trait]
impl RecipeSource for HubRecipes {
    async fn fetch(&self, name: &str) -> Result<Recipe, CollaboratorError> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or(CollaboratorError::Disabled("hub_not_linked"))?;
        let path = format!("/recipes/{name}");
        let url = format!("{}{path}", endpoint.trim_end_matches('/'));

        let response = self
            .http
            .get(&url)
            .header("x-odac-token", &self.token)
            .header("x-odac-signature", sign_message(&self.secret, &path))
            .send()
            .await
            .map_err(|e| CollaboratorError::Failed(format!("hub request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::Failed(format!(
                "hub returned {} for recipe '{name}'",
                response.status()
            )));
        }
        response
            .json::<Recipe>()
            .await
            .map_err(|e| CollaboratorError::Failed(format!("invalid recipe payload: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipe_ports_parse_auto_and_fixed() {
        let recipe: Recipe = serde_json::from_str(
            r#"{
                "name": "forum",
                "image": "ghcr.io/acme/forum:1",
                "ports": [
                    {"host": "auto", "container": 8080},
                    {"host": 30080, "container": 9090}
                ],
                "env": {
                    "SESSION_KEY": {"generate": true, "length": 24},
                    "MODE": "production"
                }
            }"#,
        )
        .expect("recipe parses");

        assert!(recipe.ports[0].host.is_auto());
        assert_eq!(recipe.ports[1].host, PortSpec::Fixed(30080));
        assert!(matches!(
            recipe.env["SESSION_KEY"],
            RecipeEnv::Generated { length: 24, .. }
        ));
        assert!(matches!(recipe.env["MODE"], RecipeEnv::Literal(_)));
    }
}
