//! # Configuration Store
//!
//! A single logical configuration tree persisted as independent module files
//! (`server.json`, `web.json`, `services.json`, `hub.json`, `firewall.json`,
//! `ssl.json`). Mutations mark the owning module dirty; a periodic flusher
//! writes dirty modules atomically so readers always observe either the
//! pre-write or the post-write file.
//!
//! Write protocol per module: serialize to `<name>.json.tmp`, copy the
//! current `<name>.json` to `<name>.json.bak`, rename the tmp file over the
//! final name. On load, a module that fails to parse is preserved as
//! `<name>.json.corrupted` and the `.bak` is promoted in its place.

pub mod modules;

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use modules::{
    FirewallPolicy, HubModule, ServerModule, ServicesModule, SslModule, WebModule,
};

/// How often the background flusher visits the dirty set.
const FLUSH_INTERVAL: Duration = Duration::from_millis(500);

/// Failures of the configuration store.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing config module '{0}': {1}")]
    Serialize(&'static str, #[source] serde_json::Error),
    #[error("unknown config module '{0}'")]
    UnknownModule(String),
}

fn io_err(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Names of modules that have unflushed mutations.
#[derive(Default)]
struct DirtyTracker(std::sync::Mutex<HashSet<&'static str>>);

impl DirtyTracker {
    fn mark(&self, name: &'static str) {
        self.0.lock().expect("dirty set poisoned").insert(name);
    }

    fn take(&self) -> Vec<&'static str> {
        self.0
            .lock()
            .expect("dirty set poisoned")
            .drain()
            .collect()
    }
}

/// One persisted configuration module.
///
/// `read` gives shared access; `mutate` gives exclusive access and marks the
/// module dirty, which is the only path to a disk write.
pub struct Module<T> {
    name: &'static str,
    value: RwLock<T>,
    dirty: Arc<DirtyTracker>,
}

impl<T: Serialize + DeserializeOwned + Default> Module<T> {
    fn load(dir: &Path, name: &'static str, dirty: Arc<DirtyTracker>) -> Result<Self, ConfigError> {
        let (value, needs_write) = load_module_file::<T>(dir, name)?;
        if needs_write {
            dirty.mark(name);
        }
        Ok(Self {
            name,
            value: RwLock::new(value),
            dirty,
        })
    }

    pub async fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        let guard = self.value.read().await;
        f(&guard)
    }

    pub async fn mutate<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.write().await;
        let out = f(&mut guard);
        self.dirty.mark(self.name);
        out
    }

    async fn snapshot_json(&self) -> Result<String, ConfigError> {
        let guard = self.value.read().await;
        serde_json::to_string_pretty(&*guard).map_err(|e| ConfigError::Serialize(self.name, e))
    }
}

/// The durable configuration store: one [`Module`] per named file.
pub struct ConfigStore {
    dir: PathBuf,
    dirty: Arc<DirtyTracker>,
    pub server: Module<ServerModule>,
    pub web: Module<WebModule>,
    pub services: Module<ServicesModule>,
    pub hub: Module<HubModule>,
    pub firewall: Module<FirewallPolicy>,
    pub ssl: Module<SslModule>,
}

impl ConfigStore {
    /// Load every module from `dir`, promoting backups over corrupt files.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
        let dirty = Arc::new(DirtyTracker::default());
        Ok(Self {
            dir: dir.to_path_buf(),
            server: Module::load(dir, "server", dirty.clone())?,
            web: Module::load(dir, "web", dirty.clone())?,
            services: Module::load(dir, "services", dirty.clone())?,
            hub: Module::load(dir, "hub", dirty.clone())?,
            firewall: Module::load(dir, "firewall", dirty.clone())?,
            ssl: Module::load(dir, "ssl", dirty.clone())?,
            dirty,
        })
    }

    /// Write every dirty module. A module that fails stays dirty and the
    /// first error is reported after all modules were attempted.
    pub async fn flush_dirty(&self) -> Result<(), ConfigError> {
        let mut first_err = None;
        for name in self.dirty.take() {
            let json = match name {
                "server" => self.server.snapshot_json().await,
                "web" => self.web.snapshot_json().await,
                "services" => self.services.snapshot_json().await,
                "hub" => self.hub.snapshot_json().await,
                "firewall" => self.firewall.snapshot_json().await,
                "ssl" => self.ssl.snapshot_json().await,
                other => Err(ConfigError::UnknownModule(other.to_string())),
            };
            let result = json.and_then(|body| write_module_atomic(&self.dir, name, &body));
            if let Err(err) = result {
                log::error!(target: "config", "Flushing module '{name}' failed: {err}");
                self.dirty.mark(name);
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Flush immediately; used before handover and during shutdown.
    pub async fn force(&self) -> Result<(), ConfigError> {
        self.flush_dirty().await
    }

    /// Spawn the periodic flusher. It performs one final flush when the
    /// shutdown token fires.
    pub fn spawn_flusher(self: &Arc<Self>, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(FLUSH_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(err) = store.force().await {
                            log::error!(target: "config", "Final config flush failed: {err}");
                        }
                        break;
                    }
                    _ = tick.tick() => {
                        let _ = store.flush_dirty().await;
                    }
                }
            }
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn module_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.json"))
}

/// Read one module file, falling back to the `.bak` when the primary is
/// corrupt. Returns the value plus whether it should be written back out
/// (fresh defaults and promoted backups are re-persisted on the next flush).
fn load_module_file<T: DeserializeOwned + Default>(
    dir: &Path,
    name: &str,
) -> Result<(T, bool), ConfigError> {
    let path = module_path(dir, name);
    let bak = dir.join(format!("{name}.json.bak"));

    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Ok((T::default(), true));
        }
        Err(err) => return Err(io_err(&path, err)),
    };

    match serde_json::from_str::<T>(&raw) {
        Ok(value) => Ok((value, false)),
        Err(parse_err) => {
            // Keep the corrupt file for inspection, then try the backup.
            let corrupted = dir.join(format!("{name}.json.corrupted"));
            if let Err(err) = std::fs::rename(&path, &corrupted) {
                log::warn!(target: "config", "Could not set aside corrupt '{name}': {err}");
            }
            log::warn!(
                target: "config",
                "Config module '{name}' is corrupt ({parse_err}); promoting backup"
            );
            match std::fs::read_to_string(&bak)
                .ok()
                .and_then(|raw| serde_json::from_str::<T>(&raw).ok())
            {
                Some(value) => Ok((value, true)),
                None => {
                    log::warn!(
                        target: "config",
                        "No usable backup for '{name}'; starting from defaults"
                    );
                    Ok((T::default(), true))
                }
            }
        }
    }
}

/// The atomic write sequence: `old -> old+tmp -> old+bak -> new`. A crash at
/// any point leaves either a valid `<name>.json` or a recoverable `.bak`.
fn write_module_atomic(dir: &Path, name: &str, body: &str) -> Result<(), ConfigError> {
    let path = module_path(dir, name);
    let tmp = dir.join(format!("{name}.json.tmp"));
    let bak = dir.join(format!("{name}.json.bak"));

    std::fs::write(&tmp, body).map_err(|e| io_err(&tmp, e))?;
    if path.exists() {
        std::fs::copy(&path, &bak).map_err(|e| io_err(&path, e))?;
    }
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&tmp, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::modules::{RunStatus, Website};

    fn store(dir: &Path) -> Arc<ConfigStore> {
        Arc::new(ConfigStore::load(dir).expect("load store"))
    }

    #[tokio::test]
    async fn flush_writes_dirty_modules_with_backup() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());

        store
            .server
            .mutate(|s| s.auth = "aa".repeat(32))
            .await;
        store.flush_dirty().await.unwrap();
        let first = std::fs::read_to_string(tmp.path().join("server.json")).unwrap();
        assert!(first.contains(&"aa".repeat(32)));

        store
            .server
            .mutate(|s| s.auth = "bb".repeat(32))
            .await;
        store.flush_dirty().await.unwrap();

        // The previous generation survives as the backup.
        let bak = std::fs::read_to_string(tmp.path().join("server.json.bak")).unwrap();
        assert!(bak.contains(&"aa".repeat(32)));
        let now = std::fs::read_to_string(tmp.path().join("server.json")).unwrap();
        assert!(now.contains(&"bb".repeat(32)));
        assert!(!tmp.path().join("server.json.tmp").exists());
    }

    #[tokio::test]
    async fn clean_modules_are_not_rewritten() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.flush_dirty().await.unwrap();

        let path = tmp.path().join("web.json");
        let before = std::fs::metadata(&path).unwrap().modified().unwrap();
        store.web.read(|w| w.websites.len()).await;
        std::fs::write(path.with_extension("marker"), b"x").unwrap();
        store.flush_dirty().await.unwrap();
        let after = std::fs::metadata(&path).unwrap().modified().unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn corrupt_module_promotes_backup() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = store(tmp.path());
            store
                .web
                .mutate(|w| {
                    w.websites.insert(
                        "example.com".into(),
                        Website {
                            root: tmp.path().join("example.com"),
                            port: 10001,
                            pid: None,
                            subdomains: vec![],
                            cert: None,
                            status: RunStatus::Stopped,
                            created_at: 1,
                            updated_at: 1,
                        },
                    );
                })
                .await;
            store.force().await.unwrap();
            // Second write so a .bak with the website exists.
            store.web.mutate(|_| ()).await;
            store.force().await.unwrap();
        }

        std::fs::write(tmp.path().join("web.json"), b"{ not json").unwrap();

        let reopened = store(tmp.path());
        let known = reopened
            .web
            .read(|w| w.websites.contains_key("example.com"))
            .await;
        assert!(known, "backup should have been promoted");
        assert!(tmp.path().join("web.json.corrupted").exists());
    }

    #[tokio::test]
    async fn background_flusher_persists_and_final_flushes_on_cancel() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        let shutdown = CancellationToken::new();
        let flusher = store.spawn_flusher(shutdown.clone());

        store
            .server
            .mutate(|s| s.auth = "cc".repeat(32))
            .await;
        tokio::time::sleep(Duration::from_millis(800)).await;
        let on_disk = std::fs::read_to_string(tmp.path().join("server.json")).unwrap();
        assert!(on_disk.contains(&"cc".repeat(32)), "periodic flush ran");

        // A mutation racing shutdown still lands via the final flush.
        store
            .server
            .mutate(|s| s.auth = "dd".repeat(32))
            .await;
        shutdown.cancel();
        flusher.await.unwrap();
        let on_disk = std::fs::read_to_string(tmp.path().join("server.json")).unwrap();
        assert!(on_disk.contains(&"dd".repeat(32)), "final flush ran");
    }

    #[tokio::test]
    async fn create_then_delete_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = store(tmp.path());
        store.force().await.unwrap();
        let baseline = std::fs::read_to_string(tmp.path().join("web.json")).unwrap();

        store
            .web
            .mutate(|w| {
                w.websites.insert(
                    "demo.test".into(),
                    Website {
                        root: tmp.path().join("demo.test"),
                        port: 10002,
                        pid: None,
                        subdomains: vec!["www".into()],
                        cert: None,
                        status: RunStatus::Stopped,
                        created_at: 2,
                        updated_at: 2,
                    },
                );
            })
            .await;
        store.force().await.unwrap();

        store
            .web
            .mutate(|w| {
                w.websites.remove("demo.test");
            })
            .await;
        store.force().await.unwrap();

        let final_state = std::fs::read_to_string(tmp.path().join("web.json")).unwrap();
        assert_eq!(baseline, final_state);
    }
}
