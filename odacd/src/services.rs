//! # Service Supervisor
//!
//! Non-website workloads. Scripts run as local interpreter processes while
//! the container engine is down and as one-shot app containers when it is
//! up; container apps install from hub recipes with `auto` host ports and
//! generated secrets resolved at install time.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use odac_common::config::modules::{
    PortBinding, RunStatus, Service, ServiceBackend, VolumeBinding,
};
use odac_common::config::ConfigStore;
use odac_common::net;
use odac_common::paths::OdacPaths;
use odac_common::util::{epoch_ms, random_hex};

use crate::core::collaborators::{PortSpec, Recipe, RecipeEnv, RecipeSource};
use crate::engine::{AppSpec, Engine};
use crate::ipc::Progress;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Service {0} already exists.")]
    AlreadyExists(String),
    #[error("Service {0} not found.")]
    NotFound(String),
    #[error("Service {0} is already running.")]
    AlreadyRunning(String),
    #[error("No script interpreter for {0}.")]
    UnknownInterpreter(String),
    #[error("No free port at or above {0}.")]
    NoFreePort(u16),
    #[error("{0}")]
    Failed(String),
}

/// Script interpreters by extension.
const INTERPRETERS: &[(&str, &str, &[&str], &str)] = &[
    ("js", "node", &[], "node:20-alpine"),
    ("py", "python", &["-u"], "python:3.12-slim"),
    ("php", "php", &[], "php:8.3-cli"),
    ("rb", "ruby", &[], "ruby:3-alpine"),
    ("sh", "sh", &[], "alpine:3"),
];

fn interpreter_for(source: &Path) -> Option<(&'static str, &'static [&'static str], &'static str)> {
    let ext = source.extension()?.to_str()?;
    INTERPRETERS
        .iter()
        .find(|(e, ..)| *e == ext)
        .map(|(_, interpreter, args, image)| (*interpreter, *args, *image))
}

#[derive(Default)]
struct ServiceRuntime {
    child: Option<tokio::process::Child>,
}

pub struct ServiceSupervisor {
    paths: OdacPaths,
    config: Arc<ConfigStore>,
    engine: Arc<Engine>,
    recipes: Arc<dyn RecipeSource>,
    runtimes: tokio::sync::Mutex<HashMap<String, ServiceRuntime>>,
}

impl ServiceSupervisor {
    pub fn new(
        paths: OdacPaths,
        config: Arc<ConfigStore>,
        engine: Arc<Engine>,
        recipes: Arc<dyn RecipeSource>,
    ) -> Arc<Self> {
        Arc::new(Self {
            paths,
            config,
            engine,
            recipes,
            runtimes: tokio::sync::Mutex::new(HashMap::new()),
        })
    }

    async fn next_id(&self) -> u64 {
        self.config
            .server
            .mutate(|server| {
                let id = server.next_service_id;
                server.next_service_id += 1;
                id
            })
            .await
    }

    /// Register a script service pointing at an existing source file.
    pub async fn create_script(&self, name: &str, source: &Path) -> Result<String, ServiceError> {
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            return Err(ServiceError::Failed("service name required".into()));
        }
        let exists = self
            .config
            .services
            .read(|s| s.services.contains_key(&name))
            .await;
        if exists {
            return Err(ServiceError::AlreadyExists(name));
        }
        if !source.is_file() {
            return Err(ServiceError::Failed(format!(
                "source {} does not exist",
                source.display()
            )));
        }
        if interpreter_for(source).is_none() {
            return Err(ServiceError::UnknownInterpreter(
                source.display().to_string(),
            ));
        }

        let id = self.next_id().await;
        let now = epoch_ms();
        self.config
            .services
            .mutate(|services| {
                services.services.insert(
                    name.clone(),
                    Service {
                        id,
                        name: name.clone(),
                        backend: ServiceBackend::Script {
                            source: source.to_path_buf(),
                            pid: None,
                        },
                        status: RunStatus::Stopped,
                        active: false,
                        created_at: now,
                        updated_at: now,
                    },
                );
            })
            .await;
        Ok(format!("Service {name} created."))
    }

    /// Install a container app from a hub recipe: resolve `auto` ports to
    /// free ports at or above 30000, generate secret env values, provision
    /// volume directories, pull the image and register the service.
    pub async fn install(&self, recipe_name: &str, progress: &Progress) -> Result<String, ServiceError> {
        let recipe = self
            .recipes
            .fetch(recipe_name)
            .await
            .map_err(|e| ServiceError::Failed(e.to_string()))?;
        progress.emit("recipe", "ok", &format!("Recipe {} fetched", recipe.name));

        let name = recipe.name.trim().to_lowercase();
        let exists = self
            .config
            .services
            .read(|s| s.services.contains_key(&name))
            .await;
        if exists {
            return Err(ServiceError::AlreadyExists(name));
        }

        let mut used = self.config.web.read(|w| w.used_ports()).await;
        used.extend(self.config.services.read(|s| s.used_ports()).await);

        let mut ports = Vec::new();
        for port in &recipe.ports {
            let host = match &port.host {
                PortSpec::Fixed(host) => *host,
                spec if spec.is_auto() => {
                    let free = net::next_free_port_from(net::APP_PORT_FLOOR, &used)
                        .ok_or(ServiceError::NoFreePort(net::APP_PORT_FLOOR))?;
                    used.insert(free);
                    free
                }
                other => {
                    return Err(ServiceError::Failed(format!(
                        "unsupported host port spec {other:?}"
                    )))
                }
            };
            ports.push(PortBinding {
                host,
                container: port.container,
                ip: None,
            });
        }
        progress.emit("ports", "ok", &format!("{} port(s) bound", ports.len()));

        let mut env = BTreeMap::new();
        for (key, value) in &recipe.env {
            let resolved = match value {
                RecipeEnv::Literal(value) => value.clone(),
                RecipeEnv::Generated { generate, length } => {
                    if !generate {
                        String::new()
                    } else {
                        let mut hex = random_hex(length.div_ceil(2));
                        hex.truncate(*length);
                        hex
                    }
                }
            };
            env.insert(key.clone(), resolved);
        }

        let volumes = self
            .provision_volumes(&name, &recipe)
            .map_err(|e| ServiceError::Failed(e.to_string()))?;
        progress.emit("volumes", "ok", &format!("{} volume(s) ready", volumes.len()));

        if let Err(err) = self.engine.ensure_image(&recipe.image).await {
            log::warn!(target: "services", "Prefetching {} failed: {err}", recipe.image);
            progress.emit("image", "err", &err.to_string());
        } else {
            progress.emit("image", "ok", &format!("Image {} present", recipe.image));
        }

        let id = self.next_id().await;
        let now = epoch_ms();
        self.config
            .services
            .mutate(|services| {
                services.services.insert(
                    name.clone(),
                    Service {
                        id,
                        name: name.clone(),
                        backend: ServiceBackend::Container {
                            image: recipe.image.clone(),
                            ports,
                            volumes,
                            env,
                        },
                        status: RunStatus::Stopped,
                        active: false,
                        created_at: now,
                        updated_at: now,
                    },
                );
            })
            .await;

        Ok(format!("App {name} installed."))
    }

    fn provision_volumes(&self, name: &str, recipe: &Recipe) -> anyhow::Result<Vec<VolumeBinding>> {
        let base = self.paths.root().join("volumes").join(name);
        let mut volumes = Vec::new();
        for volume in &recipe.volumes {
            let host = if Path::new(&volume.host).is_absolute() {
                PathBuf::from(&volume.host)
            } else {
                base.join(&volume.host)
            };
            std::fs::create_dir_all(&host)?;
            volumes.push(VolumeBinding {
                host,
                container: volume.container.clone(),
            });
        }
        Ok(volumes)
    }

    /// Start a service. Container apps go through the engine; scripts run as
    /// one-shot containers when the engine is up, local processes otherwise.
    pub async fn start(&self, name: &str) -> Result<(), ServiceError> {
        let service = self
            .config
            .services
            .read(|s| s.services.get(name).cloned())
            .await
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        let mut runtimes = self.runtimes.lock().await;
        let runtime = runtimes.entry(name.to_string()).or_default();
        if service.active && service.status == RunStatus::Running {
            return Err(ServiceError::AlreadyRunning(name.to_string()));
        }

        let started_pid = match &service.backend {
            ServiceBackend::Container {
                image,
                ports,
                volumes,
                env,
            } => {
                if ports.is_empty() {
                    // Background apps without published ports live on the
                    // shared network with their data directory at /app.
                    let data_dir = self.paths.root().join("volumes").join(name);
                    std::fs::create_dir_all(&data_dir)
                        .map_err(|e| ServiceError::Failed(e.to_string()))?;
                    let extra_binds: Vec<String> = volumes
                        .iter()
                        .map(|v| {
                            format!("{}:{}", crate::engine::dood_path(&v.host), v.container)
                        })
                        .collect();
                    self.engine
                        .run(&app_container(name), image, &data_dir, &extra_binds, env)
                        .await
                        .map_err(|e| ServiceError::Failed(e.to_string()))?;
                } else {
                    self.engine
                        .run_app(
                            &app_container(name),
                            &AppSpec {
                                image: image.clone(),
                                ports: ports.clone(),
                                volumes: volumes.clone(),
                                env: env.clone(),
                                cmd: None,
                            },
                        )
                        .await
                        .map_err(|e| ServiceError::Failed(e.to_string()))?;
                }
                None
            }
            ServiceBackend::Script { source, .. } => {
                let (interpreter, args, image) = interpreter_for(source)
                    .ok_or_else(|| ServiceError::UnknownInterpreter(source.display().to_string()))?;
                let dir = source
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                let file = source
                    .file_name()
                    .map(|f| f.to_string_lossy().to_string())
                    .unwrap_or_default();

                if self.engine.available().await {
                    let mut cmd = vec![interpreter.to_string()];
                    cmd.extend(args.iter().map(|a| a.to_string()));
                    cmd.push(format!("/app/{file}"));
                    self.engine
                        .run_app(
                            &app_container(name),
                            &AppSpec {
                                image: image.to_string(),
                                ports: Vec::new(),
                                volumes: vec![VolumeBinding {
                                    host: dir,
                                    container: "/app".to_string(),
                                }],
                                env: BTreeMap::new(),
                                cmd: Some(cmd),
                            },
                        )
                        .await
                        .map_err(|e| ServiceError::Failed(e.to_string()))?;
                    None
                } else {
                    let child = tokio::process::Command::new(interpreter)
                        .args(args)
                        .arg(&file)
                        .current_dir(&dir)
                        .stdin(Stdio::null())
                        .stdout(Stdio::piped())
                        .stderr(Stdio::piped())
                        .spawn()
                        .map_err(|e| ServiceError::Failed(format!("spawning {interpreter}: {e}")))?;
                    let pid = child.id();
                    runtime.child = Some(child);
                    pid
                }
            }
        };
        drop(runtimes);

        self.config
            .services
            .mutate(|services| {
                if let Some(service) = services.services.get_mut(name) {
                    service.active = true;
                    service.status = RunStatus::Running;
                    service.updated_at = epoch_ms();
                    if let ServiceBackend::Script { pid, .. } = &mut service.backend {
                        *pid = started_pid;
                    }
                }
            })
            .await;
        log::info!(target: "services", "Service {name} started");
        Ok(())
    }

    pub async fn stop(&self, name: &str) -> Result<(), ServiceError> {
        let service = self
            .config
            .services
            .read(|s| s.services.get(name).cloned())
            .await
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        let local_child = {
            let mut runtimes = self.runtimes.lock().await;
            runtimes.entry(name.to_string()).or_default().child.take()
        };
        if let Some(mut child) = local_child {
            let _ = child.start_kill();
            let _ = tokio::time::timeout(Duration::from_secs(5), child.wait()).await;
        }
        match &service.backend {
            ServiceBackend::Container { .. } => {
                let _ = self.engine.stop(&app_container(name)).await;
            }
            ServiceBackend::Script { pid: Some(pid), .. } => {
                crate::process::stop(*pid, "");
                let _ = self.engine.stop(&app_container(name)).await;
            }
            ServiceBackend::Script { .. } => {
                let _ = self.engine.stop(&app_container(name)).await;
            }
        }

        self.config
            .services
            .mutate(|services| {
                if let Some(service) = services.services.get_mut(name) {
                    service.active = false;
                    service.status = RunStatus::Stopped;
                    service.updated_at = epoch_ms();
                    if let ServiceBackend::Script { pid, .. } = &mut service.backend {
                        *pid = None;
                    }
                }
            })
            .await;
        Ok(())
    }

    pub async fn delete(&self, name: &str) -> Result<String, ServiceError> {
        self.stop(name).await?;
        let _ = self.engine.remove(&app_container(name)).await;
        self.runtimes.lock().await.remove(name);
        self.config
            .services
            .mutate(|services| {
                services.services.remove(name);
            })
            .await;
        Ok(format!("Service {name} deleted."))
    }

    /// Reconcile active services: restart dead containers; a script whose
    /// local process exited is marked stopped and left alone until
    /// explicitly re-activated.
    pub async fn check(&self) {
        let services: Vec<Service> = self
            .config
            .services
            .read(|s| s.services.values().cloned().collect())
            .await;

        for service in services {
            if !service.active || matches!(service.status, RunStatus::Stopped | RunStatus::Errored)
            {
                continue;
            }

            match &service.backend {
                ServiceBackend::Container { .. } => {
                    if !self.engine.is_running(&app_container(&service.name)).await {
                        log::warn!(
                            target: "services",
                            "Service {} is down; restarting",
                            service.name
                        );
                        if let Err(err) = self.start(&service.name).await {
                            log::debug!(
                                target: "services",
                                "Restart of {} failed: {err}",
                                service.name
                            );
                        }
                    }
                }
                ServiceBackend::Script { pid, .. } => {
                    let local_exit = {
                        let mut runtimes = self.runtimes.lock().await;
                        match runtimes.entry(service.name.clone()).or_default().child.as_mut() {
                            Some(child) => child.try_wait().ok().flatten().is_some(),
                            None => match pid {
                                Some(pid) => !crate::process::alive(*pid),
                                // Engine-backed one-shot script.
                                None => !self.engine.is_running(&app_container(&service.name)).await,
                            },
                        }
                    };
                    if local_exit {
                        log::info!(
                            target: "services",
                            "Script service {} exited; marking stopped",
                            service.name
                        );
                        self.config
                            .services
                            .mutate(|services| {
                                if let Some(service) = services.services.get_mut(&service.name) {
                                    service.active = false;
                                    service.status = RunStatus::Stopped;
                                    service.updated_at = epoch_ms();
                                    if let ServiceBackend::Script { pid, .. } = &mut service.backend
                                    {
                                        *pid = None;
                                    }
                                }
                            })
                            .await;
                    }
                }
            }
        }
    }

    pub async fn stop_all(&self) {
        let names: Vec<String> = self
            .config
            .services
            .read(|s| s.services.keys().cloned().collect())
            .await;
        for name in names {
            let _ = self.stop(&name).await;
        }
    }

    /// Run a one-off command for a service: attach-exec inside a running
    /// container, or an ephemeral shell over a script's directory.
    pub async fn exec(&self, name: &str, command: &str) -> Result<String, ServiceError> {
        let service = self
            .config
            .services
            .read(|s| s.services.get(name).cloned())
            .await
            .ok_or_else(|| ServiceError::NotFound(name.to_string()))?;

        match &service.backend {
            ServiceBackend::Container { .. } => self
                .engine
                .exec_in_container(&app_container(name), command)
                .await
                .map_err(|e| ServiceError::Failed(e.to_string())),
            ServiceBackend::Script { source, .. } => {
                let dir = source
                    .parent()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| PathBuf::from("."));
                let (code, output) = self
                    .engine
                    .exec(&dir, command, &[])
                    .await
                    .map_err(|e| ServiceError::Failed(e.to_string()))?;
                if code != 0 {
                    return Err(ServiceError::Failed(format!(
                        "command exited with {code}: {}",
                        output.trim()
                    )));
                }
                Ok(output)
            }
        }
    }

    /// Tail of a service's container logs (`service.logs`).
    pub async fn logs(&self, name: &str, tail: usize) -> Result<String, ServiceError> {
        let known = self
            .config
            .services
            .read(|s| s.services.contains_key(name))
            .await;
        if !known {
            return Err(ServiceError::NotFound(name.to_string()));
        }
        self.engine
            .logs(&app_container(name), tail)
            .await
            .map_err(|e| ServiceError::Failed(e.to_string()))
    }

    /// Summaries for `service.list`, with container addresses where known.
    pub async fn list(&self) -> Vec<serde_json::Value> {
        let services: Vec<Service> = self
            .config
            .services
            .read(|s| s.services.values().cloned().collect())
            .await;

        let mut out = Vec::with_capacity(services.len());
        for service in services {
            let (kind, ip) = match &service.backend {
                ServiceBackend::Script { .. } => ("script", None),
                ServiceBackend::Container { .. } => (
                    "container",
                    self.engine.get_ip(&app_container(&service.name)).await,
                ),
            };
            out.push(serde_json::json!({
                "id": service.id,
                "name": service.name,
                "type": kind,
                "status": service.status,
                "active": service.active,
                "ip": ip,
            }));
        }
        out
    }
}

fn app_container(name: &str) -> String {
    format!("odac-app-{name}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{CollaboratorError, RecipePort, RecipeVolume};
    use crate::ipc::Progress;

    /// Recipe source that always serves one fixed recipe.
    struct FixedRecipes(Recipe);

    #[async_trait::async_trait]
    impl RecipeSource for FixedRecipes {
        async fn fetch(&self, _name: &str) -> Result<Recipe, CollaboratorError> {
            Ok(self.0.clone())
        }
    }

    fn forum_recipe() -> Recipe {
        Recipe {
            name: "forum".into(),
            image: "registry.invalid/forum:1".into(),
            ports: vec![
                RecipePort {
                    host: PortSpec::Named("auto".into()),
                    container: 8080,
                },
                RecipePort {
                    host: PortSpec::Fixed(30500),
                    container: 9090,
                },
            ],
            volumes: vec![RecipeVolume {
                host: "data".into(),
                container: "/data".into(),
            }],
            env: [
                (
                    "SESSION_KEY".to_string(),
                    RecipeEnv::Generated {
                        generate: true,
                        length: 24,
                    },
                ),
                ("MODE".to_string(), RecipeEnv::Literal("production".into())),
            ]
            .into_iter()
            .collect(),
            cmd: None,
        }
    }

    async fn supervisor(root: &Path, recipe: Recipe) -> Arc<ServiceSupervisor> {
        let paths = OdacPaths::rooted(root);
        paths.ensure_layout().unwrap();
        let config = Arc::new(
            odac_common::config::ConfigStore::load(&paths.config_dir()).unwrap(),
        );
        let engine = Arc::new(Engine::new());
        ServiceSupervisor::new(paths, config, engine, Arc::new(FixedRecipes(recipe)))
    }

    #[tokio::test]
    async fn install_resolves_ports_secrets_and_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), forum_recipe()).await;
        let progress = Progress::discard();

        let message = sup.install("forum", &progress).await.unwrap();
        assert_eq!(message, "App forum installed.");

        let service = sup
            .config
            .services
            .read(|s| s.services.get("forum").cloned())
            .await
            .expect("registered");
        assert_eq!(service.id, 1);

        let ServiceBackend::Container {
            ports,
            volumes,
            env,
            ..
        } = &service.backend
        else {
            panic!("expected a container backend");
        };

        // `auto` resolved at or above the app floor; fixed ports kept.
        assert!(ports[0].host >= net::APP_PORT_FLOOR);
        assert_eq!(ports[0].container, 8080);
        assert_eq!(ports[1].host, 30500);

        // Generated secrets have the requested length; literals pass through.
        assert_eq!(env["SESSION_KEY"].len(), 24);
        assert!(env["SESSION_KEY"].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(env["MODE"], "production");

        // Relative volume hosts land under the service's data directory.
        assert!(volumes[0].host.ends_with("volumes/forum/data"));
        assert!(volumes[0].host.is_dir());

        let err = sup.install("forum", &progress).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn create_script_validates_source_and_interpreter() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), forum_recipe()).await;

        let missing = sup
            .create_script("worker", Path::new("/definitely/not/here.py"))
            .await
            .unwrap_err();
        assert!(matches!(missing, ServiceError::Failed(_)));

        let binary = dir.path().join("worker.bin");
        std::fs::write(&binary, b"").unwrap();
        let unknown = sup.create_script("worker", &binary).await.unwrap_err();
        assert!(matches!(unknown, ServiceError::UnknownInterpreter(_)));

        let script = dir.path().join("worker.py");
        std::fs::write(&script, b"print('hi')").unwrap();
        sup.create_script("worker", &script).await.unwrap();
        let err = sup.create_script("Worker", &script).await.unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyExists(_)));

        let listed = sup.list().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["type"], "script");
    }

    #[tokio::test]
    async fn exited_local_script_is_marked_stopped_and_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(dir.path(), forum_recipe()).await;
        // Local-process branch only; with a live engine scripts run as
        // one-shot containers instead.
        if sup.engine.available().await {
            return;
        }

        let script = dir.path().join("oneshot.sh");
        std::fs::write(&script, b"true\n").unwrap();
        sup.create_script("oneshot", &script).await.unwrap();
        sup.start("oneshot").await.unwrap();

        // Give the short-lived process time to exit, then reconcile.
        tokio::time::sleep(Duration::from_millis(300)).await;
        sup.check().await;

        let service = sup
            .config
            .services
            .read(|s| s.services.get("oneshot").cloned())
            .await
            .unwrap();
        assert!(!service.active);
        assert_eq!(service.status, RunStatus::Stopped);
        assert!(matches!(
            service.backend,
            ServiceBackend::Script { pid: None, .. }
        ));
    }

    #[test]
    fn interpreters_map_by_extension() {
        let (node, _, _) = interpreter_for(Path::new("/srv/app/index.js")).unwrap();
        assert_eq!(node, "node");
        let (python, args, _) = interpreter_for(Path::new("/srv/app/worker.py")).unwrap();
        assert_eq!(python, "python");
        assert_eq!(args, ["-u"].as_slice());
        assert!(interpreter_for(Path::new("/srv/app/prog.exe")).is_none());
        assert!(interpreter_for(Path::new("/srv/app/noext")).is_none());
    }

    #[test]
    fn app_container_names_carry_the_prefix() {
        assert_eq!(app_container("forum"), "odac-app-forum");
    }
}
