//! # Self-Updater
//!
//! Zero-downtime upgrade of the daemon container. On Linux the running
//! instance spawns its successor as a sibling container and supervises a
//! socket handshake; the successor takes over the primary container name,
//! proves itself through a stability window, and the old instance
//! self-destructs. Any premature socket close or illegal message before the
//! takeover commits triggers a rollback. Other platforms get a simpler
//! container swap driven by a helper container.
//!
//! Handshake over `ODAC_UPDATE_SOCKET_PATH` (ASCII lines):
//!
//! ```text
//! new -> old: HANDSHAKE_READY
//! old -> new: HANDSHAKE_ACK        (new renames odac -> odac-backup,
//!                                   odac-update -> odac, brings up services)
//! new -> old: TAKEOVER_COMPLETE    (after a 15 s stability window)
//! old -> new: HANDOVER_COMPLETE    (old stopped everything; exits 0)
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use bollard::models::RestartPolicyNameEnum;

use odac_common::paths::OdacPaths;
use odac_common::util::epoch_ms;

use crate::core::Core;
use crate::engine::Engine;
use crate::ipc::Progress;

pub const PRIMARY_CONTAINER: &str = "odac";
pub const UPDATE_CONTAINER: &str = "odac-update";
pub const BACKUP_CONTAINER: &str = "odac-backup";
pub const RELEASE_IMAGE: &str = "odacrun/odac:latest";
pub const SOURCE_REPO: &str = "https://github.com/odacrun/odac.git";

const MSG_READY: &str = "HANDSHAKE_READY";
const MSG_ACK: &str = "HANDSHAKE_ACK";
const MSG_TAKEOVER: &str = "TAKEOVER_COMPLETE";
const MSG_HANDOVER: &str = "HANDOVER_COMPLETE";

/// Per-connection deadline for each handshake step.
const STEP_DEADLINE: Duration = Duration::from_secs(60);
/// The whole handover must finish inside this window.
const OUTER_DEADLINE: Duration = Duration::from_secs(300);
/// How long the new instance must stay up before committing.
const STABILITY_WINDOW: Duration = Duration::from_secs(15);
/// Delay before the new instance deletes its predecessor's run files.
const GC_DELAY: Duration = Duration::from_secs(60);

fn update_socket_path() -> PathBuf {
    match std::env::var("ODAC_UPDATE_SOCKET_PATH") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => PathBuf::from("/app/storage/run/update.sock"),
    }
}

/// States of the Linux handover, old-instance perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdatePhase {
    Idle,
    Checking,
    Building,
    Spawning,
    AwaitingReady,
    AckSent,
    StabilityWindow,
    HandoverCommitted,
    SelfDestruct,
    RollbackReady,
    RolledBack,
}

/// The transient record of one in-flight update.
#[derive(Debug, Clone)]
pub struct UpdateSession {
    pub previous_instance_id: String,
    pub new_instance_id: String,
    pub socket_path: PathBuf,
    pub phase: UpdatePhase,
    pub started_at: u64,
}

async fn set_phase(core: &Core, phase: UpdatePhase) {
    let mut slot = core.update.lock().await;
    if let Some(session) = slot.as_mut() {
        log::info!(target: "update", "Phase {:?} -> {:?}", session.phase, phase);
        session.phase = phase;
    }
}

/// Errors that must roll the handover back.
#[derive(Debug)]
enum HandshakeFailure {
    Closed,
    Illegal(String),
    Timeout,
}

impl std::fmt::Display for HandshakeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HandshakeFailure::Closed => write!(f, "socket closed"),
            HandshakeFailure::Illegal(line) => write!(f, "illegal message '{line}'"),
            HandshakeFailure::Timeout => write!(f, "deadline exceeded"),
        }
    }
}

async fn read_message<R: AsyncBufReadExt + Unpin>(
    reader: &mut R,
    expected: &str,
) -> std::result::Result<(), HandshakeFailure> {
    let mut line = String::new();
    let read = tokio::time::timeout(STEP_DEADLINE, reader.read_line(&mut line))
        .await
        .map_err(|_| HandshakeFailure::Timeout)?
        .map_err(|_| HandshakeFailure::Closed)?;
    if read == 0 {
        return Err(HandshakeFailure::Closed);
    }
    let line = line.trim();
    if line != expected {
        return Err(HandshakeFailure::Illegal(line.to_string()));
    }
    Ok(())
}

/// Entry point of the `server.update` action.
pub async fn run_update(core: Arc<Core>, progress: Progress) -> Result<Value> {
    if !core.engine.available().await {
        anyhow::bail!("container engine unavailable");
    }
    {
        let mut slot = core.update.lock().await;
        if slot.is_some() {
            anyhow::bail!("an update is already in progress");
        }
        let previous = core.config.server.read(|s| s.instance_id.clone()).await;
        *slot = Some(UpdateSession {
            previous_instance_id: previous,
            new_instance_id: uuid::Uuid::new_v4().to_string(),
            socket_path: update_socket_path(),
            phase: UpdatePhase::Idle,
            started_at: epoch_ms(),
        });
    }

    let result = drive_update(&core, &progress).await;
    if result.is_err() {
        core.update.lock().await.take();
    }
    result
}

async fn drive_update(core: &Arc<Core>, progress: &Progress) -> Result<Value> {
    set_phase(core, UpdatePhase::Checking).await;
    let channel = core.config.server.read(|s| s.channel.clone()).await;

    let from_source = !matches!(channel.as_str(), "stable" | "latest");
    if from_source {
        // beta/dev (and custom branches) always rebuild from source.
        set_phase(core, UpdatePhase::Building).await;
        progress.emit("update", "info", &format!("Building {channel} from source"));
        let checkout = core.paths.root().join("build").join(&channel);
        let _ = std::fs::remove_dir_all(&checkout);
        core.engine
            .clone_repo(SOURCE_REPO, &channel, &checkout, None)
            .await
            .context("cloning source")?;
        core.engine
            .build(&checkout, RELEASE_IMAGE)
            .await
            .context("building image from source")?;
    } else {
        let current = current_image_digest(&core.engine).await;
        progress.emit("update", "info", "Pulling release image");
        core.engine
            .ensure_image(RELEASE_IMAGE)
            .await
            .context("pulling release image")?;
        let fresh = image_digest(&core.engine, RELEASE_IMAGE).await;
        if current.is_some() && current == fresh {
            core.update.lock().await.take();
            return Ok(Value::from("Already up to date."));
        }
    }

    if cfg!(target_os = "linux") {
        linux_handover(core, progress).await
    } else {
        portable_swap(core, progress).await
    }
}

/// Image digest of the running primary container.
async fn current_image_digest(engine: &Engine) -> Option<String> {
    let docker = engine_docker(engine)?;
    let inspect = docker
        .inspect_container(PRIMARY_CONTAINER, None::<bollard::container::InspectContainerOptions>)
        .await
        .ok()?;
    inspect.image
}

async fn image_digest(engine: &Engine, image: &str) -> Option<String> {
    let docker = engine_docker(engine)?;
    docker.inspect_image(image).await.ok().and_then(|i| i.id)
}

fn engine_docker(engine: &Engine) -> Option<&bollard::Docker> {
    engine.docker_handle()
}

/// The Linux path: spawn the successor, supervise the handshake, and either
/// self-destruct after the handover commits or roll back.
async fn linux_handover(core: &Arc<Core>, progress: &Progress) -> Result<Value> {
    let (socket_path, new_instance, previous_instance) = {
        let slot = core.update.lock().await;
        let session = slot.as_ref().expect("session set by run_update");
        (
            session.socket_path.clone(),
            session.new_instance_id.clone(),
            session.previous_instance_id.clone(),
        )
    };

    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let _ = std::fs::remove_file(&socket_path);
    let listener = tokio::net::UnixListener::bind(&socket_path)
        .with_context(|| format!("binding {}", socket_path.display()))?;

    set_phase(core, UpdatePhase::Spawning).await;
    spawn_successor(core, &socket_path, &new_instance, &previous_instance, true, true)
        .await
        .context("spawning update container")?;
    progress.emit("update", "info", "Successor container started");

    set_phase(core, UpdatePhase::AwaitingReady).await;
    let supervised = tokio::time::timeout(OUTER_DEADLINE, async {
        let (stream, _) = listener
            .accept()
            .await
            .map_err(|_| HandshakeFailure::Closed)?;
        let mut reader = BufReader::new(stream);

        read_message(&mut reader, MSG_READY).await?;
        reader
            .get_mut()
            .write_all(format!("{MSG_ACK}\n").as_bytes())
            .await
            .map_err(|_| HandshakeFailure::Closed)?;
        set_phase(core, UpdatePhase::AckSent).await;
        progress.emit("update", "info", "Takeover acknowledged");

        set_phase(core, UpdatePhase::StabilityWindow).await;
        read_message(&mut reader, MSG_TAKEOVER).await?;
        Ok::<_, HandshakeFailure>(reader)
    })
    .await
    .unwrap_or(Err(HandshakeFailure::Timeout));

    let mut reader = match supervised {
        Ok(reader) => reader,
        Err(failure) => {
            if matches!(failure, HandshakeFailure::Closed) {
                log::error!(target: "update", "CRITICAL: New container disconnected prematurely");
            } else {
                log::error!(target: "update", "Handshake failed: {failure}");
            }
            rollback(core).await;
            let _ = std::fs::remove_file(&socket_path);
            anyhow::bail!("update failed ({failure}); rolled back");
        }
    };

    // Takeover committed: the successor owns the primary name. Wind down.
    set_phase(core, UpdatePhase::HandoverCommitted).await;
    progress.emit("update", "ok", "Takeover complete; handing over");
    core.websites.stop_all().await;
    core.services.stop_all().await;
    core.proxy.stop_child().await;
    crate::process::stop_all(&core.config, &core.paths).await;
    if let Err(err) = core.config.force().await {
        log::error!(target: "update", "Final config flush failed: {err:#}");
    }
    if let Err(err) = core
        .engine
        .set_restart_policy(BACKUP_CONTAINER, RestartPolicyNameEnum::NO)
        .await
    {
        log::warn!(target: "update", "Could not disable backup restart policy: {err}");
    }
    let _ = reader
        .get_mut()
        .write_all(format!("{MSG_HANDOVER}\n").as_bytes())
        .await;

    set_phase(core, UpdatePhase::SelfDestruct).await;
    let shutdown = core.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        std::process::exit(0);
    });
    Ok(Value::from("Update complete; this instance is retiring."))
}

/// The successor's environment: the primary's own Env minus the update
/// markers and identity, plus a fresh identity (and, for a supervised
/// handover, the update markers).
fn successor_env(
    current: Vec<String>,
    socket_path: &std::path::Path,
    new_instance: &str,
    previous_instance: &str,
    update_mode: bool,
) -> Vec<String> {
    let mut env: Vec<String> = current
        .into_iter()
        .filter(|entry| {
            !entry.starts_with("ODAC_UPDATE_MODE=") && !entry.starts_with("ODAC_INSTANCE_ID=")
        })
        .collect();
    env.push(format!("ODAC_INSTANCE_ID={new_instance}"));
    if update_mode {
        env.push("ODAC_UPDATE_MODE=true".to_string());
        env.push(format!("ODAC_PREVIOUS_INSTANCE_ID={previous_instance}"));
        env.push(format!(
            "ODAC_UPDATE_SOCKET_PATH={}",
            socket_path.display()
        ));
    }
    env
}

/// Build and start the `odac-update` sibling from the primary container's
/// own Env and Binds, swapping in the update markers.
async fn spawn_successor(
    core: &Arc<Core>,
    socket_path: &std::path::Path,
    new_instance: &str,
    previous_instance: &str,
    update_mode: bool,
    start_now: bool,
) -> Result<()> {
    let docker = engine_docker(&core.engine).context("engine unavailable")?;
    let inspect = docker
        .inspect_container(PRIMARY_CONTAINER, None::<bollard::container::InspectContainerOptions>)
        .await
        .context("inspecting primary container")?;

    let env = successor_env(
        inspect
            .config
            .as_ref()
            .and_then(|c| c.env.clone())
            .unwrap_or_default(),
        socket_path,
        new_instance,
        previous_instance,
        update_mode,
    );

    let binds = inspect.host_config.as_ref().and_then(|h| h.binds.clone());

    let _ = core.engine.remove(UPDATE_CONTAINER).await;
    docker
        .create_container(
            Some(bollard::container::CreateContainerOptions {
                name: UPDATE_CONTAINER.to_string(),
                platform: None,
            }),
            bollard::container::Config {
                image: Some(RELEASE_IMAGE.to_string()),
                env: Some(env),
                host_config: Some(bollard::models::HostConfig {
                    binds,
                    network_mode: Some("host".to_string()),
                    restart_policy: Some(bollard::models::RestartPolicy {
                        name: Some(RestartPolicyNameEnum::NO),
                        maximum_retry_count: None,
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await?;
    if start_now {
        docker
            .start_container(
                UPDATE_CONTAINER,
                None::<bollard::container::StartContainerOptions<String>>,
            )
            .await?;
    }
    Ok(())
}

/// Undo a failed pre-commit handover: remove the successor, restore the
/// primary name and its restart policy, keep running.
async fn rollback(core: &Arc<Core>) {
    set_phase(core, UpdatePhase::RollbackReady).await;
    let _ = core.engine.remove(UPDATE_CONTAINER).await;

    if core.engine.is_running(BACKUP_CONTAINER).await
        || container_exists(&core.engine, BACKUP_CONTAINER).await
    {
        if let Err(err) = core.engine.rename(BACKUP_CONTAINER, PRIMARY_CONTAINER).await {
            log::error!(target: "update", "Restoring primary name failed: {err}");
        }
    }
    if let Err(err) = core
        .engine
        .set_restart_policy(PRIMARY_CONTAINER, RestartPolicyNameEnum::UNLESS_STOPPED)
        .await
    {
        log::warn!(target: "update", "Restoring restart policy failed: {err}");
    }
    set_phase(core, UpdatePhase::RolledBack).await;
    log::warn!(target: "update", "Rolled back; continuing as primary");
}

async fn container_exists(engine: &Engine, name: &str) -> bool {
    match engine_docker(engine) {
        Some(docker) => docker
            .inspect_container(name, None::<bollard::container::InspectContainerOptions>)
            .await
            .is_ok(),
        None => false,
    }
}

/// Non-Linux path: stage the successor stopped, then let a helper container
/// stop/rename/start while this process exits.
async fn portable_swap(core: &Arc<Core>, progress: &Progress) -> Result<Value> {
    let (socket_path, new_instance, previous_instance) = {
        let slot = core.update.lock().await;
        let session = slot.as_ref().expect("session set by run_update");
        (
            session.socket_path.clone(),
            session.new_instance_id.clone(),
            session.previous_instance_id.clone(),
        )
    };
    // Reuse the sibling-spawn config, but leave the container stopped and
    // without update markers: the helper simply renames and starts it.
    spawn_successor(core, &socket_path, &new_instance, &previous_instance, false, false)
        .await?;

    let script = format!(
        "sleep 5 && docker stop {PRIMARY_CONTAINER} && docker rm {PRIMARY_CONTAINER} \
         && docker rename {UPDATE_CONTAINER} {PRIMARY_CONTAINER} && docker start {PRIMARY_CONTAINER}"
    );
    core.engine
        .run_detached(
            crate::engine::DOCKER_CLI_IMAGE,
            vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()],
            vec!["sh".to_string(), "-c".to_string(), script],
        )
        .await
        .context("starting swap helper")?;

    progress.emit("update", "ok", "Swap scheduled; restarting");
    let shutdown = core.shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_secs(2)).await;
        std::process::exit(0);
    });
    Ok(Value::from("Update scheduled; the daemon will restart."))
}

/// Connection held by the new instance between handshake and commit.
pub struct Takeover {
    reader: BufReader<tokio::net::UnixStream>,
    previous_instance: String,
}

/// New-instance side, phase one: announce readiness, wait for the ACK, and
/// claim the primary container name. Returns `None` when this process is not
/// running in update mode.
pub async fn begin_update_mode(engine: &Engine) -> Result<Option<Takeover>> {
    if std::env::var("ODAC_UPDATE_MODE").map(|v| v != "true").unwrap_or(true) {
        return Ok(None);
    }
    let socket_path = update_socket_path();
    let previous_instance = std::env::var("ODAC_PREVIOUS_INSTANCE_ID").unwrap_or_default();
    log::info!(
        target: "update",
        "Update mode: handshaking over {}",
        socket_path.display()
    );

    let stream = tokio::net::UnixStream::connect(&socket_path)
        .await
        .with_context(|| format!("connecting {}", socket_path.display()))?;
    let mut reader = BufReader::new(stream);
    reader
        .get_mut()
        .write_all(format!("{MSG_READY}\n").as_bytes())
        .await
        .context("sending HANDSHAKE_READY")?;
    read_message(&mut reader, MSG_ACK)
        .await
        .map_err(|failure| anyhow::anyhow!("waiting for ACK: {failure}"))?;

    // Takeover: claim the primary name before services come up.
    engine
        .rename(PRIMARY_CONTAINER, BACKUP_CONTAINER)
        .await
        .context("renaming primary to backup")?;
    engine
        .rename(UPDATE_CONTAINER, PRIMARY_CONTAINER)
        .await
        .context("claiming primary name")?;
    log::info!(target: "update", "Primary container name claimed");

    Ok(Some(Takeover {
        reader,
        previous_instance,
    }))
}

/// New-instance side, phase two (services are up): hold the stability
/// window, commit the takeover, wait for the old instance's farewell and
/// garbage-collect its run files.
pub async fn complete_update_mode(mut takeover: Takeover, paths: &OdacPaths) {
    tokio::time::sleep(STABILITY_WINDOW).await;
    if let Err(err) = takeover
        .reader
        .get_mut()
        .write_all(format!("{MSG_TAKEOVER}\n").as_bytes())
        .await
    {
        // Post-commit failures do not demote this instance.
        log::error!(target: "update", "Sending TAKEOVER_COMPLETE failed: {err}");
        return;
    }
    log::info!(target: "update", "Takeover committed");

    match read_message(&mut takeover.reader, MSG_HANDOVER).await {
        Ok(()) => log::info!(target: "update", "Predecessor handed over"),
        Err(failure) => {
            log::warn!(target: "update", "No clean handover from predecessor: {failure}");
        }
    }

    let previous = takeover.previous_instance.clone();
    let pid_file = paths.proxy_pid_file(&previous);
    let socket = paths.proxy_socket(&previous);
    tokio::spawn(async move {
        tokio::time::sleep(GC_DELAY).await;
        let _ = std::fs::remove_file(&pid_file);
        let _ = std::fs::remove_file(&socket);
        log::info!(target: "update", "Previous instance {previous} run files removed");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn read_message_accepts_exact_lines_only() {
        let (client, server) = tokio::io::duplex(256);
        let mut reader = BufReader::new(server);
        let mut client = client;

        client.write_all(b"HANDSHAKE_READY\n").await.unwrap();
        read_message(&mut reader, MSG_READY).await.expect("exact line");

        client.write_all(b"SOMETHING_ELSE\n").await.unwrap();
        let err = read_message(&mut reader, MSG_TAKEOVER)
            .await
            .expect_err("illegal line");
        assert!(matches!(err, HandshakeFailure::Illegal(line) if line == "SOMETHING_ELSE"));

        drop(client);
        let err = read_message(&mut reader, MSG_TAKEOVER)
            .await
            .expect_err("closed socket");
        assert!(matches!(err, HandshakeFailure::Closed));
    }

    #[test]
    fn successor_env_swaps_identity_and_markers() {
        let current = vec![
            "PATH=/usr/bin".to_string(),
            "ODAC_INSTANCE_ID=old-id".to_string(),
            "ODAC_UPDATE_MODE=true".to_string(),
            "ODAC_CHANNEL=stable".to_string(),
        ];
        let env = successor_env(
            current.clone(),
            std::path::Path::new("/app/storage/run/update.sock"),
            "new-id",
            "old-id",
            true,
        );

        assert!(env.contains(&"PATH=/usr/bin".to_string()));
        assert!(env.contains(&"ODAC_CHANNEL=stable".to_string()));
        assert!(env.contains(&"ODAC_INSTANCE_ID=new-id".to_string()));
        assert!(env.contains(&"ODAC_PREVIOUS_INSTANCE_ID=old-id".to_string()));
        assert!(env.contains(&"ODAC_UPDATE_MODE=true".to_string()));
        assert!(
            env.contains(&"ODAC_UPDATE_SOCKET_PATH=/app/storage/run/update.sock".to_string())
        );
        assert!(!env.contains(&"ODAC_INSTANCE_ID=old-id".to_string()));

        // The portable path stages a plain restart: no markers at all.
        let plain = successor_env(
            current,
            std::path::Path::new("/ignored"),
            "new-id",
            "old-id",
            false,
        );
        assert!(plain.contains(&"ODAC_INSTANCE_ID=new-id".to_string()));
        assert!(!plain.iter().any(|e| e.starts_with("ODAC_UPDATE_MODE=")));
        assert!(!plain.iter().any(|e| e.starts_with("ODAC_UPDATE_SOCKET_PATH=")));
    }

    #[test]
    fn socket_path_defaults_to_the_storage_run_dir() {
        // Only assert the default; the env override is exercised in the
        // update-mode integration path.
        if std::env::var("ODAC_UPDATE_SOCKET_PATH").is_err() {
            assert_eq!(
                update_socket_path(),
                PathBuf::from("/app/storage/run/update.sock")
            );
        }
    }
}
