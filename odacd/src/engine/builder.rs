//! # Image Builder
//!
//! Two-stage image production without privileged containers: an unprivileged
//! compile pass in the strategy's builder image, then a package pass driven
//! by the host docker CLI running inside a helper container that mounts the
//! engine socket (DooD). Projects shipping their own `Dockerfile` skip the
//! compile pass entirely.

use std::path::{Path, PathBuf};

use super::{dood_path, Engine, EngineError, DOCKER_CLI_IMAGE};

/// Build track of one detected project.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// The source ships a `Dockerfile`; build it as-is.
    Custom,
    Auto(&'static Strategy),
}

/// How a project type is compiled and packaged.
#[derive(Debug, PartialEq, Eq)]
pub struct Strategy {
    pub key: &'static str,
    /// Files whose presence selects this strategy.
    pub triggers: &'static [&'static str],
    /// Image used for the unprivileged compile pass.
    pub builder_image: &'static str,
    /// Base of the packaged image.
    pub base_image: &'static str,
    pub install: &'static str,
    pub build: &'static str,
    pub cleanup: &'static str,
    /// CMD of the packaged image.
    pub cmd: &'static str,
    pub env: &'static [&'static str],
}

/// Detection order is part of the contract: `Dockerfile` wins, then the
/// trigger files below, top to bottom.
pub const STRATEGIES: &[Strategy] = &[
    Strategy {
        key: "python",
        triggers: &["requirements.txt", "pyproject.toml"],
        builder_image: "python:3.12-slim",
        base_image: "python:3.12-slim",
        install: "pip install --no-cache-dir -r requirements.txt --target .odac-deps",
        build: "true",
        cleanup: "rm -rf ~/.cache/pip",
        cmd: "[\"python\", \"-u\", \"main.py\"]",
        env: &["PYTHONPATH=/app/.odac-deps"],
    },
    Strategy {
        key: "go",
        triggers: &["go.mod"],
        builder_image: "golang:1.22-alpine",
        base_image: "alpine:3",
        install: "go mod download",
        build: "CGO_ENABLED=0 go build -o .odac-bin ./...",
        cleanup: "go clean -cache -modcache 2>/dev/null || true",
        cmd: "[\"/app/.odac-bin\"]",
        env: &[],
    },
    Strategy {
        key: "node",
        triggers: &["package.json"],
        builder_image: "node:20-alpine",
        base_image: "node:20-alpine",
        install: "npm ci --no-audit --no-fund",
        build: "npm run build --if-present",
        cleanup: "npm cache clean --force 2>/dev/null || true",
        cmd: "[\"node\", \"index.js\"]",
        env: &["NODE_ENV=production"],
    },
    Strategy {
        key: "php",
        triggers: &["composer.json", "index.php"],
        builder_image: "composer:2",
        base_image: "php:8.3-cli",
        install: "[ -f composer.json ] && composer install --no-dev --no-interaction || true",
        build: "true",
        cleanup: "rm -rf ~/.composer/cache",
        cmd: "[\"php\", \"-S\", \"0.0.0.0:8080\", \"-t\", \"/app\"]",
        env: &[],
    },
    Strategy {
        key: "static",
        triggers: &["index.html"],
        builder_image: "alpine:3",
        base_image: "nginx:alpine",
        install: "true",
        build: "true",
        cleanup: "true",
        cmd: "[\"nginx\", \"-g\", \"daemon off;\"]",
        env: &[],
    },
];

/// Detect the build track of a source tree.
pub fn detect(source: &Path) -> Result<ProjectKind, EngineError> {
    if source.join("Dockerfile").is_file() {
        return Ok(ProjectKind::Custom);
    }
    for strategy in STRATEGIES {
        if strategy
            .triggers
            .iter()
            .any(|trigger| source.join(trigger).is_file())
        {
            return Ok(ProjectKind::Auto(strategy));
        }
    }
    Err(EngineError::NoProjectType)
}

/// Removes the ephemeral dockerfile on every exit path.
struct EphemeralDockerfile {
    path: PathBuf,
}

impl EphemeralDockerfile {
    fn write(source: &Path, strategy: &Strategy) -> Result<Self, EngineError> {
        let path = source.join("Dockerfile.odac");
        let mut body = String::new();
        body.push_str(&format!("FROM {}\n", strategy.base_image));
        body.push_str("COPY . /app\n");
        body.push_str("RUN chown -R 1000:1000 /app\n");
        body.push_str("USER 1000\n");
        body.push_str("WORKDIR /app\n");
        for env in strategy.env {
            body.push_str(&format!("ENV {env}\n"));
        }
        body.push_str(&format!("CMD {}\n", strategy.cmd));
        std::fs::write(&path, body)
            .map_err(|e| EngineError::Failed(format!("writing {}: {e}", path.display())))?;
        Ok(Self { path })
    }
}

impl Drop for EphemeralDockerfile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Compile pass in the strategy's builder image, with the two one-shot
/// compensations: lockfile sync after an `npm ci` failure, builder-cache
/// prune after `failed to export`. Each fires at most once.
async fn compile(engine: &Engine, source: &Path, strategy: &Strategy) -> Result<(), EngineError> {
    let command = format!(
        "{} && {} && {}",
        strategy.install, strategy.build, strategy.cleanup
    );

    let mut lockfile_synced = false;
    let mut cache_pruned = false;
    loop {
        let (code, output) = engine
            .run_ephemeral(
                strategy.builder_image,
                vec![format!("{}:/app", dood_path(source))],
                vec!["sh".to_string(), "-c".to_string(), command.clone()],
                Vec::new(),
                Some("/app".to_string()),
            )
            .await?;
        if code == 0 {
            return Ok(());
        }

        if !lockfile_synced && output.contains("npm ci") {
            log::warn!(target: "builder", "npm ci failed; syncing the lockfile and retrying once");
            lockfile_synced = true;
            let (sync_code, sync_out) = engine
                .run_ephemeral(
                    strategy.builder_image,
                    vec![format!("{}:/app", dood_path(source))],
                    vec![
                        "sh".to_string(),
                        "-c".to_string(),
                        "npm install --package-lock-only".to_string(),
                    ],
                    Vec::new(),
                    Some("/app".to_string()),
                )
                .await?;
            if sync_code != 0 {
                return Err(EngineError::Failed(format!(
                    "lockfile sync failed ({sync_code}): {}",
                    sync_out.trim()
                )));
            }
            continue;
        }

        if !cache_pruned && output.contains("failed to export") {
            log::warn!(target: "builder", "Export failure; pruning builder cache and retrying once");
            cache_pruned = true;
            prune_builder_cache(engine).await?;
            continue;
        }

        return Err(EngineError::Failed(format!(
            "compile phase exited with {code}: {}",
            tail(&output, 2000)
        )));
    }
}

/// Run `docker builder prune` through the DooD helper.
async fn prune_builder_cache(engine: &Engine) -> Result<(), EngineError> {
    let (code, output) = engine
        .run_ephemeral(
            DOCKER_CLI_IMAGE,
            vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()],
            vec![
                "docker".to_string(),
                "builder".to_string(),
                "prune".to_string(),
                "-af".to_string(),
            ],
            Vec::new(),
            None,
        )
        .await?;
    if code != 0 {
        return Err(EngineError::Failed(format!(
            "builder cache prune failed ({code}): {}",
            output.trim()
        )));
    }
    Ok(())
}

/// Package pass: `docker build` inside the helper container with the engine
/// socket and the source mounted.
async fn package(
    engine: &Engine,
    source: &Path,
    image: &str,
    dockerfile: Option<&str>,
) -> Result<(), EngineError> {
    let mut cmd = vec!["docker".to_string(), "build".to_string()];
    if let Some(name) = dockerfile {
        cmd.push("-f".to_string());
        cmd.push(format!("/app/{name}"));
    }
    cmd.push("-t".to_string());
    cmd.push(image.to_string());
    cmd.push("/app".to_string());

    let (code, output) = engine
        .run_ephemeral(
            DOCKER_CLI_IMAGE,
            vec![
                format!("{}:/app", dood_path(source)),
                "/var/run/docker.sock:/var/run/docker.sock".to_string(),
            ],
            cmd,
            Vec::new(),
            None,
        )
        .await?;
    if code != 0 {
        return Err(EngineError::Failed(format!(
            "docker build of {image} exited with {code}: {}",
            tail(&output, 2000)
        )));
    }
    Ok(())
}

/// Full build pipeline for one source tree. Called through
/// [`Engine::build`], which holds the single-flight slot.
pub(crate) async fn build_image(
    engine: &Engine,
    source: &Path,
    image: &str,
) -> Result<(), EngineError> {
    match detect(source)? {
        ProjectKind::Custom => {
            log::info!(target: "builder", "Building {image} from project Dockerfile");
            package(engine, source, image, None).await
        }
        ProjectKind::Auto(strategy) => {
            log::info!(target: "builder", "Building {image} with the {} strategy", strategy.key);
            compile(engine, source, strategy).await?;
            let dockerfile = EphemeralDockerfile::write(source, strategy)?;
            let result = package(engine, source, image, Some("Dockerfile.odac")).await;
            drop(dockerfile);
            result
        }
    }
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        // Slice at a char boundary near the tail.
        let start = s.len() - max;
        let boundary = (start..s.len())
            .find(|i| s.is_char_boundary(*i))
            .unwrap_or(start);
        &s[boundary..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"").unwrap();
    }

    #[test]
    fn dockerfile_wins_over_everything() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "package.json");
        touch(dir.path(), "Dockerfile");
        assert_eq!(detect(dir.path()).unwrap(), ProjectKind::Custom);
    }

    #[test]
    fn triggers_resolve_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        touch(dir.path(), "index.html");
        touch(dir.path(), "package.json");
        touch(dir.path(), "requirements.txt");
        match detect(dir.path()).unwrap() {
            ProjectKind::Auto(strategy) => assert_eq!(strategy.key, "python"),
            other => panic!("unexpected kind {other:?}"),
        }
    }

    #[test]
    fn empty_tree_has_no_project_type() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            detect(dir.path()),
            Err(EngineError::NoProjectType)
        ));
    }

    #[test]
    fn ephemeral_dockerfile_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let strategy = &STRATEGIES[2]; // node
        let guard = EphemeralDockerfile::write(dir.path(), strategy).unwrap();
        let path = dir.path().join("Dockerfile.odac");
        let body = std::fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("FROM node:20-alpine"));
        assert!(body.contains("RUN chown -R 1000:1000 /app"));
        assert!(body.contains("ENV NODE_ENV=production"));
        assert!(body.contains("CMD [\"node\", \"index.js\"]"));
        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn tail_slices_long_output() {
        let long = "x".repeat(5000);
        assert_eq!(tail(&long, 2000).len(), 2000);
        assert_eq!(tail("short", 2000), "short");
    }
}
