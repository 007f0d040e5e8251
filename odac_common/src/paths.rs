//! The `~/.odac` filesystem layout used by the daemon, the proxy and the
//! updater. Every path consumers touch goes through here so tests can root
//! the whole tree inside a temporary directory.

use std::path::{Path, PathBuf};

/// Resolved locations of the odac state tree.
#[derive(Debug, Clone)]
pub struct OdacPaths {
    root: PathBuf,
}

impl OdacPaths {
    /// The default layout under the current user's home directory.
    pub fn from_home() -> anyhow::Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| anyhow::anyhow!("HOME directory not found"))?;
        Ok(Self::rooted(home.join(".odac")))
    }

    /// A layout rooted at an explicit directory (tests, containers).
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn cert_dir(&self) -> PathBuf {
        self.root.join("cert")
    }

    pub fn ssl_cert_dir(&self) -> PathBuf {
        self.cert_dir().join("ssl")
    }

    pub fn dkim_cert_dir(&self) -> PathBuf {
        self.cert_dir().join("dkim")
    }

    /// Default base for website document roots; `ODAC_WEB_PATH` overrides it.
    pub fn web_dir(&self) -> PathBuf {
        match std::env::var("ODAC_WEB_PATH") {
            Ok(base) if !base.is_empty() => PathBuf::from(base),
            _ => self.root.join("web"),
        }
    }

    pub fn api_socket(&self) -> PathBuf {
        self.run_dir().join("api.sock")
    }

    pub fn proxy_socket(&self, instance: &str) -> PathBuf {
        self.run_dir().join(format!("proxy-{instance}.sock"))
    }

    pub fn proxy_pid_file(&self, instance: &str) -> PathBuf {
        self.run_dir().join(format!("proxy-{instance}.pid"))
    }

    pub fn domain_log(&self, domain: &str) -> PathBuf {
        self.logs_dir().join(format!("{domain}.log"))
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.logs_dir().join(".odac.log")
    }

    /// Create every directory of the layout that must exist before use.
    pub fn ensure_layout(&self) -> std::io::Result<()> {
        for dir in [
            self.config_dir(),
            self.run_dir(),
            self.logs_dir(),
            self.ssl_cert_dir(),
            self.dkim_cert_dir(),
            self.web_dir(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_rooted() {
        let p = OdacPaths::rooted("/tmp/odac-test");
        assert_eq!(p.api_socket(), PathBuf::from("/tmp/odac-test/run/api.sock"));
        assert_eq!(
            p.proxy_pid_file("abc"),
            PathBuf::from("/tmp/odac-test/run/proxy-abc.pid")
        );
        assert_eq!(
            p.domain_log("example.com"),
            PathBuf::from("/tmp/odac-test/logs/example.com.log")
        );
    }

    #[test]
    fn ensure_layout_creates_directories() {
        let dir = tempfile::tempdir().expect("tempdir");
        let p = OdacPaths::rooted(dir.path().join("state"));
        p.ensure_layout().expect("layout");
        assert!(p.config_dir().is_dir());
        assert!(p.run_dir().is_dir());
        assert!(p.ssl_cert_dir().is_dir());
    }
}
