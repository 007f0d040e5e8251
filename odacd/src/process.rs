//! Process adapter: pid liveness, cmdline verification and signal-based
//! termination. Termination only fires when the process name still matches
//! the expected binary, which defuses pid reuse after a crash. Failures are
//! swallowed; callers reconcile through presence checks.

use odac_common::config::ConfigStore;
use odac_common::paths::OdacPaths;

/// True when a process with `pid` exists.
#[cfg(unix)]
pub fn alive(pid: u32) -> bool {
    // Signal 0 performs the permission/existence check without delivering.
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

#[cfg(not(unix))]
pub fn alive(_pid: u32) -> bool {
    false
}

/// The process cmdline with NUL separators flattened to spaces.
#[cfg(unix)]
pub fn cmdline(pid: u32) -> Option<String> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    if raw.is_empty() {
        return None;
    }
    Some(
        String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join(" "),
    )
}

#[cfg(not(unix))]
pub fn cmdline(_pid: u32) -> Option<String> {
    None
}

/// True when the pid is alive and its cmdline contains `needle`.
pub fn cmdline_matches(pid: u32, needle: &str) -> bool {
    cmdline(pid).map(|c| c.contains(needle)).unwrap_or(false)
}

/// Send SIGTERM to `pid` iff its cmdline still matches `expected`. An empty
/// `expected` skips the name check (tenant backends run arbitrary
/// interpreters) but still requires the pid to be alive.
#[cfg(unix)]
pub fn stop(pid: u32, expected: &str) {
    if expected.is_empty() {
        if !alive(pid) {
            return;
        }
    } else if !cmdline_matches(pid, expected) {
        log::debug!(target: "process", "Skipping pid {pid}: cmdline does not match '{expected}'");
        return;
    }
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub fn stop(_pid: u32, _expected: &str) {}

/// Stop everything the config knows about: watchdog, server, the proxy
/// instance and every website/service backend pid. The calling process is
/// never signalled, so the daemon can sweep strays during its own shutdown.
pub async fn stop_all(config: &ConfigStore, paths: &OdacPaths) {
    let own_pid = std::process::id();
    let (server_pid, watchdog_pid, instance) = config
        .server
        .read(|s| (s.server_pid, s.watchdog_pid, s.instance_id.clone()))
        .await;

    if let Some(pid) = watchdog_pid.filter(|pid| *pid != own_pid) {
        stop(pid, "odac");
    }
    if let Some(pid) = server_pid.filter(|pid| *pid != own_pid) {
        stop(pid, "odac");
    }

    if !instance.is_empty() {
        let pid_file = paths.proxy_pid_file(&instance);
        if let Ok(raw) = std::fs::read_to_string(&pid_file) {
            if let Ok(pid) = raw.trim().parse::<u32>() {
                stop(pid, "odac-proxy");
            }
        }
    }

    let web_pids: Vec<u32> = config
        .web
        .read(|w| w.websites.values().filter_map(|site| site.pid).collect())
        .await;
    for pid in web_pids {
        stop(pid, "");
    }

    let service_pids: Vec<u32> = config
        .services
        .read(|s| {
            s.services
                .values()
                .filter_map(|svc| match &svc.backend {
                    odac_common::config::modules::ServiceBackend::Script { pid, .. } => *pid,
                    _ => None,
                })
                .collect()
        })
        .await;
    for pid in service_pids {
        stop(pid, "");
    }
}
