//! # Firewall
//!
//! Per-request admission control for the proxy: allow/deny lists plus a
//! sliding-window rate limiter keyed by normalized peer IP. The engine holds
//! only in-memory counters; the policy itself lives in the config store and
//! is replaced wholesale whenever the daemon syncs a new snapshot.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::modules::FirewallPolicy;
use crate::net::normalize_ip;

/// Hard cap on tracked IPs; beyond this the counter map is dropped wholesale
/// so memory stays bounded under address-spraying traffic.
const MAX_TRACKED_IPS: usize = 20_000;

/// Why a request was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blacklist,
    RateLimit,
}

impl DenyReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyReason::Blacklist => "blacklist",
            DenyReason::RateLimit => "rate_limit",
        }
    }
}

/// Outcome of a firewall check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allowed,
    Denied(DenyReason),
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        matches!(self, Verdict::Allowed)
    }
}

struct Window {
    started: Instant,
    count: u64,
}

/// The in-memory firewall engine.
pub struct Firewall {
    policy: RwLock<FirewallPolicy>,
    counters: Mutex<HashMap<String, Window>>,
    /// IPs currently over the limit; used to log only the first transition.
    limited: Mutex<HashSet<String>>,
}

impl Firewall {
    pub fn new(policy: FirewallPolicy) -> Self {
        Self {
            policy: RwLock::new(policy),
            counters: Mutex::new(HashMap::new()),
            limited: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the active policy (daemon snapshot sync).
    pub fn set_policy(&self, policy: FirewallPolicy) {
        *self.policy.write().expect("firewall policy poisoned") = policy;
    }

    pub fn policy(&self) -> FirewallPolicy {
        self.policy.read().expect("firewall policy poisoned").clone()
    }

    /// Number of IPs currently tracked by the rate limiter.
    pub fn tracked_ips(&self) -> usize {
        self.counters.lock().expect("firewall counters poisoned").len()
    }

    /// Admission check for one request from `ip`.
    pub fn check(&self, ip: &str) -> Verdict {
        let policy = self.policy.read().expect("firewall policy poisoned");
        if !policy.enabled {
            return Verdict::Allowed;
        }

        let ip = normalize_ip(ip);

        if policy.whitelist.iter().any(|w| w == &ip) {
            return Verdict::Allowed;
        }
        if policy.blacklist.iter().any(|b| b == &ip) {
            return Verdict::Denied(DenyReason::Blacklist);
        }
        if !policy.rate_limit.enabled {
            return Verdict::Allowed;
        }

        let window = Duration::from_millis(policy.rate_limit.window_ms);
        let max = policy.rate_limit.max;
        drop(policy);

        let mut counters = self.counters.lock().expect("firewall counters poisoned");
        if counters.len() > MAX_TRACKED_IPS {
            counters.clear();
            self.limited.lock().expect("firewall limited poisoned").clear();
            log::warn!(target: "firewall", "Counter map exceeded {MAX_TRACKED_IPS} entries; flushed");
        }

        let now = Instant::now();
        let entry = counters.entry(ip.clone()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) > window {
            entry.started = now;
            entry.count = 0;
            self.limited.lock().expect("firewall limited poisoned").remove(&ip);
        }
        entry.count += 1;

        if entry.count > max {
            let mut limited = self.limited.lock().expect("firewall limited poisoned");
            if limited.insert(ip.clone()) {
                log::warn!(target: "firewall", "Rate limit exceeded for {ip}");
            }
            return Verdict::Denied(DenyReason::RateLimit);
        }
        Verdict::Allowed
    }

    /// Janitor pass: drop windows older than the configured window so idle
    /// peers do not pin memory. Runs on a minute cadence in the proxy.
    pub fn evict_stale(&self) {
        let window = {
            let policy = self.policy.read().expect("firewall policy poisoned");
            Duration::from_millis(policy.rate_limit.window_ms)
        };
        let now = Instant::now();
        let mut counters = self.counters.lock().expect("firewall counters poisoned");
        let mut limited = self.limited.lock().expect("firewall limited poisoned");
        counters.retain(|ip, w| {
            let keep = now.duration_since(w.started) <= window;
            if !keep {
                limited.remove(ip);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::modules::RateLimitPolicy;

    fn policy(max: u64, window_ms: u64) -> FirewallPolicy {
        FirewallPolicy {
            enabled: true,
            blacklist: vec![],
            whitelist: vec![],
            rate_limit: RateLimitPolicy {
                window_ms,
                max,
                enabled: true,
            },
            max_ws_per_ip: 16,
        }
    }

    #[test]
    fn disabled_firewall_allows_everything() {
        let mut p = policy(1, 60_000);
        p.enabled = false;
        p.blacklist.push("203.0.113.7".into());
        let fw = Firewall::new(p);
        assert!(fw.check("203.0.113.7").allowed());
    }

    #[test]
    fn whitelist_beats_blacklist_and_limit() {
        let mut p = policy(1, 60_000);
        p.whitelist.push("203.0.113.7".into());
        p.blacklist.push("203.0.113.7".into());
        let fw = Firewall::new(p);
        for _ in 0..10 {
            assert!(fw.check("203.0.113.7").allowed());
        }
    }

    #[test]
    fn blacklist_denies_mapped_ipv6_spelling() {
        let mut p = policy(100, 60_000);
        p.blacklist.push("203.0.113.7".into());
        let fw = Firewall::new(p);
        assert_eq!(
            fw.check("::ffff:203.0.113.7"),
            Verdict::Denied(DenyReason::Blacklist)
        );
    }

    #[test]
    fn sliding_window_denies_past_max() {
        let fw = Firewall::new(policy(2, 60_000));
        assert!(fw.check("198.51.100.2").allowed());
        assert!(fw.check("198.51.100.2").allowed());
        assert_eq!(
            fw.check("198.51.100.2"),
            Verdict::Denied(DenyReason::RateLimit)
        );
        // A different peer is unaffected.
        assert!(fw.check("198.51.100.3").allowed());
    }

    #[test]
    fn window_resets_after_elapse() {
        let fw = Firewall::new(policy(1, 10));
        assert!(fw.check("198.51.100.9").allowed());
        assert_eq!(
            fw.check("198.51.100.9"),
            Verdict::Denied(DenyReason::RateLimit)
        );
        std::thread::sleep(Duration::from_millis(25));
        assert!(fw.check("198.51.100.9").allowed());
    }

    #[test]
    fn counter_map_is_flushed_wholesale_past_the_cap() {
        let fw = Firewall::new(policy(1_000_000, 600_000));
        for i in 0..(MAX_TRACKED_IPS + 2) {
            let ip = format!("10.{}.{}.{}", i / 65_536, (i / 256) % 256, i % 256);
            fw.check(&ip);
        }
        // The map was dropped once the cap was crossed; only the tail of the
        // loop repopulated it.
        assert!(fw.tracked_ips() < MAX_TRACKED_IPS / 2);
    }

    #[test]
    fn janitor_evicts_stale_windows() {
        let fw = Firewall::new(policy(100, 10));
        fw.check("198.51.100.4");
        assert_eq!(fw.tracked_ips(), 1);
        std::thread::sleep(Duration::from_millis(25));
        fw.evict_stale();
        assert_eq!(fw.tracked_ips(), 0);
    }
}
