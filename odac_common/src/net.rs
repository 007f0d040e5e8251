//! IP normalization and free-port probing for backend allocation.

use std::collections::HashSet;
use std::net::{IpAddr, TcpListener};

/// Website backends are allocated out of this range.
pub const WEB_PORT_RANGE: std::ops::Range<u16> = 10000..20000;
/// `auto` ports of container apps resolve upward from this floor.
pub const APP_PORT_FLOOR: u16 = 30000;

/// Collapse IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) to dotted quads so
/// firewall lists and counters see one spelling per peer.
pub fn normalize_ip(ip: &str) -> String {
    let trimmed = ip.trim();
    if let Some(mapped) = trimmed.strip_prefix("::ffff:") {
        if mapped.parse::<std::net::Ipv4Addr>().is_ok() {
            return mapped.to_string();
        }
    }
    trimmed.to_string()
}

/// True when `ip` is a loopback address in either family.
pub fn is_loopback(ip: &str) -> bool {
    normalize_ip(ip)
        .parse::<IpAddr>()
        .map(|a| a.is_loopback())
        .unwrap_or(false)
}

/// True when the string parses as an IP literal (v4 or v6).
pub fn is_ip_literal(host: &str) -> bool {
    host.parse::<IpAddr>().is_ok()
}

/// Find a free TCP port inside `range`, skipping ports already claimed in
/// config. Availability is probed with a throwaway bind.
pub fn find_free_port(range: std::ops::Range<u16>, used: &HashSet<u16>) -> Option<u16> {
    for port in range {
        if used.contains(&port) {
            continue;
        }
        if TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Some(port);
        }
    }
    None
}

/// The next free port at or above `floor` (used for `auto` recipe ports).
pub fn next_free_port_from(floor: u16, used: &HashSet<u16>) -> Option<u16> {
    find_free_port(floor..u16::MAX, used)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_ipv6_collapses() {
        assert_eq!(normalize_ip("::ffff:203.0.113.7"), "203.0.113.7");
        assert_eq!(normalize_ip("2001:db8::1"), "2001:db8::1");
        assert_eq!(normalize_ip("  10.0.0.1 "), "10.0.0.1");
    }

    #[test]
    fn loopback_detection() {
        assert!(is_loopback("127.0.0.1"));
        assert!(is_loopback("::1"));
        assert!(is_loopback("::ffff:127.0.0.1"));
        assert!(!is_loopback("203.0.113.7"));
        assert!(!is_loopback("not-an-ip"));
    }

    #[test]
    fn ip_literals() {
        assert!(is_ip_literal("192.0.2.1"));
        assert!(is_ip_literal("::1"));
        assert!(!is_ip_literal("example.com"));
    }

    #[test]
    fn free_port_skips_used() {
        let mut used = HashSet::new();
        let first = find_free_port(49000..49100, &used).expect("a free port");
        used.insert(first);
        let second = find_free_port(49000..49100, &used).expect("another free port");
        assert_ne!(first, second);
    }
}
