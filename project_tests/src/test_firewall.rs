use odac_common::config::modules::{FirewallPolicy, RateLimitPolicy};
use odac_common::firewall::{DenyReason, Firewall, Verdict};
use std::time::Duration;

#[tokio::main]
/// # Firewall Integration Test
///
/// Exercises the sliding-window rate limiter against a live clock:
/// 1.  Requests within the window are admitted up to the configured max.
/// 2.  The next request is denied with the `rate_limit` reason.
/// 3.  After the window elapses the peer is admitted again.
/// 4.  The janitor drops stale windows so memory stays bounded.
async fn main() {
    let firewall = Firewall::new(FirewallPolicy {
        enabled: true,
        blacklist: vec![],
        whitelist: vec![],
        rate_limit: RateLimitPolicy {
            window_ms: 500,
            max: 2,
            enabled: true,
        },
        max_ws_per_ip: 16,
    });

    let peer = "203.0.113.77";
    assert!(firewall.check(peer).allowed(), "first request admitted");
    assert!(firewall.check(peer).allowed(), "second request admitted");
    assert_eq!(
        firewall.check(peer),
        Verdict::Denied(DenyReason::RateLimit),
        "third request rate-limited"
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(
        firewall.check(peer).allowed(),
        "window elapsed, peer admitted again"
    );

    tokio::time::sleep(Duration::from_millis(600)).await;
    firewall.evict_stale();
    assert_eq!(firewall.tracked_ips(), 0, "janitor evicted the stale window");

    println!("test_firewall: OK");
}
