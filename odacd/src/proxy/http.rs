//! The plain-HTTP listener: requests for known hosts get a permanent
//! redirect to HTTPS; everything else gets the default page. Port 80 never
//! proxies.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use http::header::{HeaderValue, CONNECTION, HOST, LOCATION};
use http::{Request, StatusCode};

use odac_common::firewall::{DenyReason, Verdict};

use super::{default_page, ProxyState};

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new().fallback(handle).with_state(state)
}

async fn handle(
    State(state): State<Arc<ProxyState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    req: Request<Body>,
) -> Response {
    let ip = peer.ip().to_string();
    if let Verdict::Denied(reason) = state.firewall.check(&ip) {
        let status = match reason {
            DenyReason::Blacklist => StatusCode::FORBIDDEN,
            DenyReason::RateLimit => StatusCode::TOO_MANY_REQUESTS,
        };
        return (status, [(CONNECTION, HeaderValue::from_static("close"))], "").into_response();
    }

    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Unknown hosts get the default page, not a redirect.
    if host.is_empty() || state.resolve_site(&host).is_none() {
        return (
            StatusCode::OK,
            [(http::header::CONTENT_TYPE, "text/html; charset=utf-8")],
            default_page(&host),
        )
            .into_response();
    }

    let bare_host = host.split(':').next().unwrap_or(&host);
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let location = format!("https://{bare_host}{path}");
    match HeaderValue::from_str(&location) {
        Ok(value) => {
            (StatusCode::MOVED_PERMANENTLY, [(LOCATION, value)], "").into_response()
        }
        Err(_) => (StatusCode::OK, default_page(&host)).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use odac_common::wire::{ProxySite, ProxySnapshot};
    use tower::ServiceExt;

    async fn call(state: Arc<ProxyState>, host: Option<&str>, path: &str) -> Response {
        let app = router(state);
        let mut builder = Request::builder().uri(path);
        if let Some(host) = host {
            builder = builder.header(HOST, host);
        }
        let req = builder.body(Body::empty()).unwrap();
        let app = app.layer(axum::extract::connect_info::MockConnectInfo(
            SocketAddr::from(([198, 51, 100, 1], 55555)),
        ));
        app.oneshot(req).await.unwrap()
    }

    fn state_with_example() -> Arc<ProxyState> {
        let state = ProxyState::new().unwrap();
        let mut snapshot = ProxySnapshot::default();
        snapshot.websites.insert(
            "example.com".into(),
            ProxySite {
                port: 10001,
                up: true,
                cert: None,
            },
        );
        state.apply(snapshot);
        state
    }

    #[tokio::test]
    async fn known_host_redirects_to_https() {
        let response = call(state_with_example(), Some("example.com"), "/a/b?c=1").await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers()[LOCATION],
            "https://example.com/a/b?c=1"
        );
    }

    #[tokio::test]
    async fn unknown_host_gets_default_page() {
        let response = call(state_with_example(), Some("stranger.net"), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(LOCATION).is_none());
    }

    #[tokio::test]
    async fn empty_host_gets_default_page() {
        let response = call(state_with_example(), None, "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn third_request_in_the_window_is_rate_limited() {
        let state = ProxyState::new().unwrap();
        let mut snapshot = ProxySnapshot::default();
        snapshot.websites.insert(
            "example.com".into(),
            ProxySite {
                port: 10001,
                up: true,
                cert: None,
            },
        );
        snapshot.firewall.rate_limit.max = 2;
        snapshot.firewall.rate_limit.window_ms = 60_000;
        state.apply(snapshot);

        let first = call(state.clone(), Some("example.com"), "/").await;
        assert_eq!(first.status(), StatusCode::MOVED_PERMANENTLY);
        let second = call(state.clone(), Some("example.com"), "/").await;
        assert_eq!(second.status(), StatusCode::MOVED_PERMANENTLY);
        let third = call(state, Some("example.com"), "/").await;
        assert_eq!(third.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[tokio::test]
    async fn blacklisted_peer_is_closed_with_403() {
        let state = state_with_example();
        let mut snapshot = ProxySnapshot::default();
        snapshot.firewall.blacklist.push("198.51.100.1".into());
        state.apply(snapshot);

        let response = call(state, Some("example.com"), "/").await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONNECTION], "close");
    }
}
