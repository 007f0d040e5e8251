//! The HTTPS request path: firewall admission, backend resolution, header
//! rewriting, forwarding, Early Hints surfacing, and raw byte piping for
//! upgraded (WebSocket) connections. SSE responses stream straight through;
//! either peer closing tears down the other.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST, UPGRADE};
use http::{Request, Response, StatusCode};
use http_body_util::Empty;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;

use odac_common::firewall::{DenyReason, Verdict};

use super::{default_page, ProxyState};

/// Headers that never cross the proxy, in either direction.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
    "proxy-connection",
    "proxy-authenticate",
    "trailer",
    "x-odac-early-hints",
];

pub const REMOTE_ADDR_HEADER: &str = "x-odac-connection-remoteaddress";
pub const SSL_HEADER: &str = "x-odac-connection-ssl";
pub const EARLY_HINTS_HEADER: &str = "x-odac-early-hints";

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.iter().any(|h| name.as_str() == *h)
}

/// Copy `from` into `to`, dropping the hop-by-hop set.
pub fn copy_end_to_end_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if !is_hop_by_hop(name) {
            to.append(name.clone(), value.clone());
        }
    }
}

/// Parse the backend's early-hints header: a JSON array of link values, or a
/// comma-separated list as a fallback.
pub fn parse_early_hints(raw: &str) -> Vec<String> {
    if let Ok(links) = serde_json::from_str::<Vec<String>>(raw) {
        return links.into_iter().filter(|l| !l.is_empty()).collect();
    }
    raw.split(',')
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn html_response(status: StatusCode, body: String) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

fn deny_response(reason: DenyReason) -> Response<Body> {
    let status = match reason {
        DenyReason::Blacklist => StatusCode::FORBIDDEN,
        DenyReason::RateLimit => StatusCode::TOO_MANY_REQUESTS,
    };
    let mut response = Response::builder()
        .status(status)
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()));
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// The request host: HTTP/2 `:authority` first, then the Host header.
fn request_host<B>(req: &Request<B>) -> String {
    if let Some(authority) = req.uri().authority() {
        return authority.to_string();
    }
    req.headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("")
        .to_string()
}

fn wants_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

/// Handle one request arriving on the TLS listener.
pub async fn handle<B>(
    state: Arc<ProxyState>,
    peer: SocketAddr,
    tls: bool,
    req: Request<B>,
) -> Response<Body>
where
    B: axum::body::HttpBody<Data = bytes::Bytes> + Send + 'static,
    B::Error: Into<axum::BoxError>,
{
    let ip = peer.ip().to_string();

    if let Verdict::Denied(reason) = state.firewall.check(&ip) {
        return deny_response(reason);
    }

    let host = request_host(&req);
    let site = match state.resolve_site(&host) {
        Some((_, site)) if site.up => site,
        _ => return html_response(StatusCode::OK, default_page(&host)),
    };

    if wants_upgrade(req.headers()) {
        return handle_upgrade(state, ip, site.port, req).await;
    }

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let upstream_uri = format!("http://127.0.0.1:{}{}", site.port, path_and_query);

    let (parts, body) = req.into_parts();
    let mut builder = Request::builder().method(parts.method.clone()).uri(&upstream_uri);
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end_headers(&parts.headers, headers);
        if !headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HOST, value);
            }
        }
        inject_connection_headers(headers, &ip, tls);
    }
    let upstream_req = match builder.body(Body::new(body)) {
        Ok(r) => r,
        Err(err) => {
            log::warn!(target: "proxy", "Bad upstream request for {host}: {err}");
            return html_response(StatusCode::OK, default_page(&host));
        }
    };

    match state.client.request(upstream_req).await {
        Ok(upstream_resp) => relay_response(upstream_resp),
        Err(err) => {
            // Headers were not sent downstream yet, so the contract says
            // default page rather than a 5xx.
            log::debug!(target: "proxy", "Upstream 127.0.0.1:{} unreachable: {err}", site.port);
            html_response(StatusCode::OK, default_page(&host))
        }
    }
}

pub(crate) fn inject_connection_headers(headers: &mut HeaderMap, ip: &str, tls: bool) {
    if let Ok(value) = HeaderValue::from_str(ip) {
        headers.insert(HeaderName::from_static(REMOTE_ADDR_HEADER), value);
    }
    headers.insert(
        HeaderName::from_static(SSL_HEADER),
        HeaderValue::from_static(if tls { "true" } else { "false" }),
    );
}

/// Relay a buffered/streamed upstream response: surface early hints, drop
/// hop-by-hop headers, stream the body.
fn relay_response(upstream: Response<Incoming>) -> Response<Body> {
    let (parts, body) = upstream.into_parts();

    let hints: Vec<String> = parts
        .headers
        .get(EARLY_HINTS_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(parse_early_hints)
        .unwrap_or_default();

    let mut builder = Response::builder().status(parts.status);
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end_headers(&parts.headers, headers);
        // hyper cannot send a standalone 103, so parsed hints ride along as
        // Link headers on the final head; the marker header never leaves.
        for link in hints {
            if let Ok(value) = HeaderValue::from_str(&link) {
                headers.append(http::header::LINK, value);
            }
        }
    }
    builder
        .body(Body::new(body))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// WebSocket (and other `Upgrade: websocket`) forwarding: send the upgrade
/// request upstream over a dedicated HTTP/1.1 connection, and on `101` splice
/// both upgraded streams into a raw bidirectional pipe. No compression, no
/// header rewriting beyond the hop-by-hop set.
async fn handle_upgrade<B>(
    state: Arc<ProxyState>,
    ip: String,
    port: u16,
    mut req: Request<B>,
) -> Response<Body>
where
    B: Send + 'static,
{
    if !state.ws_acquire(&ip) {
        log::warn!(target: "proxy", "WebSocket cap reached for {ip}");
        return deny_response(DenyReason::RateLimit);
    }
    let guard = WsSlot {
        state: state.clone(),
        ip: ip.clone(),
        armed: true,
    };

    let host = request_host(&req);
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let downstream_upgrade = hyper::upgrade::on(&mut req);

    let mut builder = Request::builder()
        .method(req.method().clone())
        .uri(path_and_query);
    if let Some(headers) = builder.headers_mut() {
        copy_end_to_end_headers(req.headers(), headers);
        if !headers.contains_key(HOST) {
            if let Ok(value) = HeaderValue::from_str(&host) {
                headers.insert(HOST, value);
            }
        }
        // The upgrade negotiation itself must cross to the backend.
        headers.insert(CONNECTION, HeaderValue::from_static("Upgrade"));
        if let Some(upgrade) = req.headers().get(UPGRADE) {
            headers.insert(UPGRADE, upgrade.clone());
        }
        inject_connection_headers(headers, &ip, true);
    }
    let upstream_req = match builder.body(Empty::<bytes::Bytes>::new()) {
        Ok(r) => r,
        Err(_) => return html_response(StatusCode::OK, default_page(&host)),
    };

    let stream = match tokio::net::TcpStream::connect(("127.0.0.1", port)).await {
        Ok(s) => s,
        Err(err) => {
            log::debug!(target: "proxy", "WS backend 127.0.0.1:{port} unreachable: {err}");
            return html_response(StatusCode::OK, default_page(&host));
        }
    };
    let (mut sender, conn) = match hyper::client::conn::http1::handshake(TokioIo::new(stream)).await
    {
        Ok(pair) => pair,
        Err(err) => {
            log::debug!(target: "proxy", "WS handshake with backend failed: {err}");
            return html_response(StatusCode::OK, default_page(&host));
        }
    };
    tokio::spawn(async move {
        if let Err(err) = conn.with_upgrades().await {
            log::debug!(target: "proxy", "WS backend connection ended: {err}");
        }
    });

    let mut upstream_resp = match sender.send_request(upstream_req).await {
        Ok(r) => r,
        Err(err) => {
            log::debug!(target: "proxy", "WS upgrade request failed: {err}");
            return html_response(StatusCode::OK, default_page(&host));
        }
    };

    if upstream_resp.status() != StatusCode::SWITCHING_PROTOCOLS {
        // Backend declined the upgrade; relay its answer as-is.
        return relay_response(upstream_resp);
    }

    let upstream_upgrade = hyper::upgrade::on(&mut upstream_resp);
    let mut guard = guard;
    guard.armed = false; // the pipe task owns the slot now
    let pipe_state = state.clone();
    let pipe_ip = ip.clone();
    tokio::spawn(async move {
        let pair = tokio::join!(downstream_upgrade, upstream_upgrade);
        match pair {
            (Ok(down), Ok(up)) => {
                let mut down = TokioIo::new(down);
                let mut up = TokioIo::new(up);
                if let Err(err) = tokio::io::copy_bidirectional(&mut down, &mut up).await {
                    log::debug!(target: "proxy", "WS pipe closed: {err}");
                }
            }
            (down, up) => {
                if let Err(err) = down.and(up) {
                    log::debug!(target: "proxy", "WS upgrade did not complete: {err}");
                }
            }
        }
        pipe_state.ws_release(&pipe_ip);
    });

    // Hand the 101 back downstream with the backend's headers intact.
    let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in upstream_resp.headers() {
            headers.append(name.clone(), value.clone());
        }
    }
    builder
        .body(Body::empty())
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Releases the per-IP WebSocket slot unless ownership moved to the pipe.
struct WsSlot {
    state: Arc<ProxyState>,
    ip: String,
    armed: bool,
}

impl Drop for WsSlot {
    fn drop(&mut self) {
        if self.armed {
            self.state.ws_release(&self.ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_set_is_exact() {
        let mut from = HeaderMap::new();
        from.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        from.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        from.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        from.insert(UPGRADE, HeaderValue::from_static("websocket"));
        from.insert("proxy-connection", HeaderValue::from_static("close"));
        from.insert("proxy-authenticate", HeaderValue::from_static("Basic"));
        from.insert("trailer", HeaderValue::from_static("Expires"));
        from.insert(EARLY_HINTS_HEADER, HeaderValue::from_static("[]"));
        from.insert("content-type", HeaderValue::from_static("text/plain"));
        from.insert("x-custom", HeaderValue::from_static("kept"));

        let mut to = HeaderMap::new();
        copy_end_to_end_headers(&from, &mut to);

        assert_eq!(to.len(), 2);
        assert!(to.contains_key("content-type"));
        assert!(to.contains_key("x-custom"));
    }

    #[test]
    fn injected_headers_are_exactly_the_connection_pair() {
        let mut headers = HeaderMap::new();
        inject_connection_headers(&mut headers, "203.0.113.7", true);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[REMOTE_ADDR_HEADER], "203.0.113.7");
        assert_eq!(headers[SSL_HEADER], "true");

        inject_connection_headers(&mut headers, "203.0.113.7", false);
        assert_eq!(headers[SSL_HEADER], "false");
    }

    #[test]
    fn early_hints_parse_json_and_comma_forms() {
        let json = r#"["</style.css>; rel=preload; as=style", "</app.js>; rel=preload; as=script"]"#;
        assert_eq!(parse_early_hints(json).len(), 2);

        let listed = "</style.css>; rel=preload, </app.js>; rel=preload";
        let parsed = parse_early_hints(listed);
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], "</style.css>; rel=preload");

        assert!(parse_early_hints("").is_empty());
    }

    use http_body_util::BodyExt;
    use odac_common::wire::{ProxySite, ProxySnapshot};

    /// A backend that echoes the proxy-injected connection headers and
    /// whether hop-by-hop noise leaked through.
    async fn spawn_backend() -> u16 {
        use axum::routing::get;

        let app = axum::Router::new()
            .route(
                "/echo",
                get(|headers: HeaderMap| async move {
                    let remote = headers
                        .get(REMOTE_ADDR_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let ssl = headers
                        .get(SSL_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("-")
                        .to_string();
                    let leaked = headers.contains_key("proxy-connection");
                    format!("remote={remote};ssl={ssl};leaked={leaked}")
                }),
            )
            .route(
                "/hints",
                get(|| async {
                    (
                        [(
                            EARLY_HINTS_HEADER,
                            r#"["</app.css>; rel=preload; as=style"]"#,
                        )],
                        "page needing hints",
                    )
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        port
    }

    fn proxy_state(domain: &str, port: u16) -> Arc<ProxyState> {
        let state = ProxyState::new().unwrap();
        let mut snapshot = ProxySnapshot::default();
        snapshot.websites.insert(
            domain.to_string(),
            ProxySite {
                port,
                up: true,
                cert: None,
            },
        );
        state.apply(snapshot);
        state
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([203, 0, 113, 5], 40123))
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn forwards_and_rewrites_headers_end_to_end() {
        let port = spawn_backend().await;
        let state = proxy_state("example.com", port);

        let req = Request::builder()
            .uri("/echo")
            .header(HOST, "example.com")
            .header("proxy-connection", "keep-alive")
            .body(Body::empty())
            .unwrap();
        let response = handle(state, peer(), true, req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_text(response).await;
        assert!(body.contains("remote=203.0.113.5"), "got: {body}");
        assert!(body.contains("ssl=true"));
        assert!(body.contains("leaked=false"), "hop-by-hop header crossed");
    }

    #[tokio::test]
    async fn subdomains_reach_the_parent_site_backend() {
        let port = spawn_backend().await;
        let state = proxy_state("example.com", port);

        let req = Request::builder()
            .uri("/echo")
            .header(HOST, "api.example.com")
            .body(Body::empty())
            .unwrap();
        let response = handle(state, peer(), true, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("ssl=true"));
    }

    #[tokio::test]
    async fn early_hints_become_link_headers_and_the_marker_is_stripped() {
        let port = spawn_backend().await;
        let state = proxy_state("example.com", port);

        let req = Request::builder()
            .uri("/hints")
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let response = handle(state, peer(), true, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[http::header::LINK],
            "</app.css>; rel=preload; as=style"
        );
        assert!(response.headers().get(EARLY_HINTS_HEADER).is_none());
    }

    #[tokio::test]
    async fn unknown_hosts_and_down_backends_get_the_default_page() {
        let port = spawn_backend().await;
        let state = proxy_state("example.com", port);

        let stranger = Request::builder()
            .uri("/")
            .header(HOST, "stranger.net")
            .body(Body::empty())
            .unwrap();
        let response = handle(state.clone(), peer(), true, stranger).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("stranger.net"));

        // A site whose backend is not reachable serves the default page
        // instead of a 5xx.
        let dead = proxy_state("dead.example", 1);
        let req = Request::builder()
            .uri("/")
            .header(HOST, "dead.example")
            .body(Body::empty())
            .unwrap();
        let response = handle(dead, peer(), true, req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response).await.contains("dead.example"));
    }

    #[tokio::test]
    async fn blacklisted_peers_are_refused_before_forwarding() {
        let port = spawn_backend().await;
        let state = proxy_state("example.com", port);
        let mut snapshot = ProxySnapshot::default();
        snapshot.websites.insert(
            "example.com".to_string(),
            ProxySite {
                port,
                up: true,
                cert: None,
            },
        );
        snapshot.firewall.blacklist.push("203.0.113.5".to_string());
        state.apply(snapshot);

        let req = Request::builder()
            .uri("/echo")
            .header(HOST, "example.com")
            .body(Body::empty())
            .unwrap();
        let response = handle(state, peer(), true, req).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(response.headers()[CONNECTION], "close");
    }
}
