//! The proxy side of the daemon control channel: a single `POST /config`
//! endpoint receiving the full configuration snapshot, served on a Unix
//! socket on Linux and loopback HTTP elsewhere.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use tokio_util::sync::CancellationToken;

use odac_common::wire::ProxySnapshot;

use super::ProxyState;

pub fn router(state: Arc<ProxyState>) -> Router {
    Router::new()
        .route("/config", post(apply_config))
        .with_state(state)
}

async fn apply_config(
    State(state): State<Arc<ProxyState>>,
    Json(snapshot): Json<ProxySnapshot>,
) -> StatusCode {
    let sites = snapshot.websites.len();
    state.apply(snapshot);
    log::info!(target: "proxy", "Applied config snapshot ({sites} sites)");
    StatusCode::OK
}

/// Serve the control endpoint on a Unix socket. The stale socket file from a
/// previous instance is removed before binding.
#[cfg(unix)]
pub async fn serve_unix(
    path: std::path::PathBuf,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(&path)?;
    log::info!(target: "proxy", "Control endpoint on {}", path.display());

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Serve the control endpoint on loopback TCP (non-Linux platforms).
pub async fn serve_tcp(
    port: u16,
    state: Arc<ProxyState>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    log::info!(target: "proxy", "Control endpoint on 127.0.0.1:{port}");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http::Request;
    use odac_common::wire::ProxySite;
    use tower::ServiceExt;

    #[tokio::test]
    async fn snapshot_post_replaces_routing_state() {
        let state = ProxyState::new().unwrap();
        assert!(state.resolve_site("example.com").is_none());

        let mut snapshot = ProxySnapshot::default();
        snapshot.websites.insert(
            "example.com".into(),
            ProxySite {
                port: 12345,
                up: true,
                cert: None,
            },
        );

        let app = router(state.clone());
        let req = Request::post("/config")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&snapshot).unwrap()))
            .unwrap();
        let response = app.oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (_, site) = state.resolve_site("example.com").expect("site installed");
        assert_eq!(site.port, 12345);
    }
}
