//! # Control IPC
//!
//! The authenticated command channel: loopback TCP 1453 and a Unix socket at
//! `~/.odac/run/api.sock`, both demultiplexing one command table. A request
//! is a single JSON document `{auth, action, data}`; handlers may emit
//! progress frames (JSON + CRLF) before the final response closes the
//! connection.

use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use odac_common::net::normalize_ip;
use odac_common::util::short_id;
use odac_common::wire::{IpcProgress, IpcRequest, IpcResponse};

use crate::core::Core;

/// The loopback control port.
pub const CONTROL_PORT: u16 = 1453;

/// Out-of-band progress emitter handed to handlers.
#[derive(Clone)]
pub struct Progress {
    id: String,
    tx: Option<mpsc::UnboundedSender<IpcProgress>>,
}

impl Progress {
    pub fn new(id: String, tx: mpsc::UnboundedSender<IpcProgress>) -> Self {
        Self { id, tx: Some(tx) }
    }

    /// A progress sink that drops frames (internal callers, tests).
    pub fn discard() -> Self {
        Self {
            id: short_id(),
            tx: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn emit(&self, process: &str, status: &str, message: &str) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(IpcProgress {
                id: self.id.clone(),
                process: process.to_string(),
                status: status.to_string(),
                message: message.to_string(),
            });
        }
    }
}

type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, String>> + Send>>;
type Handler = fn(Arc<Core>, Vec<Value>, Progress) -> HandlerFuture;

fn arg_str(data: &[Value], index: usize, name: &str) -> Result<String, String> {
    data.get(index)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| format!("missing argument: {name}"))
}

macro_rules! handler {
    ($name:ident, $core:ident, $data:ident, $progress:ident, $body:expr) => {
        fn $name($core: Arc<Core>, $data: Vec<Value>, $progress: Progress) -> HandlerFuture {
            Box::pin(async move { $body })
        }
    };
}

handler!(web_create, core, data, progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.websites
        .create(&domain, &progress)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(web_delete, core, data, progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.websites
        .delete(&domain, &progress)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(web_start, core, data, _progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.websites
        .start(&domain)
        .await
        .map(|_| Value::from(format!("Website {domain} started.")))
        .map_err(|e| e.to_string())
});

handler!(web_stop, core, data, _progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.websites
        .stop(&domain)
        .await
        .map(|_| Value::from(format!("Website {domain} stopped.")))
        .map_err(|e| e.to_string())
});

handler!(web_list, core, _data, _progress, {
    Ok(Value::Array(core.websites.list().await))
});

handler!(web_deploy, core, data, progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.websites
        .deploy(&domain, &progress)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(web_logs, core, data, _progress, {
    let domain = arg_str(&data, 0, "domain")?;
    let tail = data.get(1).and_then(|v| v.as_u64()).unwrap_or(100) as usize;
    let known = core
        .config
        .web
        .read(|w| w.websites.contains_key(&domain))
        .await;
    if !known {
        return Err(format!("Website {domain} not found."));
    }
    let path = core.paths.domain_log(&domain);
    let raw = std::fs::read_to_string(&path).unwrap_or_default();
    let lines: Vec<&str> = raw.lines().collect();
    let start = lines.len().saturating_sub(tail);
    Ok(Value::from(lines[start..].join("\n")))
});

handler!(service_create, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    let source = arg_str(&data, 1, "source")?;
    core.services
        .create_script(&name, std::path::Path::new(&source))
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(service_install, core, data, progress, {
    let recipe = arg_str(&data, 0, "recipe")?;
    core.services
        .install(&recipe, &progress)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(service_start, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    core.services
        .start(&name)
        .await
        .map(|_| Value::from(format!("Service {name} started.")))
        .map_err(|e| e.to_string())
});

handler!(service_stop, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    core.services
        .stop(&name)
        .await
        .map(|_| Value::from(format!("Service {name} stopped.")))
        .map_err(|e| e.to_string())
});

handler!(service_delete, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    core.services
        .delete(&name)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(service_list, core, _data, _progress, {
    Ok(Value::Array(core.services.list().await))
});

handler!(service_exec, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    let command = arg_str(&data, 1, "command")?;
    core.services
        .exec(&name, &command)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

handler!(service_logs, core, data, _progress, {
    let name = arg_str(&data, 0, "name")?;
    let tail = data
        .get(1)
        .and_then(|v| v.as_u64())
        .unwrap_or(100) as usize;
    core.services
        .logs(&name, tail)
        .await
        .map(Value::from)
        .map_err(|e| e.to_string())
});

/// `firewall.block` and `firewall.allow` are mutually exclusive per IP:
/// entering one list removes the address from the other.
async fn firewall_update(core: &Core, ip: &str, into_blacklist: Option<bool>, remove: bool) {
    let ip = normalize_ip(ip);
    core.config
        .firewall
        .mutate(|policy| {
            policy.blacklist.retain(|b| b != &ip);
            policy.whitelist.retain(|w| w != &ip);
            if !remove {
                match into_blacklist {
                    Some(true) => policy.blacklist.push(ip.clone()),
                    Some(false) => policy.whitelist.push(ip.clone()),
                    None => {}
                }
            }
        })
        .await;
    core.proxy.request_sync();
}

handler!(firewall_block, core, data, _progress, {
    let ip = arg_str(&data, 0, "ip")?;
    firewall_update(&core, &ip, Some(true), false).await;
    Ok(Value::from(format!("{ip} blocked.")))
});

handler!(firewall_unblock, core, data, _progress, {
    let ip = arg_str(&data, 0, "ip")?;
    firewall_update(&core, &ip, Some(true), true).await;
    Ok(Value::from(format!("{ip} unblocked.")))
});

handler!(firewall_allow, core, data, _progress, {
    let ip = arg_str(&data, 0, "ip")?;
    firewall_update(&core, &ip, Some(false), false).await;
    Ok(Value::from(format!("{ip} whitelisted.")))
});

handler!(firewall_unallow, core, data, _progress, {
    let ip = arg_str(&data, 0, "ip")?;
    firewall_update(&core, &ip, Some(false), true).await;
    Ok(Value::from(format!("{ip} removed from whitelist.")))
});

handler!(firewall_status, core, _data, _progress, {
    let policy = core.config.firewall.read(|p| p.clone()).await;
    serde_json::to_value(&policy).map_err(|e| e.to_string())
});

handler!(ssl_renew, core, data, _progress, {
    let domain = arg_str(&data, 0, "domain")?;
    core.ssl.request_renewal(&domain).await;
    Ok(Value::from(format!("Renewal for {domain} requested.")))
});

handler!(mail_send, core, data, _progress, {
    let from = arg_str(&data, 0, "from")?;
    let to = arg_str(&data, 1, "to")?;
    let subject = arg_str(&data, 2, "subject")?;
    let body = arg_str(&data, 3, "body")?;
    core.mail
        .send(&from, &to, &subject, &body)
        .await
        .map(|_| Value::from("Mail queued."))
        .map_err(|e| e.to_string())
});

handler!(hub_link, core, data, _progress, {
    let token = arg_str(&data, 0, "token")?;
    let secret = arg_str(&data, 1, "secret")?;
    let endpoint = data.get(2).and_then(|v| v.as_str()).map(String::from);
    core.config
        .hub
        .mutate(|hub| {
            hub.token = token;
            hub.secret = secret;
            if let Some(endpoint) = endpoint {
                hub.endpoint = Some(endpoint);
            }
        })
        .await;
    Ok(Value::from("Hub credential stored."))
});

/// Manage the dynamic allow-list of the control TCP listener.
handler!(server_allow, core, data, _progress, {
    let ip = normalize_ip(&arg_str(&data, 0, "ip")?);
    core.config
        .server
        .mutate(|server| {
            if !server.allowed_ips.contains(&ip) {
                server.allowed_ips.push(ip.clone());
            }
        })
        .await;
    Ok(Value::from(format!("{ip} allowed on the control channel.")))
});

handler!(server_unallow, core, data, _progress, {
    let ip = normalize_ip(&arg_str(&data, 0, "ip")?);
    core.config
        .server
        .mutate(|server| {
            server.allowed_ips.retain(|allowed| allowed != &ip);
        })
        .await;
    Ok(Value::from(format!("{ip} removed from the control channel.")))
});

handler!(server_status, core, _data, _progress, {
    let (instance, channel) = core
        .config
        .server
        .read(|s| (s.instance_id.clone(), s.channel.clone()))
        .await;
    let websites = core.config.web.read(|w| w.websites.len()).await;
    let services = core.config.services.read(|s| s.services.len()).await;
    let engine_up = core.engine.available().await;

    // Per-container usage for everything the engine currently runs for us.
    let mut containers = serde_json::Map::new();
    if engine_up {
        if let Ok(running) = core.engine.list().await {
            for summary in running {
                let Some(name) = summary
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())
                else {
                    continue;
                };
                if !name.starts_with("odac") {
                    continue;
                }
                if let Ok(stats) = core.engine.get_stats(&name).await {
                    if let Ok(value) = serde_json::to_value(&stats) {
                        containers.insert(name, value);
                    }
                }
            }
        }
    }

    Ok(json!({
        "instance": instance,
        "channel": channel,
        "uptimeSecs": core.started_at.elapsed().as_secs(),
        "engine": engine_up,
        "websites": websites,
        "services": services,
        "containers": containers,
    }))
});

handler!(server_stop, core, _data, _progress, {
    log::warn!(target: "ipc", "server.stop received; shutting down");
    core.shutdown.cancel();
    Ok(Value::from("Stopping."))
});

handler!(server_update, core, _data, progress, {
    crate::updater::run_update(core, progress)
        .await
        .map_err(|e| e.to_string())
});

fn command_table() -> &'static HashMap<&'static str, Handler> {
    static TABLE: OnceLock<HashMap<&'static str, Handler>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut table: HashMap<&'static str, Handler> = HashMap::new();
        table.insert("web.create", web_create);
        table.insert("web.delete", web_delete);
        table.insert("web.start", web_start);
        table.insert("web.stop", web_stop);
        table.insert("web.list", web_list);
        table.insert("web.deploy", web_deploy);
        table.insert("web.logs", web_logs);
        table.insert("service.create", service_create);
        table.insert("service.install", service_install);
        table.insert("service.start", service_start);
        table.insert("service.stop", service_stop);
        table.insert("service.delete", service_delete);
        table.insert("service.list", service_list);
        table.insert("service.exec", service_exec);
        table.insert("service.logs", service_logs);
        table.insert("firewall.block", firewall_block);
        table.insert("firewall.unblock", firewall_unblock);
        table.insert("firewall.allow", firewall_allow);
        table.insert("firewall.unallow", firewall_unallow);
        table.insert("firewall.status", firewall_status);
        table.insert("ssl.renew", ssl_renew);
        table.insert("mail.send", mail_send);
        table.insert("hub.link", hub_link);
        table.insert("server.allow", server_allow);
        table.insert("server.unallow", server_unallow);
        table.insert("server.status", server_status);
        table.insert("server.stop", server_stop);
        table.insert("server.update", server_update);
        table
    })
}

/// Serve the control channel on an already-bound TCP listener.
pub async fn serve_tcp(
    core: Arc<Core>,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!(target: "ipc", "Accept error: {err}");
                    continue;
                }
            }
        };
        let core = core.clone();
        tokio::spawn(handle_connection(core, stream, Some(peer.ip())));
    }
}

/// Serve the control channel on the Unix socket (mode 0666 so the CLI works
/// from any local user; the auth token is the actual credential).
#[cfg(unix)]
pub async fn serve_unix(
    core: Arc<Core>,
    path: std::path::PathBuf,
    shutdown: CancellationToken,
) -> Result<()> {
    let _ = std::fs::remove_file(&path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = tokio::net::UnixListener::bind(&path)?;
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o666))?;
    }
    log::info!(target: "ipc", "Unix control socket at {}", path.display());

    loop {
        let (stream, _) = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    log::warn!(target: "ipc", "Accept error: {err}");
                    continue;
                }
            }
        };
        let core = core.clone();
        tokio::spawn(handle_connection(core, stream, None));
    }
    let _ = std::fs::remove_file(&path);
    Ok(())
}

/// Whether a TCP peer may talk to us at all: loopback, or explicitly
/// allow-listed. Unix-socket peers skip this check.
async fn remote_allowed(core: &Core, remote: Option<IpAddr>) -> bool {
    let Some(addr) = remote else {
        return true;
    };
    if addr.is_loopback() {
        return true;
    }
    let ip = normalize_ip(&addr.to_string());
    core.config
        .server
        .read(|s| s.allowed_ips.iter().any(|allowed| allowed == &ip))
        .await
}

async fn handle_connection<S>(core: Arc<Core>, stream: S, remote: Option<IpAddr>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    if let Err(err) = serve_request(core, stream, remote).await {
        // Connection resets are expected client behavior.
        let reset = err
            .downcast_ref::<std::io::Error>()
            .map(|io| io.kind() == std::io::ErrorKind::ConnectionReset)
            .unwrap_or(false);
        if !reset {
            log::warn!(target: "ipc", "Control connection failed: {err:#}");
        }
    }
}

async fn serve_request<S>(core: Arc<Core>, stream: S, remote: Option<IpAddr>) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    if line.trim().is_empty() {
        return Ok(());
    }

    let id = short_id();
    let respond = |response: IpcResponse| serde_json::to_string(&response).unwrap_or_default();

    let request: IpcRequest = match serde_json::from_str(line.trim()) {
        Ok(request) => request,
        Err(_) => {
            write_half
                .write_all(respond(IpcResponse::err(id, "unknown_action")).as_bytes())
                .await?;
            return Ok(());
        }
    };

    let expected = core.config.server.read(|s| s.auth.clone()).await;
    let authorized =
        remote_allowed(&core, remote).await && !expected.is_empty() && request.auth == expected;
    if !authorized {
        write_half
            .write_all(respond(IpcResponse::err(id, "unauthorized")).as_bytes())
            .await?;
        return Ok(());
    }

    let Some(handler) = command_table().get(request.action.as_str()) else {
        write_half
            .write_all(respond(IpcResponse::err(id, "unknown_action")).as_bytes())
            .await?;
        return Ok(());
    };

    log::info!(target: "ipc", "Action {} [{}]", request.action, id);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let progress = Progress::new(id.clone(), tx);
    let mut task = tokio::spawn(handler(core.clone(), request.data, progress));

    // Stream progress frames as they arrive, then send the final response.
    let mut progress_open = true;
    let outcome = loop {
        tokio::select! {
            frame = rx.recv(), if progress_open => {
                match frame {
                    Some(frame) => {
                        let mut encoded = serde_json::to_string(&frame).unwrap_or_default();
                        encoded.push_str("\r\n");
                        write_half.write_all(encoded.as_bytes()).await?;
                    }
                    None => progress_open = false,
                }
            }
            finished = &mut task => {
                break finished;
            }
        }
    };
    // Drain anything emitted just before completion.
    while let Ok(frame) = rx.try_recv() {
        let mut encoded = serde_json::to_string(&frame).unwrap_or_default();
        encoded.push_str("\r\n");
        write_half.write_all(encoded.as_bytes()).await?;
    }

    let response = match outcome {
        Ok(Ok(message)) => IpcResponse {
            id,
            result: true,
            message,
        },
        Ok(Err(message)) => IpcResponse::err(id, message),
        Err(join_err) => IpcResponse::err(id, format!("handler panicked: {join_err}")),
    };
    write_half.write_all(respond(response).as_bytes()).await?;
    write_half.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::collaborators::{DisabledDns, DisabledIssuer, DisabledMail, HubRecipes};
    use crate::core::SslCoordinator;
    use crate::engine::Engine;
    use crate::proxy_sync::ProxyLink;
    use crate::services::ServiceSupervisor;
    use crate::websites::WebsiteSupervisor;
    use odac_common::config::ConfigStore;
    use odac_common::paths::OdacPaths;
    use tokio::io::AsyncReadExt;

    async fn test_core(root: &std::path::Path) -> Arc<Core> {
        let paths = OdacPaths::rooted(root);
        paths.ensure_layout().unwrap();
        let config = Arc::new(ConfigStore::load(&paths.config_dir()).unwrap());
        config
            .server
            .mutate(|s| {
                s.auth = "ab".repeat(32);
                s.instance_id = "test-instance".into();
            })
            .await;

        let engine = Arc::new(Engine::new());
        let notify = Arc::new(tokio::sync::Notify::new());
        let ssl = Arc::new(SslCoordinator::new(
            Arc::new(DisabledIssuer),
            config.clone(),
            notify.clone(),
        ));
        let proxy = ProxyLink::new(
            paths.clone(),
            config.clone(),
            notify,
            "test-instance".into(),
            1454,
        );
        let websites = WebsiteSupervisor::new(
            paths.clone(),
            config.clone(),
            engine.clone(),
            Arc::new(DisabledDns),
            ssl.clone(),
            proxy.clone(),
        );
        let services = ServiceSupervisor::new(
            paths.clone(),
            config.clone(),
            engine.clone(),
            Arc::new(HubRecipes::new(None, String::new(), String::new())),
        );

        Arc::new(Core {
            paths,
            config,
            engine,
            websites,
            services,
            ssl,
            mail: Arc::new(DisabledMail),
            proxy,
            shutdown: CancellationToken::new(),
            started_at: std::time::Instant::now(),
            update: tokio::sync::Mutex::new(None),
        })
    }

    async fn roundtrip(core: Arc<Core>, payload: &str) -> (Vec<IpcProgress>, IpcResponse) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_tcp(core, listener, shutdown.clone()));

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("{payload}\n").as_bytes())
            .await
            .unwrap();
        let mut raw = String::new();
        client.read_to_string(&mut raw).await.unwrap();
        shutdown.cancel();
        let _ = server.await;

        let mut frames = Vec::new();
        let mut response = None;
        for part in raw.split("\r\n") {
            if part.is_empty() {
                continue;
            }
            // The two frame shapes are disjoint: progress has process/status,
            // the response has result.
            if let Ok(frame) = serde_json::from_str::<IpcProgress>(part) {
                frames.push(frame);
            } else {
                response =
                    Some(serde_json::from_str::<IpcResponse>(part).expect("final response"));
            }
        }
        (frames, response.expect("a final response"))
    }

    #[tokio::test]
    async fn bad_auth_is_unauthorized() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path()).await;
        let (_, response) = roundtrip(
            core,
            r#"{"auth":"wrong","action":"server.status","data":[]}"#,
        )
        .await;
        assert!(!response.result);
        assert_eq!(response.message, "unauthorized");
    }

    #[tokio::test]
    async fn unknown_actions_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path()).await;
        let auth = "ab".repeat(32);
        let (_, response) = roundtrip(
            core,
            &format!(r#"{{"auth":"{auth}","action":"no.such.action","data":[]}}"#),
        )
        .await;
        assert!(!response.result);
        assert_eq!(response.message, "unknown_action");
    }

    #[tokio::test]
    async fn server_status_answers_with_counts() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path()).await;
        let auth = "ab".repeat(32);
        let (_, response) = roundtrip(
            core,
            &format!(r#"{{"auth":"{auth}","action":"server.status","data":[]}}"#),
        )
        .await;
        assert!(response.result);
        assert_eq!(response.message["websites"], 0);
        assert_eq!(response.message["instance"], "test-instance");
    }

    #[tokio::test]
    async fn firewall_lists_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path()).await;
        let auth = "ab".repeat(32);

        let (_, allow) = roundtrip(
            core.clone(),
            &format!(r#"{{"auth":"{auth}","action":"firewall.allow","data":["203.0.113.9"]}}"#),
        )
        .await;
        assert!(allow.result);

        let (_, block) = roundtrip(
            core.clone(),
            &format!(r#"{{"auth":"{auth}","action":"firewall.block","data":["203.0.113.9"]}}"#),
        )
        .await;
        assert!(block.result);

        let policy = core.config.firewall.read(|p| p.clone()).await;
        assert!(policy.blacklist.contains(&"203.0.113.9".to_string()));
        assert!(!policy.whitelist.contains(&"203.0.113.9".to_string()));
    }

    #[tokio::test]
    async fn web_create_emits_progress_frames() {
        let dir = tempfile::tempdir().unwrap();
        let core = test_core(dir.path()).await;
        let auth = "ab".repeat(32);
        let (frames, response) = roundtrip(
            core.clone(),
            &format!(r#"{{"auth":"{auth}","action":"web.create","data":["example.com"]}}"#),
        )
        .await;
        assert!(response.result, "create failed: {:?}", response.message);
        assert_eq!(response.message, "Website example.com created.");
        assert!(frames.iter().any(|f| f.process == "domain" && f.status == "ok"));
        assert!(frames.iter().any(|f| f.process == "ssl"));

        let registered = core
            .config
            .web
            .read(|w| w.websites.contains_key("example.com"))
            .await;
        assert!(registered);
    }
}
