//! Wire formats: control-channel frames and the proxy configuration
//! snapshot.
//!
//! Control channel, one JSON document per frame:
//!
//! ```text
//! Request  := {"auth":"<hex32>","action":"<dotted.name>","data":[...]}
//! Progress := {"id":"..","process":"..","status":"ok|err|info","message":".."}\r\n
//! Response := {"id":"..","result":<bool>,"message":<string|object>}
//! ```
//!
//! Progress frames are `\r\n`-terminated; the final response is not and
//! closes the connection.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::modules::{CertFiles, FirewallPolicy, SslModule};

/// A control-channel request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcRequest {
    #[serde(default)]
    pub auth: String,
    pub action: String,
    #[serde(default)]
    pub data: Vec<Value>,
}

/// Out-of-band progress frame emitted while a handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcProgress {
    pub id: String,
    pub process: String,
    pub status: String,
    pub message: String,
}

/// Final handler response; one per connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpcResponse {
    pub id: String,
    pub result: bool,
    pub message: Value,
}

impl IpcResponse {
    pub fn ok(id: impl Into<String>, message: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            result: true,
            message: message.into(),
        }
    }

    pub fn err(id: impl Into<String>, message: impl Into<Value>) -> Self {
        Self {
            id: id.into(),
            result: false,
            message: message.into(),
        }
    }
}

/// Routing facts of one website as the proxy needs them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySite {
    /// Backend port on 127.0.0.1.
    pub port: u16,
    /// Whether the backend is currently up; down sites get the default page.
    pub up: bool,
    /// Key/cert for SNI; absent means the default server certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert: Option<CertFiles>,
}

/// Full proxy configuration pushed by the daemon over `POST /config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxySnapshot {
    #[serde(default)]
    pub websites: HashMap<String, ProxySite>,
    #[serde(default)]
    pub firewall: FirewallPolicy,
    #[serde(default)]
    pub ssl: SslModule,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_tolerates_missing_fields() {
        let req: IpcRequest =
            serde_json::from_str(r#"{"action":"server.status"}"#).expect("parse");
        assert!(req.auth.is_empty());
        assert!(req.data.is_empty());
    }

    #[test]
    fn response_shape_matches_the_protocol() {
        let resp = IpcResponse::err("ab12", "unauthorized");
        let json = serde_json::to_value(&resp).unwrap();
        assert_eq!(json["id"], "ab12");
        assert_eq!(json["result"], false);
        assert_eq!(json["message"], "unauthorized");
    }

    #[test]
    fn snapshot_round_trips() {
        let mut snap = ProxySnapshot::default();
        snap.websites.insert(
            "example.com".into(),
            ProxySite {
                port: 10001,
                up: true,
                cert: None,
            },
        );
        let raw = serde_json::to_string(&snap).unwrap();
        let back: ProxySnapshot = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.websites["example.com"].port, 10001);
    }
}
