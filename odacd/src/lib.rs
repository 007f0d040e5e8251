//! # odacd
//!
//! The odac platform daemon: turns declarative domain/service configuration
//! into a running fleet of websites, script services and app containers,
//! fronted by a TLS-terminating reverse proxy and controlled over an
//! authenticated local channel.
//!
//! ## Core Responsibilities:
//! - **Lifecycle Supervision**: per-domain website backends and per-service
//!   workloads with health checks, restart backoff and crash recovery.
//! - **Reverse Proxy**: the `odac-proxy` child process terminating TLS on
//!   443, redirecting on 80, and forwarding HTTP/1.1+HTTP/2, WebSocket and
//!   SSE traffic to tenant backends.
//! - **Control IPC**: loopback TCP and Unix-socket command channel with
//!   per-request auth and streaming progress frames.
//! - **Self-Update**: rolling container upgrade with a socket handshake,
//!   stability window and rollback.

pub mod core;
pub mod engine;
pub mod ipc;
pub mod process;
pub mod proxy;
pub mod proxy_sync;
pub mod services;
pub mod updater;
pub mod websites;
