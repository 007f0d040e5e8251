//! # odac_common
//!
//! Shared foundation for the odac platform daemon and its proxy process.
//!
//! ## Contained Modules:
//! - **`config`**: the durable, modular JSON configuration store with atomic
//!   writes, backup promotion and a periodic dirty flusher.
//! - **`firewall`**: IP allow/deny lists plus a sliding-window rate limiter.
//! - **`wire`**: the control-channel frames and the proxy configuration
//!   snapshot exchanged between the daemon and the proxy process.
//! - **`paths`**: the `~/.odac` filesystem layout.
//! - **`logging`**: fern-based logger setup shared by both binaries.
//! - **`util`**: epoch timestamps, random hex tokens, HMAC signing.
//! - **`net`**: IP normalization and free-port probing.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod config;
pub mod firewall;
pub mod logging;
pub mod net;
pub mod paths;
pub mod util;
pub mod wire;
