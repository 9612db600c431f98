//! Wakegate - a front door for an on-demand game server
//!
//! This library provides a TCP gate that:
//! - Splices clients straight through to the backend while it is reachable
//! - Answers status queries itself while the backend is down or booting
//! - Boots the backend when an authorized player tries to log in
//! - Shuts the backend down after it has been empty for a configurable time
//! - Probes the backend out of band and never hangs in a transitional state

pub mod auth;
pub mod commands;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod lifecycle;
pub mod protocol;
pub mod proxy;

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
