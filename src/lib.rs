//! Spawnpool - A reverse proxy that provisions its own backend pool
//!
//! This library provides a reverse proxy that:
//! - Starts backend servers on demand, each on an OS-assigned local port
//! - Caps the number of live backends and spreads load across them once full
//! - Health-checks a backend before every forwarded request
//! - Stamps each request with an `X-Request-ID` and counts echo mismatches
//! - Optionally retires every backend after a single request
//! - Stops the whole pool, and reports per-backend usage, on `/stop`

pub mod backend;
pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod lifecycle;
pub mod loadgen;
pub mod pool;
pub mod proxy;
pub mod selection;
pub mod server;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
