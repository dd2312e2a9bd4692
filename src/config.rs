//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast on malformed values. Every knob has a
//! default so a bare `calcd serve` works out of the box; the liveness
//! timeout is only the *initial* value — it can be retuned at runtime
//! through the admin endpoint.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite database path.
    pub database_path: String,
    /// Orchestrator bind address.
    pub bind_addr: SocketAddr,
    /// Initial timeout after which a silent worker is swept to dead.
    pub liveness_timeout: Duration,
    /// Cadence of the orchestrator's own sweep timer.
    pub sweep_interval: Duration,
    /// Worker heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Deadline for one dispatcher → worker RPC, including the simulated
    /// cost sleep.
    pub rpc_timeout: Duration,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_path: var_or("CALCD_DB", "calcd.db"),
            bind_addr: parse_var("CALCD_BIND", "127.0.0.1:8079")?,
            liveness_timeout: millis_var("CALCD_LIVENESS_TIMEOUT_MS", 10_000)?,
            sweep_interval: millis_var("CALCD_SWEEP_INTERVAL_MS", 5_000)?,
            heartbeat_interval: millis_var("CALCD_HEARTBEAT_INTERVAL_MS", 7_000)?,
            rpc_timeout: millis_var("CALCD_RPC_TIMEOUT_MS", 60_000)?,
            log_level: var_or("LOG_LEVEL", "info"),
        })
    }
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_var<T: std::str::FromStr>(name: &str, default: &str) -> Result<T> {
    var_or(name, default)
        .parse()
        .map_err(|_| Error::Config(format!("invalid value for {name}")))
}

fn millis_var(name: &str, default_ms: u64) -> Result<Duration> {
    let ms: u64 = match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("invalid value for {name}")))?,
        Err(_) => default_ms,
    };
    Ok(Duration::from_millis(ms))
}
