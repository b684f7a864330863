//! Startup configuration, read once from the environment.
//!
//! Mirrors the teacher's `env::var(...).unwrap_or_else(...)` style from
//! `main.rs`, gathered into one struct because the hub has many more knobs
//! than the teacher's `DATABASE_URL`/`BIND_ADDR` pair.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub log_level: String,
    pub passhash: Vec<u8>,
    pub ping_interval: Duration,
    pub state_interval: Duration,
    pub token_gc_interval: Duration,
    pub token_default_ttl: Duration,
    pub shared_source_grace: Duration,
    pub script_root: PathBuf,
    pub script_start_delay: Duration,
    pub script_start_timeout: Duration,
    pub write_arbiter_capacity: usize,
    pub ice_servers: serde_json::Value,
    /// How many consecutive liveness ticks a device may go silent for
    /// before the ping ticker disconnects it (spec §4.8).
    pub missed_ping_limit: i64,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            log_level: env_or("LOG_LEVEL", "info"),
            passhash: env::var("HUB_PASSHASH")
                .expect("HUB_PASSHASH must be set")
                .into_bytes(),
            ping_interval: Duration::from_secs(env_secs("PING_INTERVAL_SECS", 30)),
            state_interval: Duration::from_secs(env_secs("STATE_INTERVAL_SECS", 60)),
            token_gc_interval: Duration::from_secs(env_secs("TOKEN_GC_INTERVAL_SECS", 60)),
            token_default_ttl: Duration::from_secs(env_secs("TOKEN_DEFAULT_TTL_SECS", 3600)),
            shared_source_grace: Duration::from_secs(env_secs("SHARED_SOURCE_GRACE_SECS", 30)),
            script_root: PathBuf::from(env_or("SCRIPT_ROOT", "./scripts")),
            script_start_delay: Duration::from_millis(env_secs("SCRIPT_START_DELAY_MS", 500)),
            script_start_timeout: Duration::from_secs(env_secs("SCRIPT_START_TIMEOUT_SECS", 360)),
            write_arbiter_capacity: env_secs("WRITE_ARBITER_CAPACITY", 512) as usize,
            ice_servers: env::var("ICE_SERVERS_JSON")
                .ok()
                .and_then(|raw| serde_json::from_str(&raw).ok())
                .unwrap_or_else(|| serde_json::json!([])),
            missed_ping_limit: env_secs("MISSED_PING_LIMIT", 3) as i64,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn env_secs(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
