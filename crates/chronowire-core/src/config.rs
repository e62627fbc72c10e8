use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::types::DeliveryMode;

// Wire constants shared by the gateway and its clients.
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_WS_PATH: &str = "/ws";
pub const MAX_PAYLOAD_BYTES: usize = 128 * 1024; // 128 KB hard cap per frame
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30; // tick event cadence

// Scheduler limits.
pub const DEFAULT_MAX_CONCURRENCY: usize = 30;
pub const MAX_CONCURRENCY_CEILING: usize = 100;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_OUTBOUND_BUFFER: usize = 256;
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Top-level config (chronowire.toml + CHRONOWIRE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChronowireConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Socket path the WS upgrade is served on.
    #[serde(default = "default_ws_path")]
    pub path: String,
    /// CORS origins allowed to open a socket. Empty means any origin.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            path: DEFAULT_WS_PATH.to_string(),
            allowed_origins: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Cap on simultaneously running jobs. Clamped to 1..=100 at use.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Reset jobs left claimed/running by a previous process to pending.
    /// When false those jobs are abandoned instead.
    #[serde(default = "bool_true")]
    pub rejuvenate_on_start: bool,
    /// Job store connection string: `memory` or `sqlite://<path>`.
    #[serde(default = "default_store")]
    pub store: String,
    /// Per-run handler timeout. `None` lets handlers run indefinitely.
    #[serde(default)]
    pub handler_timeout_secs: Option<u64>,
    /// Suspend a recurring job after this many failures in a row.
    #[serde(default)]
    pub max_consecutive_failures: Option<u32>,
}

impl SchedulerConfig {
    /// Effective worker pool size.
    pub fn concurrency(&self) -> usize {
        self.max_concurrency.clamp(1, MAX_CONCURRENCY_CEILING)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            rejuvenate_on_start: true,
            store: default_store(),
            handler_timeout_secs: None,
            max_consecutive_failures: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    /// Mode used by sends that do not name one explicitly.
    #[serde(default)]
    pub mode: DeliveryMode,
    /// Capacity of each connection's outbound queue (frames).
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
    /// Forward job completion/failure events to `job:<reference>` rooms.
    #[serde(default = "bool_true")]
    pub job_events: bool,
    /// How long a guaranteed send may wait on one full queue before that
    /// connection is closed as stalled.
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::default(),
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            job_events: true,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
        }
    }
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_ws_path() -> String {
    DEFAULT_WS_PATH.to_string()
}
fn default_max_concurrency() -> usize {
    DEFAULT_MAX_CONCURRENCY
}
fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}
fn default_outbound_buffer() -> usize {
    DEFAULT_OUTBOUND_BUFFER
}
fn default_send_timeout_ms() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}
fn default_store() -> String {
    format!("sqlite://{}/.chronowire/jobs.db", home_dir())
}

fn home_dir() -> String {
    std::env::var("HOME").unwrap_or_else(|_| ".".to_string())
}

impl ChronowireConfig {
    /// Load config from a TOML file with CHRONOWIRE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.chronowire/chronowire.toml
    ///
    /// A missing file is not an error; every field has a default.
    /// Nested keys in env vars are separated by `__`, e.g.
    /// `CHRONOWIRE_SCHEDULER__MAX_CONCURRENCY=50`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: ChronowireConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("CHRONOWIRE_").split("__"))
            .extract()
            .map_err(|e| crate::error::ChronowireError::Config(e.to_string()))?;

        tracing::debug!(path = %path, "configuration loaded");
        Ok(config)
    }
}

fn default_config_path() -> String {
    format!("{}/.chronowire/chronowire.toml", home_dir())
}
