use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

/// Policy applied when the last member leaves a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmptyRoomPolicy {
    /// Drop the room; it is recreated lazily on the next join.
    Delete,
    /// Keep the room with its capacity and visibility settings.
    Retain,
}

/// Engine tuning knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Global connection ceiling
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-identity connection ceiling (multiple devices per principal)
    #[serde(default = "default_max_connections_per_identity")]
    pub max_connections_per_identity: usize,
    /// Per-origin-address connection ceiling
    #[serde(default = "default_max_connections_per_origin")]
    pub max_connections_per_origin: usize,
    /// Liveness probe interval in seconds
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds without a probe acknowledgment before force-close
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Seconds without any application activity before force-close
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,
    /// Inbound payload ceiling in bytes
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Outbound queue depth per connection
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,
    /// Inbound messages allowed per rate limit window
    #[serde(default = "default_rate_limit_max_messages")]
    pub rate_limit_max_messages: usize,
    /// Rate limit window length in seconds
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_secs: u64,
    /// Budget for a single broadcast fan-out in milliseconds
    #[serde(default = "default_broadcast_timeout_ms")]
    pub broadcast_timeout_ms: u64,
    /// Graceful shutdown drain window in seconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
    /// Origins accepted at admission; empty list allows all
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_empty_room_policy")]
    pub empty_room_policy: EmptyRoomPolicy,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_identity() -> usize {
    5
}

fn default_max_connections_per_origin() -> usize {
    32
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    60
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_max_message_bytes() -> usize {
    1024 * 1024
}

fn default_outbound_queue_depth() -> usize {
    100
}

fn default_rate_limit_max_messages() -> usize {
    100
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_broadcast_timeout_ms() -> u64 {
    100
}

fn default_drain_timeout() -> u64 {
    10
}

fn default_empty_room_policy() -> EmptyRoomPolicy {
    EmptyRoomPolicy::Delete
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("engine.max_connections", 10_000)?
            .set_default("engine.heartbeat_interval_secs", 30)?
            .set_default("engine.heartbeat_timeout_secs", 60)?
            .set_default("engine.idle_timeout_secs", 300)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, JWT_SECRET, ENGINE_MAX_CONNECTIONS, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_identity: default_max_connections_per_identity(),
            max_connections_per_origin: default_max_connections_per_origin(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            max_message_bytes: default_max_message_bytes(),
            outbound_queue_depth: default_outbound_queue_depth(),
            rate_limit_max_messages: default_rate_limit_max_messages(),
            rate_limit_window_secs: default_rate_limit_window(),
            broadcast_timeout_ms: default_broadcast_timeout_ms(),
            drain_timeout_secs: default_drain_timeout(),
            allowed_origins: vec![],
            empty_room_policy: default_empty_room_policy(),
        }
    }
}
