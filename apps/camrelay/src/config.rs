//! Relay configuration.
//!
//! Configuration is stored as TOML. The file is looked up, in order, at the
//! first command-line argument, `$CAMRELAY_CONFIG`, or:
//! - Linux: `~/.config/camrelay/server.toml`
//! - Windows: `%APPDATA%/camrelay/server.toml`

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use camrelay_protocol::constants::{
    CHUNK_CLEANUP_INTERVAL, CHUNK_TIMEOUT, MAX_FRAME_SIZE, QUEUE_DRAIN_INTERVAL,
    WS_PING_INTERVAL, WS_PING_TIMEOUT, WS_PORT,
};
use camrelay_protocol::{CommandSpec, CommandTable};
use camrelay_server::{EngineConfig, ServerConfig};

/// Environment variable overriding the configuration path.
pub const CONFIG_ENV: &str = "CAMRELAY_CONFIG";

/// Relay configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// WebSocket listen port.
    #[serde(default = "default_ws_port")]
    pub ws_port: u16,

    /// Largest accepted frame or message, in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,

    /// Grace period after a missed ping before a connection is dropped.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    #[serde(default = "default_chunk_timeout")]
    pub chunk_timeout_secs: u64,

    #[serde(default = "default_chunk_sweep_interval")]
    pub chunk_sweep_interval_secs: u64,

    #[serde(default = "default_queue_drain_interval")]
    pub queue_drain_interval_ms: u64,

    /// Root directory for saved frames.
    #[serde(default = "default_images_dir")]
    pub images_dir: String,

    /// Save every accepted frame on start.
    #[serde(default)]
    pub auto_save: bool,

    /// Additional or replacement command specs, keyed by command name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub commands: BTreeMap<String, CommandSpec>,
}

fn default_ws_port() -> u16 {
    WS_PORT
}

fn default_max_frame_size() -> usize {
    MAX_FRAME_SIZE
}

fn default_ping_interval() -> u64 {
    WS_PING_INTERVAL.as_secs()
}

fn default_ping_timeout() -> u64 {
    WS_PING_TIMEOUT.as_secs()
}

fn default_chunk_timeout() -> u64 {
    CHUNK_TIMEOUT.as_secs()
}

fn default_chunk_sweep_interval() -> u64 {
    CHUNK_CLEANUP_INTERVAL.as_secs()
}

fn default_queue_drain_interval() -> u64 {
    QUEUE_DRAIN_INTERVAL.as_millis() as u64
}

fn default_images_dir() -> String {
    "images".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_port: default_ws_port(),
            max_frame_size: default_max_frame_size(),
            ping_interval_secs: default_ping_interval(),
            ping_timeout_secs: default_ping_timeout(),
            chunk_timeout_secs: default_chunk_timeout(),
            chunk_sweep_interval_secs: default_chunk_sweep_interval(),
            queue_drain_interval_ms: default_queue_drain_interval(),
            images_dir: default_images_dir(),
            auto_save: false,
            commands: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or creates a default file if it
    /// does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    /// Saves the configuration to `path`.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            max_frame_size: self.max_frame_size,
            chunk_timeout: Duration::from_secs(self.chunk_timeout_secs),
            chunk_sweep_interval: Duration::from_secs(self.chunk_sweep_interval_secs.max(1)),
            queue_drain_interval: Duration::from_millis(self.queue_drain_interval_ms.max(1)),
            commands: CommandTable::with_overrides(self.commands.clone()),
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        let ping_interval = Duration::from_secs(self.ping_interval_secs.max(1));
        ServerConfig {
            port: self.ws_port,
            ping_interval,
            pong_wait: ping_interval + Duration::from_secs(self.ping_timeout_secs),
            max_message_size: self.max_frame_size,
        }
    }
}

/// Picks the configuration path: explicit argument, then the environment,
/// then the platform default.
pub fn resolve_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .filter(|p| !p.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path)
}

/// Returns the platform-specific configuration file path.
fn default_config_path() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("camrelay")
            .join("server.toml")
    }

    #[cfg(target_os = "windows")]
    {
        let appdata =
            std::env::var("APPDATA").unwrap_or_else(|_| "C:\\Users\\Default\\AppData".into());
        PathBuf::from(appdata).join("camrelay").join("server.toml")
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows")))]
    {
        PathBuf::from("/tmp/camrelay/server.toml")
    }
}
