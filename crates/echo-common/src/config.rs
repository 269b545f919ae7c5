//! Application configuration loaded from environment variables and config files.
//!
//! Supports `.env` files for development and environment variables for deployment.
//! Config precedence: env vars > .env file > echo.toml > defaults

use crate::error::{EchoError, EchoResult};
use crate::models::IceServer;
use serde::Deserialize;
use std::net::IpAddr;
use std::sync::OnceLock;
use std::time::Duration;

static CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Get the global application configuration, if [`init`] has run.
pub fn get() -> Option<&'static AppConfig> {
    CONFIG.get()
}

/// Initialize the global configuration from environment.
///
/// Should be called once at startup by the binary. Library types never read the
/// global; they take the values they need explicitly.
pub fn init() -> EchoResult<&'static AppConfig> {
    let app_config = load()?;
    Ok(CONFIG.get_or_init(|| app_config))
}

/// Load configuration without touching the global.
pub fn load() -> EchoResult<AppConfig> {
    // Load .env file if present (development)
    let _ = dotenvy::dotenv();

    let cfg = config::Config::builder()
        // Defaults
        .set_default("relay.url", "ws://localhost:3000/relay")?
        .set_default("call.ice_servers", vec!["stun:stun.l.google.com:19302"])?
        .set_default("call.bind_ip", "127.0.0.1")?
        .set_default("chat.typing_quiet_ms", 500)?
        // Optional config file
        .add_source(config::File::with_name("echo").required(false))
        // Environment variables (ECHO_RELAY__URL, ECHO_CHAT__TYPING_QUIET_MS, etc.)
        .add_source(
            config::Environment::with_prefix("ECHO")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("call.ice_servers")
                .try_parsing(true),
        )
        .build()?;

    let app_config: AppConfig = cfg.try_deserialize()?;
    app_config.validate()?;
    Ok(app_config)
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub relay: RelayConfig,
    pub call: CallConfig,
    pub chat: ChatConfig,
}

impl AppConfig {
    fn validate(&self) -> EchoResult<()> {
        if self.relay.url.trim().is_empty() {
            return Err(EchoError::InvalidConfig {
                message: "relay.url must not be empty".into(),
            });
        }
        if self.chat.typing_quiet_ms == 0 {
            return Err(EchoError::InvalidConfig {
                message: "chat.typing_quiet_ms must be positive".into(),
            });
        }
        self.call.bind_ip()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    /// WebSocket URL of the relay / session directory.
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CallConfig {
    /// STUN/TURN URLs handed to the media engine when a session is created.
    pub ice_servers: Vec<String>,
    /// Local address the media engine binds its UDP socket to.
    pub bind_ip: String,
}

impl CallConfig {
    pub fn ice_servers(&self) -> Vec<IceServer> {
        self.ice_servers
            .iter()
            .map(|url| IceServer::stun(url.clone()))
            .collect()
    }

    pub fn bind_ip(&self) -> EchoResult<IpAddr> {
        self.bind_ip.parse().map_err(|_| EchoError::InvalidConfig {
            message: format!("call.bind_ip is not an IP address: {}", self.bind_ip),
        })
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChatConfig {
    /// Quiet window after the last keystroke before "stopped typing" is sent,
    /// and the lifetime of a peer's typing indicator without a refresh.
    pub typing_quiet_ms: u64,
}

impl ChatConfig {
    pub fn typing_quiet(&self) -> Duration {
        Duration::from_millis(self.typing_quiet_ms)
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self { typing_quiet_ms: 500 }
    }
}
