use std::path::Path;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::message::RemoteProtocol;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub registration: RegistrationConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Base URL of the home server, e.g. `http://localhost:8008`.
    pub homeserver_url: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// The bridge bot's own Matrix ID, e.g. `@_irc_bot:localhost`.
    #[serde(alias = "mx_id")]
    pub bot_mxid: String,
    /// The human operator invited into every created room and the control
    /// room, e.g. `@admin:localhost`.
    pub main_user: String,
    /// Namespace prefix for virtual-user localparts, e.g. `_irc_bridge_`.
    /// Also used to recognize (and drop) our own events.
    #[serde(alias = "aps_prefix")]
    pub account_prefix: String,
    /// Suffix appended to virtual-user localparts.
    #[serde(default)]
    pub user_suffix: String,
    /// Remote network this instance pairs with, used until the first send
    /// binds (and persists) the protocol.
    #[serde(default)]
    pub remote_network: Option<RemoteProtocol>,
    /// Disable HTML formatted bodies on outbound events.
    #[serde(default)]
    pub html_disable: bool,
    /// Keep the `> `-quoted lines Matrix clients prepend to replies.
    #[serde(default)]
    pub keep_quoted_reply: bool,
    /// Strip the homeserver suffix from sender display names.
    #[serde(default)]
    pub no_homeserver_suffix: bool,
    /// Path of the image attached as avatar to every created room.
    #[serde(default)]
    pub avatar_path: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    /// Token the bridge presents to the home server (`as_token`).
    #[serde(alias = "as_token")]
    pub appservice_token: String,
    /// Token the home server presents to the bridge (`hs_token`).
    #[serde(alias = "hs_token")]
    pub homeserver_token: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Sqlite database path; `sqlite://` prefixed URLs are also accepted.
    #[serde(alias = "url")]
    pub filename: String,
}

impl DatabaseConfig {
    pub fn sqlite_path(&self) -> String {
        self.filename
            .strip_prefix("sqlite://")
            .unwrap_or(&self.filename)
            .to_string()
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Fallback delay after room creation when the visibility poll fails,
    /// before inviting members (ms).
    #[serde(default = "default_room_settle_delay")]
    pub room_settle_delay: u64,
    /// Pacing delay between bulk virtual-user registrations (ms).
    #[serde(default = "default_registration_delay")]
    pub registration_delay: u64,
    /// Pacing delay between invites in the pending-invite loop (ms).
    #[serde(default = "default_invite_delay")]
    pub invite_delay: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            room_settle_delay: default_room_settle_delay(),
            registration_delay: default_registration_delay(),
            invite_delay: default_invite_delay(),
        }
    }
}

impl Config {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bridge.homeserver_url.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.homeserver_url cannot be empty".to_string(),
            ));
        }
        if self.bridge.bot_mxid.is_empty() || !self.bridge.bot_mxid.starts_with('@') {
            return Err(ConfigError::InvalidConfig(
                "bridge.bot_mxid must be a Matrix user id".to_string(),
            ));
        }
        if self.bridge.account_prefix.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "bridge.account_prefix cannot be empty".to_string(),
            ));
        }
        if self.registration.appservice_token.is_empty()
            || self.registration.homeserver_token.is_empty()
        {
            return Err(ConfigError::InvalidConfig(
                "registration tokens cannot be empty".to_string(),
            ));
        }
        if self.database.sqlite_path().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "database.filename cannot be empty".to_string(),
            ));
        }
        if self.bridge.port == 0 {
            return Err(ConfigError::InvalidConfig(
                "bridge.port must be between 1 and 65535".to_string(),
            ));
        }
        Ok(())
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(value) = std::env::var("APPSERVICE_BRIDGE_AS_TOKEN") {
            self.registration.appservice_token = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_BRIDGE_HS_TOKEN") {
            self.registration.homeserver_token = value;
        }
        if let Ok(value) = std::env::var("APPSERVICE_BRIDGE_DATABASE") {
            self.database.filename = value;
        }
    }
}

fn default_port() -> u16 {
    9005
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_room_settle_delay() -> u64 {
    2000
}

fn default_registration_delay() -> u64 {
    1000
}

fn default_invite_delay() -> u64 {
    1000
}
