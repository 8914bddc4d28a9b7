pub use self::parser::{
    BridgeConfig, Config, DatabaseConfig, LimitsConfig, LoggingConfig, RegistrationConfig,
};

mod parser;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
