use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "matrix-appservice-bridge", version, about = "Matrix appservice endpoint for a multi-protocol chat gateway")]
pub struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, env = "APPSERVICE_BRIDGE_CONFIG", default_value = "config.yaml")]
    pub config: PathBuf,

    /// Override the configured log level (e.g. debug, info, warn).
    #[arg(long, env = "APPSERVICE_BRIDGE_LOG_LEVEL")]
    pub log_level: Option<String>,
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;

    #[test]
    fn defaults_and_overrides_parse() {
        let cli = Cli::parse_from(["matrix-appservice-bridge"]);
        assert_eq!(cli.config.to_str(), Some("config.yaml"));
        assert!(cli.log_level.is_none());

        let cli = Cli::parse_from([
            "matrix-appservice-bridge",
            "--config",
            "/etc/bridge.yaml",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config.to_str(), Some("/etc/bridge.yaml"));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
