//! Command-line argument parsing for the delve client.

use std::path::PathBuf;

use clap::Parser;

use crate::Config;

/// delve command-line arguments.
///
/// CLI values override settings loaded from `config.ron`.
#[derive(Parser, Debug)]
#[command(name = "delve", about = "Headless delve game-session client")]
pub struct CliArgs {
    /// Server address.
    #[arg(long)]
    pub server: Option<String>,

    /// Server port.
    #[arg(long)]
    pub port: Option<u16>,

    /// Connect over TLS.
    #[arg(long)]
    pub tls: Option<bool>,

    /// Bearer token for the handshake. Never written to the config file.
    #[arg(long, env = "DELVE_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Device identifier.
    #[arg(long)]
    pub device_id: Option<String>,

    /// Minimum level for console and file logs.
    #[arg(long)]
    pub log_level: Option<String>,

    /// Directory holding `config.ron` and `logs/`.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Config {
    /// Overlay the flags that were given onto a loaded config.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(server) = &args.server {
            self.network.server_address.clone_from(server);
        }
        if let Some(port) = args.port {
            self.network.server_port = port;
        }
        if let Some(tls) = args.tls {
            self.network.tls = tls;
        }
        if let Some(device_id) = &args.device_id {
            self.session.device_id.clone_from(device_id);
        }
        if let Some(level) = &args.log_level {
            self.debug.log_level.clone_from(level);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_args() -> CliArgs {
        CliArgs {
            server: None,
            port: None,
            tls: None,
            token: None,
            device_id: None,
            log_level: None,
            config: None,
        }
    }

    #[test]
    fn test_flags_override_loaded_values() {
        let mut config = Config::default();
        let args = CliArgs {
            server: Some("192.168.1.1".to_string()),
            tls: Some(true),
            device_id: Some("rig-01".to_string()),
            ..empty_args()
        };
        config.apply_cli_overrides(&args);
        assert_eq!(config.network.server_address, "192.168.1.1");
        assert!(config.network.tls);
        assert_eq!(config.session.device_id, "rig-01");
        // Flags that were not given keep their defaults.
        assert_eq!(config.network.server_port, 7777);
    }

    #[test]
    fn test_no_flags_changes_nothing() {
        let mut config = Config::default();
        config.apply_cli_overrides(&empty_args());
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_cli_parses_flags() {
        let args = CliArgs::parse_from(["delve", "--port", "9100", "--token", "abc"]);
        assert_eq!(args.port, Some(9100));
        assert_eq!(args.token.as_deref(), Some("abc"));
    }
}
