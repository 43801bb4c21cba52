//! Command-line interface and configuration loading.
//!
//! Precedence: built-in defaults < config file < env vars < CLI flags.

use clap::{Parser, Subcommand};

use fg_domain::config::{Config, ConfigSeverity};

#[derive(Parser)]
#[command(name = "fleetgate", about = "MCP control plane for a RouterOS fleet")]
pub struct Cli {
    /// Path to the TOML config file.
    #[arg(long, global = true, default_value = "fleetgate.toml")]
    pub config: String,

    /// Override the listen port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Override the state directory.
    #[arg(long, global = true)]
    pub state_dir: Option<String>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the gateway (default).
    Serve {
        /// Speak MCP over stdin/stdout instead of HTTP.
        #[arg(long)]
        stdio: bool,
    },
    /// Configuration helpers.
    #[command(subcommand)]
    Config(ConfigCommand),
    /// Print the version.
    Version,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Validate the effective configuration and exit non-zero on problems.
    Validate,
    /// Print the effective configuration as TOML (secrets are env-only and
    /// never appear here).
    Show,
}

/// Load the effective configuration: file (optional) + env + CLI overrides.
pub fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match std::fs::read_to_string(&cli.config) {
        Ok(raw) => toml::from_str::<Config>(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {e}", cli.config))?,
        Err(_) => {
            tracing::debug!(path = %cli.config, "no config file, using defaults");
            Config::default()
        }
    };

    config.apply_env_overrides();

    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref dir) = cli.state_dir {
        config.state.dir = dir.clone();
    }
    Ok(config)
}

/// Print validation issues; returns false when any is fatal.
pub fn report_issues(config: &Config) -> bool {
    let issues = config.validate();
    let mut ok = true;
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Fatal => {
                ok = false;
                eprintln!("error: {}", issue.message);
            }
            ConfigSeverity::Warning => eprintln!("warning: {}", issue.message),
        }
    }
    ok
}
