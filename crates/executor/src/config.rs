use std::fs;
use std::path::{Path, PathBuf};

use clap::{CommandFactory, Parser};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::Command;
use crate::{Error, Result};

pub const DEFAULT_LISTEN_ADDR: &str = ":8080";

/// Runtime configuration, assembled from the YAML file and CLI flags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub listen_address: String,
    pub verbose: bool,
    /// TLS material paths; both must be set for HTTPS. Accepted and merged
    /// here, acted on by whatever terminates TLS in front of the listener.
    pub tls_crt: String,
    pub tls_key: String,
    pub commands: Vec<Command>,
}

/// Webhook bridge that executes commands for matching Alertmanager alerts.
#[derive(Debug, Parser)]
#[command(name = "am-executor", version)]
struct Cli {
    /// HTTP host:port to listen on
    #[arg(short = 'l', value_name = "ADDR")]
    listen_address: Option<String>,

    /// Enable verbose/debug logging
    #[arg(short = 'v')]
    verbose: bool,

    /// YAML config file to use
    #[arg(short = 'f', value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Command (and arguments) to execute for each alert received
    #[arg(value_name = "COMMAND", trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

impl Config {
    /// Reads configuration from the CLI and the optional YAML file, merges
    /// the two, and validates the result.
    pub fn load() -> Result<Config> {
        Config::resolve(Cli::parse())
    }

    fn resolve(cli: Cli) -> Result<Config> {
        let mut flags = Config {
            listen_address: cli.listen_address.unwrap_or_default(),
            verbose: cli.verbose,
            ..Config::default()
        };
        if let Some((cmd, args)) = cli.command.split_first() {
            flags.commands.push(Command {
                cmd: cmd.clone(),
                args: args.to_vec(),
                ..Command::default()
            });
        }

        let file = match &cli.config_file {
            Some(path) => Some(Config::from_file(path)?),
            None => None,
        };

        let mut merged = match &file {
            Some(file) => merge_configs(&[file, &flags]),
            None => flags,
        };

        validate_commands(&merged.commands)?;

        if merged.commands.is_empty() {
            return Err(Error::Config(
                "missing command to execute on receipt of alarm".to_string(),
            ));
        }
        if merged.listen_address.is_empty() {
            merged.listen_address = DEFAULT_LISTEN_ADDR.to_string();
        }

        Ok(merged)
    }

    pub fn from_file(path: &Path) -> Result<Config> {
        let data = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&data)?)
    }

    /// Returns true if the config contains an equivalent command.
    pub fn has_command(&self, other: &Command) -> bool {
        self.commands.iter().any(|cmd| cmd.equivalent(other))
    }

    /// The address to bind. A bare `:port` (the upstream convention) is
    /// normalized to all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }

    /// Emits non-fatal configuration warnings. Separate from loading so the
    /// log subscriber is installed by the time they fire.
    pub fn log_warnings(&self) {
        for (i, cmd) in self.commands.iter().enumerate() {
            if cmd.should_ignore_resolved() {
                warn!(
                    "command {cmd} at index {i} specifies to ignore resolved alerts; \
                     its resolved_signal won't be used"
                );
            }
        }
        if !self.tls_crt.is_empty() && !self.tls_key.is_empty() {
            warn!("tls_crt/tls_key are configured but this listener serves plain HTTP");
        }
    }
}

/// Prints CLI usage, for fatal configuration errors at startup.
pub fn print_usage() {
    let _ = Cli::command().print_help();
}

/// Merges configs left to right: later scalars override earlier ones,
/// verbose is sticky, and commands are unioned by structural equality.
pub fn merge_configs(all: &[&Config]) -> Config {
    let mut merged = Config::default();

    for config in all {
        if !config.listen_address.is_empty() {
            merged.listen_address = config.listen_address.clone();
        }
        merged.verbose = merged.verbose || config.verbose;
        if !config.tls_key.is_empty() {
            merged.tls_key = config.tls_key.clone();
        }
        if !config.tls_crt.is_empty() {
            merged.tls_crt = config.tls_crt.clone();
        }
        for cmd in &config.commands {
            if !merged.has_command(cmd) {
                merged.commands.push(cmd.clone());
            }
        }
    }

    merged
}

fn validate_commands(commands: &[Command]) -> Result<()> {
    for (i, cmd) in commands.iter().enumerate() {
        cmd.parse_signal().map_err(|err| {
            Error::Config(format!(
                "invalid resolved_signal specified for command {cmd} at index {i}: {err}"
            ))
        })?;
    }
    Ok(())
}
