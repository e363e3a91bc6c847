//! Command-line interface for the plugin job service.

use clap::{Arg, ArgAction, Command};
use std::path::PathBuf;

/// Command line arguments that override the configuration file.
#[derive(Debug, Clone)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for the server plugin directory
    pub plugin_dir: Option<PathBuf>,
    /// Optional override for the state directory
    pub data_dir: Option<PathBuf>,
    pub log_level: Option<String>,
    pub json_logs: bool,
}

impl CliArgs {
    /// Builds the clap command definition.
    ///
    /// # Returns
    ///
    /// A `Command` describing every option, with `admin.toml` as the default
    /// configuration path.
    pub fn command() -> Command {
        Command::new("Horizon Admin")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Plugin installation job service for the Horizon admin console")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value("admin.toml"),
            )
            .arg(
                Arg::new("plugins")
                    .short('p')
                    .long("plugins")
                    .value_name("DIR")
                    .help("Server plugin directory"),
            )
            .arg(
                Arg::new("data-dir")
                    .short('d')
                    .long("data-dir")
                    .value_name("DIR")
                    .help("Directory for jobs, registry, backups and staging files"),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue),
            )
    }

    /// Parses the process arguments.
    ///
    /// # Returns
    ///
    /// A `CliArgs` holding the configuration path and any overrides.
    ///
    /// # Panics
    ///
    /// Does not panic. On invalid arguments clap prints usage and exits the
    /// process, and `--help` or `--version` exit after printing.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    fn from_matches(matches: &clap::ArgMatches) -> Self {
        Self {
            config_path: matches
                .get_one::<String>("config")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("admin.toml")),
            plugin_dir: matches.get_one::<String>("plugins").map(PathBuf::from),
            data_dir: matches.get_one::<String>("data-dir").map(PathBuf::from),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
        }
    }
}
