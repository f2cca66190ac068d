use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;

/// fanctld: adaptive fan control for system and NVIDIA GPU fans
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// JSON or YAML config file (default: $FANCTLD_CONFIG, ~/.config/fanctld/config.json,
    /// /etc/fanctld/config.json)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Detach from the terminal and run in the background
    #[arg(short = 'd', long = "daemonize", default_value = "false")]
    pub daemonize: bool,

    /// Minimum level sent to syslog
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: LevelFilter,

    /// Validate the configuration, print a summary and exit
    #[arg(long = "check", default_value = "false")]
    pub check: bool,
}
