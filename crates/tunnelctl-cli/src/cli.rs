use std::path::PathBuf;

use clap::{
    Parser,
    Subcommand,
};

#[derive(Parser)]
#[command(name = "tunnelctl")]
#[command(about = "Local service-tunnel controller")]
#[command(version)]
pub struct Cli {
    #[arg(short = 'c', long, help = "Path to the tunnel configuration file", value_name = "PATH", default_value = "tunnelctl.toml")]
    pub config: PathBuf,

    #[arg(long, help = "Set the global log level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the worker and run until interrupted.
    Run,
    /// Bring up the configured tunnels, print one status snapshot, and exit.
    Status,
}
