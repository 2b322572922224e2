use clap::{Parser, Subcommand};
use netcopy::Transport;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "netcopy")]
#[command(author, version, about = "Amplifying flow relay", long_about = None)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    /// Log format (json, plain); overrides the config file
    #[arg(long, global = true)]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Relay flows from the local tap to the target
    Run(RunArgs),

    /// Show version information
    Version,
}

#[derive(clap::Args, Default)]
pub struct RunArgs {
    /// Override target address, for example 192.168.0.111:80
    #[arg(short = 'T', long)]
    pub target: Option<String>,

    /// Override upstream transport (tcp, udp)
    #[arg(long)]
    pub protocol: Option<Transport>,

    /// Override number of upstream connections per flow
    #[arg(short, long)]
    pub amplification: Option<usize>,

    /// Override idle timeout in milliseconds
    #[arg(long)]
    pub idle_timeout_ms: Option<u64>,

    /// Override tap listen address
    #[arg(long)]
    pub listen: Option<String>,
}
