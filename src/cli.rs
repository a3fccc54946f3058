//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// CMS failover gateway - primary/backup routing with response caching
#[derive(Parser, Debug)]
#[command(name = "cms-failover")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "CMS_FAILOVER_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, env = "CMS_FAILOVER_PORT")]
    pub port: Option<u16>,

    /// Host to bind to
    #[arg(long, env = "CMS_FAILOVER_HOST")]
    pub host: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "CMS_FAILOVER_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "CMS_FAILOVER_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Start the gateway server (default)
    Serve,

    /// Probe both origins once and print the health report as JSON
    Probe,

    /// Print the effective configuration as YAML
    Config,
}
