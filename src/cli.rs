//! Command-line interface

use clap::{Parser, Subcommand};

/// AgentHub AICP - Agent Identity & Authorization Control Plane
#[derive(Parser, Debug)]
#[command(name = "aicp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "AGENTHUB_HOST")]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 8080, env = "AGENTHUB_PORT")]
    pub port: u16,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "AGENTHUB_LOG_LEVEL")]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "AGENTHUB_LOG_FORMAT")]
    pub log_format: Option<String>,

    /// Subcommand (defaults to serving)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the control plane server (the default)
    Serve,
    /// Print the launch-readiness report as JSON and exit 0/2
    CheckReadiness,
}
