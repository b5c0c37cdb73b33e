use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "homeport")]
#[command(about = "Run local backend services and expose them through a single tunnel")]
#[command(version)]
pub struct Cli {
    /// Config file path (defaults to homeport.yaml, searched upwards)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Working directory
    #[arg(short, long)]
    pub workdir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start services
    Start {
        /// Services to start (names or aliases; defaults to all)
        services: Vec<String>,

        /// Also expose the started services through the tunnel
        #[arg(long)]
        expose: bool,
    },
    /// Stop services
    Stop {
        /// Services to stop (defaults to all)
        services: Vec<String>,
    },
    /// Restart services
    Restart {
        /// Services to restart (defaults to all)
        services: Vec<String>,
    },
    /// Show service status and reachability
    Status {
        /// Services to show (defaults to all)
        services: Vec<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Manage the public tunnel
    #[command(subcommand)]
    Tunnel(TunnelCommands),
}

#[derive(Subcommand)]
pub enum TunnelCommands {
    /// Expose running services through the tunnel (runs in the foreground)
    Start {
        /// Services to expose (defaults to all running)
        services: Vec<String>,
    },
    /// Forget the persisted tunnel record
    Stop,
    /// Show the last-known tunnel and whether it is live
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}
