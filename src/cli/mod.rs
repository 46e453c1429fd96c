//! Command-line interface.
//!
//! Thin wrapper over the wire client: `init`, `start`, certificate
//! generation, key/value operations, and zone configuration. Exit code 0
//! on success, 1 on failure.

pub mod commands;

use clap::{Parser, Subcommand};

/// Meridian - distributed, strongly-consistent key/value datastore.
#[derive(Parser, Debug)]
#[command(name = "meridian")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Server address for client commands.
    #[arg(long, global = true, default_value = "127.0.0.1:26257")]
    pub addr: String,

    /// User to run client commands as.
    #[arg(long, global = true, default_value = "root")]
    pub user: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration and initialize a node's first store.
    Init(commands::InitArgs),
    /// Start the server.
    Start(commands::StartArgs),
    /// Certificate management.
    Cert(commands::CertArgs),
    /// Key/value operations.
    Kv(commands::KvArgs),
    /// Zone configuration.
    Zone(commands::ZoneArgs),
}
