//! Meridian - unified CLI entrypoint.
//!
//! Usage:
//!   meridian init [--write-config PATH]
//!   meridian start --config meridian.toml [--insecure]
//!   meridian cert create-ca | create-node HOST... | create-client USER
//!   meridian kv get|put|scan|del|inc ...
//!   meridian zone get|set|ls|rm ...

use anyhow::Result;
use clap::Parser;
use meridian::cli::commands::{run_cert, run_init, run_kv, run_start, run_zone};
use meridian::cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = cli
        .log_level
        .clone()
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Init(args) => run_init(cli.config.as_deref(), args),
        Commands::Start(args) => run_start(cli.config.as_deref(), args).await,
        Commands::Cert(args) => run_cert(args),
        Commands::Kv(args) => run_kv(&cli.addr, &cli.user, args).await,
        Commands::Zone(args) => run_zone(&cli.addr, &cli.user, args).await,
    }
}
