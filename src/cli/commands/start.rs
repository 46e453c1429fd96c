//! `meridian start` - run the server until interrupted.

use crate::core::config::Config;
use crate::node::Node;
use anyhow::Result;
use clap::Args;
use tracing::info;

#[derive(Args, Debug)]
pub struct StartArgs {
    /// Bind address override.
    #[arg(long)]
    pub addr: Option<String>,

    /// Run without TLS or client authentication.
    #[arg(long)]
    pub insecure: bool,
}

pub async fn run_start(config_path: Option<&str>, args: StartArgs) -> Result<()> {
    let mut config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.addr {
        config.node.addr = addr;
    }
    if args.insecure {
        config.node.insecure = true;
    }

    let node = Node::start(config).await?;
    let addr = node.serve().await?;
    info!(addr = %addr, "serving");

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    node.stop().await;
    Ok(())
}
