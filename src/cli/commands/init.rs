//! `meridian init` - validate configuration and write a starter file.

use crate::core::config::Config;
use anyhow::{Context, Result};
use clap::Args;
use std::path::Path;

#[derive(Args, Debug)]
pub struct InitArgs {
    /// Write a default configuration file here if none exists.
    #[arg(long)]
    pub write_config: Option<String>,
}

pub fn run_init(config_path: Option<&str>, args: InitArgs) -> Result<()> {
    if let Some(target) = &args.write_config {
        let target = Path::new(target);
        if target.exists() {
            anyhow::bail!("refusing to overwrite {}", target.display());
        }
        let default = toml::to_string_pretty(&Config::default())
            .context("rendering default configuration")?;
        std::fs::write(target, default)
            .with_context(|| format!("writing {}", target.display()))?;
        println!("wrote default configuration to {}", target.display());
        return Ok(());
    }

    let config = match config_path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    println!("configuration valid");
    Ok(())
}
