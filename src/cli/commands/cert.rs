//! `meridian cert` - certificate generation.

use crate::net::security;
use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::Path;

#[derive(Args, Debug)]
pub struct CertArgs {
    /// Directory to write certificates into.
    #[arg(long, default_value = "certs")]
    pub certs_dir: String,

    #[command(subcommand)]
    pub command: CertCommand,
}

#[derive(Subcommand, Debug)]
pub enum CertCommand {
    /// Create the certificate authority.
    CreateCa,
    /// Create a node certificate for the given hosts.
    CreateNode {
        /// Hostnames or addresses the certificate covers.
        hosts: Vec<String>,
    },
    /// Create a client certificate for a user.
    CreateClient {
        /// The user the certificate authenticates.
        user: String,
    },
}

pub fn run_cert(args: CertArgs) -> Result<()> {
    let dir = Path::new(&args.certs_dir);
    match args.command {
        CertCommand::CreateCa => {
            security::create_ca(dir)?;
            println!("wrote CA certificate to {}", dir.display());
        }
        CertCommand::CreateNode { hosts } => {
            if hosts.is_empty() {
                anyhow::bail!("create-node requires at least one host");
            }
            security::create_cert(dir, "node", security::NODE_USER, &hosts)?;
            println!("wrote node certificate to {}", dir.display());
        }
        CertCommand::CreateClient { user } => {
            security::create_cert(dir, &format!("client.{user}"), &user, &[])?;
            println!("wrote client certificate for {user} to {}", dir.display());
        }
    }
    Ok(())
}
