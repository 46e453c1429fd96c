//! `meridian zone` - zone configuration management.
//!
//! Zone configurations live under the reserved system prefix, keyed by
//! the key prefix they govern; the empty prefix is the cluster default.

use crate::api::data::{pretty_key, Value};
use crate::api::request::{
    DeleteRequest, GetRequest, PutRequest, Request, RequestHeader, Response, ScanRequest,
};
use crate::core::config::ZoneConfig;
use crate::net::client::HttpKvClient;
use crate::storage::keys;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct ZoneArgs {
    #[command(subcommand)]
    pub command: ZoneCommand,
}

#[derive(Subcommand, Debug)]
pub enum ZoneCommand {
    /// Print the zone configuration for a key prefix.
    Get {
        #[arg(default_value = "")]
        prefix: String,
    },
    /// Install a zone configuration for a key prefix from a TOML file.
    Set {
        prefix: String,
        /// Path to a TOML file with the zone settings.
        file: String,
    },
    /// List installed zone configurations.
    Ls,
    /// Remove the zone configuration for a key prefix.
    Rm { prefix: String },
}

pub async fn run_zone(addr: &str, user: &str, args: ZoneArgs) -> Result<()> {
    let client = HttpKvClient::new(addr, user);
    match args.command {
        ZoneCommand::Get { prefix } => {
            let response = client
                .send(Request::Get(GetRequest {
                    header: RequestHeader::point(keys::zone_key(prefix.as_bytes())),
                }))
                .await?;
            let Response::Get(resp) = response else {
                anyhow::bail!("unexpected response");
            };
            let value = resp
                .value
                .with_context(|| format!("no zone configured for prefix {prefix:?}"))?;
            let raw = value.bytes.context("zone record holds no bytes")?;
            let zone: ZoneConfig =
                bincode::deserialize(&raw).context("decoding zone configuration")?;
            print!("{}", toml::to_string_pretty(&zone)?);
        }
        ZoneCommand::Set { prefix, file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {file}"))?;
            let zone: ZoneConfig = toml::from_str(&raw)
                .with_context(|| format!("parsing {file}"))?;
            zone.validate()?;
            client
                .send(Request::Put(PutRequest {
                    header: RequestHeader::point(keys::zone_key(prefix.as_bytes())),
                    value: Value::from_bytes(bincode::serialize(&zone)?),
                }))
                .await?;
            println!("zone set for prefix {prefix:?}");
        }
        ZoneCommand::Ls => {
            let response = client
                .send(Request::Scan(ScanRequest {
                    header: RequestHeader::span(
                        keys::zone_key(b""),
                        keys::prefix_end(keys::ZONE_CONFIG_KEY),
                    ),
                    max_results: 0,
                }))
                .await?;
            let Response::Scan(resp) = response else {
                anyhow::bail!("unexpected response");
            };
            for kv in resp.rows {
                let prefix = &kv.key[keys::ZONE_CONFIG_KEY.len()..];
                println!("{}", pretty_key(prefix));
            }
        }
        ZoneCommand::Rm { prefix } => {
            client
                .send(Request::Delete(DeleteRequest {
                    header: RequestHeader::point(keys::zone_key(prefix.as_bytes())),
                }))
                .await?;
            println!("zone removed for prefix {prefix:?}");
        }
    }
    Ok(())
}
