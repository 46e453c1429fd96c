//! `meridian kv` - key/value operations against a running server.

use crate::api::data::{pretty_key, Value};
use crate::api::request::{
    DeleteRequest, GetRequest, IncrementRequest, PutRequest, Request, RequestHeader, Response,
    ScanRequest,
};
use crate::net::client::HttpKvClient;
use anyhow::Result;
use clap::{Args, Subcommand};

#[derive(Args, Debug)]
pub struct KvArgs {
    #[command(subcommand)]
    pub command: KvCommand,
}

#[derive(Subcommand, Debug)]
pub enum KvCommand {
    /// Read a key.
    Get { key: String },
    /// Write a key.
    Put { key: String, value: String },
    /// Scan a key range.
    Scan {
        /// Start key (inclusive); empty scans from the beginning.
        #[arg(default_value = "")]
        start: String,
        /// End key (exclusive); empty scans to the end.
        #[arg(default_value = "")]
        end: String,
        /// Maximum rows to return (0 = unbounded).
        #[arg(long, default_value_t = 0)]
        max: u64,
    },
    /// Delete a key.
    Del { key: String },
    /// Add a delta to an integer key.
    Inc { key: String, delta: i64 },
}

fn render(value: &Value) -> String {
    if let Some(i) = value.integer {
        return i.to_string();
    }
    match &value.bytes {
        Some(bytes) => String::from_utf8_lossy(bytes).to_string(),
        None => String::new(),
    }
}

pub async fn run_kv(addr: &str, user: &str, args: KvArgs) -> Result<()> {
    let client = HttpKvClient::new(addr, user);
    match args.command {
        KvCommand::Get { key } => {
            let response = client
                .send(Request::Get(GetRequest {
                    header: RequestHeader::point(key.clone().into_bytes()),
                }))
                .await?;
            match response {
                Response::Get(resp) => match resp.value {
                    Some(value) => println!("{}", render(&value)),
                    None => anyhow::bail!("{key} not found"),
                },
                _ => anyhow::bail!("unexpected response"),
            }
        }
        KvCommand::Put { key, value } => {
            client
                .send(Request::Put(PutRequest {
                    header: RequestHeader::point(key.into_bytes()),
                    value: Value::from_bytes(value.into_bytes()),
                }))
                .await?;
        }
        KvCommand::Scan { start, end, max } => {
            let response = client
                .send(Request::Scan(ScanRequest {
                    header: RequestHeader::span(start.into_bytes(), end.into_bytes()),
                    max_results: max,
                }))
                .await?;
            match response {
                Response::Scan(resp) => {
                    for kv in resp.rows {
                        println!("{}\t{}", pretty_key(&kv.key), render(&kv.value));
                    }
                }
                _ => anyhow::bail!("unexpected response"),
            }
        }
        KvCommand::Del { key } => {
            client
                .send(Request::Delete(DeleteRequest {
                    header: RequestHeader::point(key.into_bytes()),
                }))
                .await?;
        }
        KvCommand::Inc { key, delta } => {
            let response = client
                .send(Request::Increment(IncrementRequest {
                    header: RequestHeader::point(key.into_bytes()),
                    increment: delta,
                }))
                .await?;
            match response {
                Response::Increment(resp) => println!("{}", resp.new_value),
                _ => anyhow::bail!("unexpected response"),
            }
        }
    }
    Ok(())
}
