//! Configuration parsing and validation.
//!
//! Configuration is loaded from TOML files with CLI overrides. The zone
//! section doubles as the default zone configuration stored under the
//! system keyspace at bootstrap; `zone set` replaces it at runtime.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity and networking.
    #[serde(default)]
    pub node: NodeConfig,

    /// Default zone configuration applied to the whole keyspace.
    #[serde(default)]
    pub zone: ZoneConfig,

    /// Transaction protocol tuning.
    #[serde(default)]
    pub txn: TxnConfig,

    /// Logging configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Node identity and networking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Wire API bind address.
    #[serde(default = "default_addr")]
    pub addr: String,

    /// Run without TLS or client authentication.
    #[serde(default = "default_insecure")]
    pub insecure: bool,

    /// Directory holding CA, node, and client certificates.
    #[serde(default)]
    pub certs_dir: String,

    /// Maximum clock offset between any two nodes, in milliseconds.
    /// Defines the transactional read uncertainty interval.
    #[serde(default = "default_max_clock_offset_ms")]
    pub max_clock_offset_ms: u64,

    /// Number of in-memory stores to bootstrap; one device each.
    #[serde(default = "default_store_count")]
    pub store_count: u32,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            insecure: default_insecure(),
            certs_dir: String::new(),
            max_clock_offset_ms: default_max_clock_offset_ms(),
            store_count: default_store_count(),
        }
    }
}

/// Zone configuration: replication and size policy for a span of the
/// keyspace. Stored under the system keyspace; the config file supplies
/// the default zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneConfig {
    /// Replicas per range.
    #[serde(default = "default_replication_factor")]
    pub replication_factor: u32,

    /// Merge candidate threshold: two adjacent ranges merge when their
    /// combined live bytes fit under this bound.
    #[serde(default = "default_range_min_bytes")]
    pub range_min_bytes: i64,

    /// Split threshold on a range's total bytes.
    #[serde(default = "default_range_max_bytes")]
    pub range_max_bytes: i64,

    /// Versions older than this are garbage-collectable once superseded.
    #[serde(default = "default_gc_ttl_seconds")]
    pub gc_ttl_seconds: i64,
}

impl Default for ZoneConfig {
    fn default() -> Self {
        Self {
            replication_factor: default_replication_factor(),
            range_min_bytes: default_range_min_bytes(),
            range_max_bytes: default_range_max_bytes(),
            gc_ttl_seconds: default_gc_ttl_seconds(),
        }
    }
}

/// Transaction protocol tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnConfig {
    /// A transaction whose record has not been heartbeat within this
    /// window may be aborted by a pusher.
    #[serde(default = "default_txn_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,
}

impl Default for TxnConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: default_txn_heartbeat_timeout_ms(),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_addr() -> String {
    "127.0.0.1:26257".to_string()
}

fn default_insecure() -> bool {
    false
}

fn default_max_clock_offset_ms() -> u64 {
    250
}

fn default_store_count() -> u32 {
    1
}

fn default_replication_factor() -> u32 {
    3
}

fn default_range_min_bytes() -> i64 {
    1 << 20 // 1 MB
}

fn default_range_max_bytes() -> i64 {
    64 << 20 // 64 MB
}

fn default_gc_ttl_seconds() -> i64 {
    24 * 60 * 60
}

fn default_txn_heartbeat_timeout_ms() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            zone: ZoneConfig::default(),
            txn: TxnConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<()> {
        if self.node.addr.is_empty() {
            anyhow::bail!("node.addr must not be empty");
        }
        if !self.node.insecure && self.node.certs_dir.is_empty() {
            anyhow::bail!("secure mode requires node.certs_dir");
        }
        if self.node.store_count == 0 {
            anyhow::bail!("node.store_count must be > 0");
        }
        self.zone.validate()?;
        if self.txn.heartbeat_timeout_ms == 0 {
            anyhow::bail!("txn.heartbeat_timeout_ms must be > 0");
        }
        Ok(())
    }
}

impl ZoneConfig {
    /// Validate size-policy ordering.
    pub fn validate(&self) -> Result<()> {
        if self.replication_factor == 0 {
            anyhow::bail!("zone.replication_factor must be > 0");
        }
        if self.range_min_bytes <= 0 || self.range_max_bytes <= 0 {
            anyhow::bail!("zone range size bounds must be > 0");
        }
        if self.range_min_bytes >= self.range_max_bytes {
            anyhow::bail!(
                "zone.range_min_bytes ({}) must be below zone.range_max_bytes ({})",
                self.range_min_bytes,
                self.range_max_bytes
            );
        }
        if self.gc_ttl_seconds < 0 {
            anyhow::bail!("zone.gc_ttl_seconds must be >= 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid_when_insecure() {
        let mut config = Config::default();
        config.node.insecure = true;
        config.validate().expect("default insecure config valid");
    }

    #[test]
    fn secure_mode_requires_certs_dir() {
        let config = Config::default();
        assert!(!config.node.insecure);
        assert!(config.validate().is_err());
    }

    #[test]
    fn parses_partial_toml() {
        let raw = r#"
[node]
addr = "10.0.0.1:26257"
insecure = true

[zone]
range_max_bytes = 1048576
range_min_bytes = 65536
"#;
        let config: Config = toml::from_str(raw).unwrap();
        config.validate().unwrap();
        assert_eq!(config.node.addr, "10.0.0.1:26257");
        assert_eq!(config.zone.range_max_bytes, 1 << 20);
        assert_eq!(config.zone.replication_factor, 3);
    }

    #[test]
    fn rejects_inverted_size_bounds() {
        let zone = ZoneConfig {
            range_min_bytes: 100,
            range_max_bytes: 50,
            ..Default::default()
        };
        assert!(zone.validate().is_err());
    }
}
