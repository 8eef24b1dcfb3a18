//! Shared helpers for Duskpool: hex/base58 conversions, logging
//! initialization, and pool configuration loading.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UtilError {
    #[error("hex decoding error: {0}")]
    HexError(#[from] hex::FromHexError),

    #[error("base58 decoding error: {0}")]
    Base58Error(#[from] bs58::decode::Error),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

/// Converts a hex string to bytes.
pub fn hex_to_bytes(hex: &str) -> Result<Vec<u8>, UtilError> {
    Ok(hex::decode(hex)?)
}

/// Converts bytes to a hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Converts a base58 string to bytes.
pub fn base58_to_bytes(b58: &str) -> Result<Vec<u8>, UtilError> {
    Ok(bs58::decode(b58).into_vec()?)
}

/// Converts bytes to a base58 string.
pub fn bytes_to_base58(bytes: &[u8]) -> String {
    bs58::encode(bytes).into_string()
}

/// Formats a unix timestamp as an ISO 8601 string.
pub fn format_timestamp(timestamp: i64) -> String {
    chrono::DateTime::<chrono::Utc>::from_timestamp(timestamp, 0)
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%SZ").to_string())
        .unwrap_or_else(|| "invalid timestamp".to_string())
}

/// Initialize logging based on a 0..=5 verbosity level, mirroring the
/// mapping the node CLI uses.
pub fn init_logging(verbosity: u8) {
    let log_level = match verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new().filter_level(log_level).format_timestamp_millis().init();
}

/// Per-port Stratum listener configuration (§6 "stratum port table").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumPortConfig {
    pub port: u16,
    pub initial_difficulty: f64,
    pub shares_per_minute: f64,
    pub clamp_pow2: bool,
    pub var_diff: bool,
    pub extra_nonce_size: usize,
    pub min_diff: f64,
    pub max_diff: f64,
    /// Only this port allows miner-set difficulty via `mining.authorize`'s
    /// optional difficulty parameter (spec.md §4.5).
    pub allow_user_difficulty: bool,
}

/// Top-level pool configuration, loaded from a TOML file layered with
/// `DUSKPOOL_`-prefixed environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub network: String,
    pub node_rpc_url: String,
    pub node_rest_url: String,
    pub pool_address: String,
    pub pool_fee_bps: u32,
    pub rebate_bps: u32,
    pub template_cache_size: usize,
    pub pool_miner_info_tag: String,
    pub database_path: PathBuf,
    pub treasury_worker_pool_size: usize,
    pub stratum_ports: Vec<StratumPortConfig>,
}

impl PoolConfig {
    /// Load configuration from `path`, overridable by `DUSKPOOL_*`
    /// environment variables, following the layered-source convention of
    /// the `config` crate.
    pub fn load(path: &str) -> Result<Self, UtilError> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path).required(false))
            .add_source(config::Environment::with_prefix("DUSKPOOL").separator("__"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// A redacted clone suitable for logging or the `show-config` CLI
    /// subcommand — the pool address is the only field that, by policy,
    /// must never be shown truncated or masked (it is public), but this
    /// hook exists so future secret fields (e.g. a signing key) have a
    /// single place to redact.
    pub fn redacted(&self) -> Self {
        self.clone()
    }

    pub fn stratum_bind_addrs(&self) -> Vec<SocketAddr> {
        self.stratum_ports.iter().map(|p| SocketAddr::from(([0, 0, 0, 0], p.port))).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_roundtrip() {
        let bytes = vec![1, 2, 3, 255];
        let hex = bytes_to_hex(&bytes);
        assert_eq!(hex_to_bytes(&hex).unwrap(), bytes);
    }

    #[test]
    fn base58_roundtrip() {
        let bytes = vec![9, 8, 7];
        let b58 = bytes_to_base58(&bytes);
        assert_eq!(base58_to_bytes(&b58).unwrap(), bytes);
    }
}
