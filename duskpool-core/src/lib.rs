//! Duskpool Core Types and Data Model
//!
//! Shared types used across the pool: the template/job pair the upstream
//! feed hands down, the per-worker bookkeeping the Stratum layer and
//! VarDiff controller share, and the contribution records the reward
//! allocator consumes.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// 32-byte block/header hash.
pub type Hash = [u8; 32];

/// Smallest indivisible unit of the coin (1 coin = 10^8 sompi).
pub type Sompi = u64;

/// Network-assigned difficulty-adjustment ordinal, monotonic along the
/// selected chain.
pub type DaaScore = u64;

/// Core error types shared across crates.
#[derive(Error, Debug)]
pub enum CoreError {
    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("template not found for hash {0}")]
    TemplateNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),
}

/// Network identifier for the upstream node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Testnet10,
    Testnet11,
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Mainnet => write!(f, "mainnet"),
            Network::Testnet10 => write!(f, "testnet-10"),
            Network::Testnet11 => write!(f, "testnet-11"),
        }
    }
}

/// A payout identifier: either a protocol-validated address string or an
/// opaque custodian-user identifier resolvable via the persistence gateway.
pub type PayoutAddress = String;

/// 256-bit proof-of-work target, stored big-endian. Smaller target means
/// higher difficulty, matching the usual PoW convention: a hash "beats" a
/// target when interpreted as a big-endian integer it is numerically
/// less than or equal to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Target(pub [u8; 32]);

impl Target {
    /// The maximum possible target (minimum possible difficulty).
    pub const MAX: Target = Target([0xff; 32]);

    pub fn from_hash(hash: &Hash) -> Target {
        Target(*hash)
    }

    /// True if `self` (interpreted as a hash) meets `target`, i.e.
    /// `self <= target` as a big-endian 256-bit integer.
    pub fn meets(&self, target: &Target) -> bool {
        self.0 <= target.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// An immutable block template cached by the Template Cache (C2). Created
/// on `new-block-template`; destroyed only by LRU eviction, together with
/// its Job Registry entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub header_hash: Hash,
    pub raw_header: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
    pub pre_pow_hash: Hash,
    pub daa_score: DaaScore,
    pub target: Target,
}

/// A compact job identifier issued by the Job Registry (C1), 1:1 with a
/// Template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub job_id: String,
    pub header_hash: Hash,
    pub daa_score: DaaScore,
}

/// Identity of a connected worker: the payout address it mines for and the
/// worker name it authorized with.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerIdentity {
    pub payout_address: PayoutAddress,
    pub worker_name: String,
}

impl WorkerIdentity {
    pub fn key(&self) -> String {
        format!("{}.{}", self.payout_address, self.worker_name)
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.payout_address, self.worker_name)
    }
}

/// ASIC family detected from the `mining.subscribe` user agent, governing
/// which header encoding and nonce parsing rules apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AsicType {
    /// Default big-header encoding.
    Generic,
    /// Bitmain/GodMiner-compatible encoding: timestamp appended to
    /// `mining.notify`, nonce parsed as decimal.
    Bitmain,
}

impl Default for AsicType {
    fn default() -> Self {
        AsicType::Generic
    }
}

/// One recorded share, kept in a worker's recent-share deque for duplicate
/// detection and pruned to a rolling window.
#[derive(Debug, Clone, Copy)]
pub struct RecentShare {
    pub timestamp_secs: u64,
    pub difficulty: f64,
    pub nonce: u64,
}

/// Window (in seconds) over which duplicate nonces are tracked per worker.
pub const RECENT_SHARE_WINDOW_SECS: u64 = 600;

/// Per-worker statistics, created on `authorize` and pruned when the
/// worker goes quiet past the activity window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStats {
    pub identity: WorkerIdentity,
    pub asic_type: AsicType,
    pub start_time: u64,
    pub last_share: u64,
    pub shares_found: u64,
    pub stale_shares: u64,
    pub invalid_shares: u64,
    pub duplicated_shares: u64,
    pub blocks_found: u64,
    pub min_diff: f64,
    pub var_diff_enabled: bool,
    pub var_diff_start_time: u64,
    pub var_diff_shares_found: u64,
    pub var_diff_window: usize,

    #[serde(skip)]
    pub recent_shares: VecDeque<RecentShare>,
    pub hashrate: f64,
}

impl WorkerStats {
    pub fn new(identity: WorkerIdentity, asic_type: AsicType, min_diff: f64, var_diff_enabled: bool) -> Self {
        let now = current_timestamp();
        WorkerStats {
            identity,
            asic_type,
            start_time: now,
            last_share: now,
            shares_found: 0,
            stale_shares: 0,
            invalid_shares: 0,
            duplicated_shares: 0,
            blocks_found: 0,
            min_diff,
            var_diff_enabled,
            var_diff_start_time: 0,
            var_diff_shares_found: 0,
            var_diff_window: 0,
            recent_shares: VecDeque::new(),
            hashrate: 0.0,
        }
    }

    /// Drop recent-share entries older than [`RECENT_SHARE_WINDOW_SECS`].
    pub fn prune_recent_shares(&mut self, now: u64) {
        while let Some(front) = self.recent_shares.front() {
            if now.saturating_sub(front.timestamp_secs) > RECENT_SHARE_WINDOW_SECS {
                self.recent_shares.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn is_duplicate(&self, nonce: u64) -> bool {
        self.recent_shares.iter().any(|s| s.nonce == nonce)
    }
}

/// A validated share, produced on a valid submission (§3 "Share
/// (Contribution)"). Lives in the share window until the allocator
/// consumes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contribution {
    pub payout_address: PayoutAddress,
    pub worker_name: String,
    pub difficulty: f64,
    pub timestamp: u64,
    pub job_id: String,
    pub daa_score: DaaScore,
}

/// Classification of a submitted share, mirroring §4.6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Valid,
    Block,
    Duplicate,
    Stale,
    LowDifficulty,
}

/// Stratum error codes used in the `(code, message, data?)` error form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumErrorCode {
    DuplicateShare,
    JobNotFound,
    LowDifficultyShare,
    Unknown,
}

impl StratumErrorCode {
    pub fn code(&self) -> i64 {
        match self {
            StratumErrorCode::DuplicateShare => 22,
            StratumErrorCode::JobNotFound => 21,
            StratumErrorCode::LowDifficultyShare => 23,
            StratumErrorCode::Unknown => 20,
        }
    }

    pub fn message(&self) -> &'static str {
        match self {
            StratumErrorCode::DuplicateShare => "duplicate-share",
            StratumErrorCode::JobNotFound => "job-not-found",
            StratumErrorCode::LowDifficultyShare => "low-difficulty-share",
            StratumErrorCode::Unknown => "unknown",
        }
    }
}

/// Get current timestamp in seconds since the epoch.
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_meets_is_le_comparison() {
        let low = Target([0u8; 32]);
        let high = Target([0xff; 32]);
        assert!(low.meets(&high));
        assert!(!high.meets(&low));
        assert!(high.meets(&high));
    }

    #[test]
    fn worker_stats_prunes_old_shares() {
        let identity = WorkerIdentity { payout_address: "addr".into(), worker_name: "rig01".into() };
        let mut stats = WorkerStats::new(identity, AsicType::Generic, 1.0, true);
        stats.recent_shares.push_back(RecentShare { timestamp_secs: 0, difficulty: 1.0, nonce: 1 });
        stats.recent_shares.push_back(RecentShare { timestamp_secs: 1000, difficulty: 1.0, nonce: 2 });
        stats.prune_recent_shares(1000);
        assert_eq!(stats.recent_shares.len(), 1);
        assert_eq!(stats.recent_shares.front().unwrap().nonce, 2);
    }

    #[test]
    fn duplicate_detection_by_nonce() {
        let identity = WorkerIdentity { payout_address: "addr".into(), worker_name: "rig01".into() };
        let mut stats = WorkerStats::new(identity, AsicType::Generic, 1.0, true);
        stats.recent_shares.push_back(RecentShare { timestamp_secs: 0, difficulty: 1.0, nonce: 42 });
        assert!(stats.is_duplicate(42));
        assert!(!stats.is_duplicate(43));
    }
}
