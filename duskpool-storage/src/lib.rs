//! Duskpool Persistence Gateway (C8)
//!
//! Exposes an ACID surface over a relational store (SQLite via
//! `rusqlite`), mirroring the teacher's `database` crate: a single
//! connection guarded by a `tokio::sync::Mutex`, with multi-statement
//! writes wrapped in `conn.transaction()` so they commit or roll back
//! atomically. Every operation releases its connection guard on all exit
//! paths via RAII — there is no path that leaks the lock.

use async_trait::async_trait;
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not found: {0}")]
    NotFound(String),
}

/// A resolved `(miner_id, wallet)` balance credit, as persisted by
/// `add_balance`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceDelta {
    pub kas_amount: i64,
    pub rebate_amount: i64,
}

/// How a `block_details` row's reward window was resolved, recorded for
/// operator auditability per spec.md §9 ("two separate allocation paths").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationPath {
    DaaWindow,
    TimeWeightedFallback,
}

impl AllocationPath {
    fn as_str(&self) -> &'static str {
        match self {
            AllocationPath::DaaWindow => "daa_window",
            AllocationPath::TimeWeightedFallback => "time_weighted_fallback",
        }
    }
}

/// Custodian-resolved user record, looked up by `get_user` when a Stratum
/// username is not a protocol address (spec.md §4.5).
#[derive(Debug, Clone)]
pub struct CustodianUser {
    pub identifier: String,
    pub wallet: String,
    pub miner_id: String,
}

/// Persistence surface consumed by the Stratum layer, the Treasury
/// Tracker, and the Reward Allocator. A trait so the allocator and
/// stratum crates can be tested against an in-memory fake without a
/// filesystem database.
#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// One transaction: read-modify-write `miners_balance` (composite key
    /// `miner_id|wallet`) and `wallet_total` (`wallet`); idempotent to
    /// retry since it's a plain increment, never a set.
    async fn add_balance(
        &self,
        miner_id: &str,
        wallet: &str,
        kas_amount: i64,
        rebate_amount: i64,
    ) -> Result<(), StorageError>;

    /// Insert a block-detail row, or upsert by `mined_block_hash`: only
    /// `reward_block_hash` and `miner_reward` are updated on conflict, per
    /// spec.md §4.2/§4.7 (the provisional row C2 writes on submission is
    /// later completed by the allocator).
    async fn add_block_details(
        &self,
        mined_block_hash: &str,
        reward_block_hash: &str,
        miner_reward: i64,
        mined_daa_score: u64,
        allocation_path: Option<AllocationPath>,
    ) -> Result<(), StorageError>;

    /// Upsert by `reward_tx_id`.
    async fn add_reward_details(&self, reward_block_hash: &str, reward_tx_id: &str) -> Result<(), StorageError>;

    /// Single-row lookup.
    async fn get_reward_block_hash(&self, reward_tx_id: &str) -> Result<Option<String>, StorageError>;

    /// Resolve a non-protocol Stratum username against the custodian-user
    /// table.
    async fn get_user(&self, identifier: &str) -> Result<Option<CustodianUser>, StorageError>;

    /// Credit the synthetic pool fee account, used when the allocator has
    /// no miner to attribute residual fee to (§4.7 step 6).
    async fn credit_pool_account(&self, kas_amount: i64) -> Result<(), StorageError>;
}

/// SQLite-backed implementation, the production gateway.
pub struct SqliteGateway {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGateway {
    pub async fn open(db_path: &Path) -> Result<Self, StorageError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        Self::create_tables(&conn)?;
        info!("opened persistence gateway at {}", db_path.display());
        Ok(SqliteGateway { conn: Arc::new(Mutex::new(conn)) })
    }

    /// In-memory database, used by tests and by `duskpool --datadir
    /// :memory:`-style ephemeral runs.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        Self::create_tables(&conn)?;
        Ok(SqliteGateway { conn: Arc::new(Mutex::new(conn)) })
    }

    fn create_tables(conn: &Connection) -> Result<(), StorageError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS miners_balance (
                miner_id TEXT NOT NULL,
                wallet TEXT NOT NULL,
                balance INTEGER NOT NULL DEFAULT 0,
                rebate INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (miner_id, wallet)
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS wallet_total (
                wallet TEXT PRIMARY KEY,
                balance INTEGER NOT NULL DEFAULT 0,
                rebate INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS block_details (
                mined_block_hash TEXT PRIMARY KEY,
                reward_block_hash TEXT NOT NULL,
                miner_reward INTEGER NOT NULL,
                mined_daa_score INTEGER NOT NULL,
                allocation_path TEXT,
                created_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS reward_details (
                reward_tx_id TEXT PRIMARY KEY,
                reward_block_hash TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS custodian_users (
                identifier TEXT PRIMARY KEY,
                wallet TEXT NOT NULL,
                miner_id TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS pool_account (
                id INTEGER PRIMARY KEY CHECK (id = 0),
                balance INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;
        conn.execute("INSERT OR IGNORE INTO pool_account (id, balance) VALUES (0, 0)", [])?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceGateway for SqliteGateway {
    async fn add_balance(
        &self,
        miner_id: &str,
        wallet: &str,
        kas_amount: i64,
        rebate_amount: i64,
    ) -> Result<(), StorageError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute(
            "INSERT INTO miners_balance (miner_id, wallet, balance, rebate) VALUES (?, ?, ?, ?)
             ON CONFLICT(miner_id, wallet) DO UPDATE SET
                balance = balance + excluded.balance,
                rebate = rebate + excluded.rebate",
            params![miner_id, wallet, kas_amount, rebate_amount],
        )?;

        tx.execute(
            "INSERT INTO wallet_total (wallet, balance, rebate) VALUES (?, ?, ?)
             ON CONFLICT(wallet) DO UPDATE SET
                balance = balance + excluded.balance,
                rebate = rebate + excluded.rebate",
            params![wallet, kas_amount, rebate_amount],
        )?;

        tx.commit()?;
        debug!("credited {} (+{} rebate) to miner {} wallet {}", kas_amount, rebate_amount, miner_id, wallet);
        Ok(())
    }

    async fn add_block_details(
        &self,
        mined_block_hash: &str,
        reward_block_hash: &str,
        miner_reward: i64,
        mined_daa_score: u64,
        allocation_path: Option<AllocationPath>,
    ) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO block_details (mined_block_hash, reward_block_hash, miner_reward, mined_daa_score, allocation_path)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(mined_block_hash) DO UPDATE SET
                reward_block_hash = excluded.reward_block_hash,
                miner_reward = excluded.miner_reward",
            params![
                mined_block_hash,
                reward_block_hash,
                miner_reward,
                mined_daa_score as i64,
                allocation_path.map(|p| p.as_str()),
            ],
        )?;
        Ok(())
    }

    async fn add_reward_details(&self, reward_block_hash: &str, reward_tx_id: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO reward_details (reward_tx_id, reward_block_hash) VALUES (?, ?)
             ON CONFLICT(reward_tx_id) DO UPDATE SET reward_block_hash = excluded.reward_block_hash",
            params![reward_tx_id, reward_block_hash],
        )?;
        Ok(())
    }

    async fn get_reward_block_hash(&self, reward_tx_id: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock().await;
        let hash = conn
            .query_row(
                "SELECT reward_block_hash FROM reward_details WHERE reward_tx_id = ?",
                params![reward_tx_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(hash)
    }

    async fn get_user(&self, identifier: &str) -> Result<Option<CustodianUser>, StorageError> {
        let conn = self.conn.lock().await;
        let user = conn
            .query_row(
                "SELECT identifier, wallet, miner_id FROM custodian_users WHERE identifier = ?",
                params![identifier],
                |row| {
                    Ok(CustodianUser { identifier: row.get(0)?, wallet: row.get(1)?, miner_id: row.get(2)? })
                },
            )
            .optional()?;
        if user.is_none() {
            warn!("no custodian user found for identifier {}", identifier);
        }
        Ok(user)
    }

    async fn credit_pool_account(&self, kas_amount: i64) -> Result<(), StorageError> {
        let conn = self.conn.lock().await;
        conn.execute("UPDATE pool_account SET balance = balance + ? WHERE id = 0", params![kas_amount])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_balance_updates_both_tables_transactionally() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        gw.add_balance("miner1", "wallet-a", 1000, 10).await.unwrap();
        gw.add_balance("miner1", "wallet-a", 500, 5).await.unwrap();

        let conn = gw.conn.lock().await;
        let (balance, rebate): (i64, i64) = conn
            .query_row("SELECT balance, rebate FROM miners_balance WHERE miner_id = ? AND wallet = ?", params!["miner1", "wallet-a"], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(balance, 1500);
        assert_eq!(rebate, 15);

        let (wallet_balance, wallet_rebate): (i64, i64) = conn
            .query_row("SELECT balance, rebate FROM wallet_total WHERE wallet = ?", params!["wallet-a"], |r| Ok((r.get(0)?, r.get(1)?)))
            .unwrap();
        assert_eq!(wallet_balance, 1500);
        assert_eq!(wallet_rebate, 15);
    }

    #[tokio::test]
    async fn block_details_upsert_only_touches_reward_fields() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        gw.add_block_details("block1", "reward1", 100, 500, Some(AllocationPath::DaaWindow)).await.unwrap();
        gw.add_block_details("block1", "reward2", 200, 999, None).await.unwrap();

        let conn = gw.conn.lock().await;
        let (reward_hash, reward, daa, path): (String, i64, i64, Option<String>) = conn
            .query_row(
                "SELECT reward_block_hash, miner_reward, mined_daa_score, allocation_path FROM block_details WHERE mined_block_hash = ?",
                params!["block1"],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .unwrap();
        assert_eq!(reward_hash, "reward2");
        assert_eq!(reward, 200);
        // mined_daa_score is not part of the ON CONFLICT UPDATE SET, so the
        // first-inserted value sticks.
        assert_eq!(daa, 500);
        assert_eq!(path.as_deref(), Some("daa_window"));
    }

    #[tokio::test]
    async fn reward_details_roundtrip() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        assert!(gw.get_reward_block_hash("tx1").await.unwrap().is_none());
        gw.add_reward_details("blockhash1", "tx1").await.unwrap();
        assert_eq!(gw.get_reward_block_hash("tx1").await.unwrap().as_deref(), Some("blockhash1"));
    }

    #[tokio::test]
    async fn unknown_user_returns_none() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        assert!(gw.get_user("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pool_account_accumulates() {
        let gw = SqliteGateway::open_in_memory().unwrap();
        gw.credit_pool_account(1000).await.unwrap();
        gw.credit_pool_account(500).await.unwrap();
        let conn = gw.conn.lock().await;
        let balance: i64 = conn.query_row("SELECT balance FROM pool_account WHERE id = 0", [], |r| r.get(0)).unwrap();
        assert_eq!(balance, 1500);
    }
}
