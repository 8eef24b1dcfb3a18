//! Duskpool Reward Allocator (C7)
//!
//! On a matured coinbase event, partitions the share window into the DAA
//! range the mined block actually covers and credits balances
//! proportionally. Falls back to a synthetic, activity-weighted share
//! list when the mined block's DAA score could not be resolved or the
//! primary window was empty.

use std::collections::HashMap;
use std::sync::Arc;

use duskpool_core::Contribution;
use duskpool_rpc::rest::RestClient;
use duskpool_storage::{AllocationPath, PersistenceGateway};
use duskpool_treasury::CoinbaseEvent;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

/// Shared with the Shares Manager: the deque of valid contributions since
/// the last coinbase event drained it.
pub type ShareWindow = Arc<Mutex<Vec<Contribution>>>;

#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("storage error: {0}")]
    Storage(#[from] duskpool_storage::StorageError),
}

/// Snapshot of an active worker, supplied by the caller (the Shares
/// Manager owns the live `WorkerStats` map) for the fallback allocation
/// path.
#[derive(Debug, Clone)]
pub struct ActiveWorkerSnapshot {
    pub payout_address: String,
    pub worker_name: String,
    pub min_diff: f64,
    pub seconds_since_last_share: u64,
}

#[derive(Debug, Clone)]
pub struct AllocatorConfig {
    pub rebate_bps: u32,
    pub pool_miner_info_tag: String,
}

#[derive(Debug, Clone, Default)]
struct WorkAgg {
    difficulty: f64,
    /// First-seen miner ID for this address, kept for display only (spec.md
    /// §4.7 tie-break).
    miner_id: String,
}

#[derive(Debug, Clone)]
pub struct AllocationOutcome {
    pub mined_block_hash: String,
    pub mined_daa_score: u64,
    pub allocation_path: Option<AllocationPath>,
    pub miners_credited: usize,
    pub total_credited: u64,
    pub pool_account_credit: u64,
}

pub struct RewardAllocator {
    config: AllocatorConfig,
    storage: Arc<dyn PersistenceGateway>,
    rest: Arc<RestClient>,
    share_window: ShareWindow,
}

impl RewardAllocator {
    pub fn new(config: AllocatorConfig, storage: Arc<dyn PersistenceGateway>, rest: Arc<RestClient>, share_window: ShareWindow) -> Self {
        RewardAllocator { config, storage, rest, share_window }
    }

    /// Given `rewardBlockHash`, iterates its merge-set blues looking for
    /// the one whose miner-info string carries the configured pool tag;
    /// that block's DAA score is authoritative (spec.md §4.8). Returns
    /// `(String::new(), 0)` if no match is found, signaling the fallback
    /// path to the caller.
    pub async fn resolve_mined_block(&self, reward_block_hash: &str) -> (String, u64) {
        if reward_block_hash.is_empty() {
            return (String::new(), 0);
        }

        let reward_block = match self.rest.get_block(reward_block_hash).await {
            Ok(block) => block,
            Err(e) => {
                warn!("failed to fetch reward block {}: {}", reward_block_hash, e);
                return (String::new(), 0);
            }
        };

        for blue_hash in &reward_block.verbose_data.merge_set_blues_hashes {
            match self.rest.get_block(blue_hash).await {
                Ok(block) => {
                    if let Some(miner_info) = &block.extra.miner_info {
                        if miner_info.contains(&self.config.pool_miner_info_tag) {
                            return (blue_hash.clone(), block.header.daa_score);
                        }
                    }
                }
                Err(e) => warn!("failed to fetch candidate mined block {}: {}", blue_hash, e),
            }
        }
        (String::new(), 0)
    }

    /// Executes the full allocation sequence for one coinbase event.
    pub async fn allocate(&self, event: CoinbaseEvent, active_workers: &[ActiveWorkerSnapshot]) -> Result<AllocationOutcome, AllocatorError> {
        let (mined_block_hash, mined_daa_score) = self.resolve_mined_block(&event.reward_block_hash).await;
        let gross = event.miner_reward + event.pool_fee;

        self.storage
            .add_block_details(&mined_block_hash_or_unresolved(&mined_block_hash), &event.reward_block_hash, gross as i64, mined_daa_score, None)
            .await?;

        let primary = self.drain_primary_window(mined_daa_score).await;
        let (works, allocation_path) = if !primary.is_empty() {
            (aggregate(primary), AllocationPath::DaaWindow)
        } else {
            (aggregate_fallback(active_workers), AllocationPath::TimeWeightedFallback)
        };

        if works.is_empty() {
            info!("coinbase for tx {} had no attributable work, crediting pool account", event.tx_id);
            self.storage.credit_pool_account(gross as i64).await?;
            return Ok(AllocationOutcome {
                mined_block_hash,
                mined_daa_score,
                allocation_path: None,
                miners_credited: 0,
                total_credited: 0,
                pool_account_credit: gross,
            });
        }

        let total_work: f64 = works.values().map(|w| w.difficulty).sum();
        let total_work_scaled = scale(total_work);

        let mut total_credited: i128 = 0;
        let mut total_rebate: i128 = 0;

        for agg in works.values() {
            let work_scaled = scale(agg.difficulty);
            let miner_share = (work_scaled * event.miner_reward as i128) / total_work_scaled;
            let rebate = (work_scaled * event.pool_fee as i128 * self.config.rebate_bps as i128 / 10_000) / total_work_scaled;

            self.storage.add_balance(&agg.miner_id, &wallet_of(&agg.miner_id), miner_share as i64, rebate as i64).await?;
            total_credited += miner_share;
            total_rebate += rebate;
        }

        let leftover_miner_reward = event.miner_reward as i128 - total_credited;
        let pool_fee_residual = event.pool_fee as i128 - total_rebate;
        let pool_account_credit = (leftover_miner_reward + pool_fee_residual).max(0);
        if pool_account_credit > 0 {
            self.storage.credit_pool_account(pool_account_credit as i64).await?;
        }

        self.storage
            .add_block_details(&mined_block_hash_or_unresolved(&mined_block_hash), &event.reward_block_hash, gross as i64, mined_daa_score, Some(allocation_path))
            .await?;

        info!(
            "allocated coinbase tx={} path={:?} miners={} credited={} pool_account_credit={}",
            event.tx_id, allocation_path, works.len(), total_credited, pool_account_credit
        );

        Ok(AllocationOutcome {
            mined_block_hash,
            mined_daa_score,
            allocation_path: Some(allocation_path),
            miners_credited: works.len(),
            total_credited: total_credited as u64,
            pool_account_credit: pool_account_credit as u64,
        })
    }

    async fn drain_primary_window(&self, mined_daa_score: u64) -> Vec<Contribution> {
        if mined_daa_score == 0 {
            return Vec::new();
        }
        let mut window = self.share_window.lock().await;
        let (primary, remainder): (Vec<_>, Vec<_>) = window.drain(..).partition(|c| c.daa_score <= mined_daa_score);
        *window = remainder;
        primary
    }
}

/// The mined-block-hash column is non-null in `block_details`; an
/// unresolved mined block is recorded under the reward block hash itself
/// so the provisional row still has a stable key to upsert against.
fn mined_block_hash_or_unresolved(mined_block_hash: &str) -> String {
    if mined_block_hash.is_empty() {
        format!("unresolved:{}", duskpool_core::current_timestamp())
    } else {
        mined_block_hash.to_string()
    }
}

fn wallet_of(miner_id: &str) -> String {
    miner_id.split('.').next().unwrap_or(miner_id).to_string()
}

fn aggregate(contributions: Vec<Contribution>) -> HashMap<String, WorkAgg> {
    let mut map: HashMap<String, WorkAgg> = HashMap::new();
    for c in contributions {
        let entry = map.entry(c.payout_address.clone()).or_insert_with(|| WorkAgg {
            difficulty: 0.0,
            miner_id: format!("{}.{}", c.payout_address, c.worker_name),
        });
        entry.difficulty += c.difficulty;
    }
    map
}

/// Fallback share synthesis: weight each active worker's `minDiff` by
/// `min(timeSinceLastShare, 5 min) / 5 min`, lower-bounded by
/// `floor(minDiff * 0.1)` or 1 (spec.md §4.7 step 4).
fn aggregate_fallback(active_workers: &[ActiveWorkerSnapshot]) -> HashMap<String, WorkAgg> {
    const FIVE_MINUTES_SECS: f64 = 300.0;
    let mut map: HashMap<String, WorkAgg> = HashMap::new();
    for worker in active_workers {
        let weight = (worker.seconds_since_last_share as f64).min(FIVE_MINUTES_SECS) / FIVE_MINUTES_SECS;
        let lower_bound = (worker.min_diff * 0.1).floor().max(1.0);
        let work = (worker.min_diff * weight).max(lower_bound);

        let entry = map.entry(worker.payout_address.clone()).or_insert_with(|| WorkAgg {
            difficulty: 0.0,
            miner_id: format!("{}.{}", worker.payout_address, worker.worker_name),
        });
        entry.difficulty += work;
    }
    map
}

/// Scales a floating difficulty into an integer domain (×100) so payout
/// math is done with integer division, matching spec.md §4.7's
/// "scaled integer division" requirement.
fn scale(value: f64) -> i128 {
    ((value * 100.0).round() as i128).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use duskpool_storage::SqliteGateway;
    use duskpool_treasury::CoinbaseEvent;

    fn sample_contribution(address: &str, worker: &str, difficulty: f64, daa_score: u64) -> Contribution {
        Contribution {
            payout_address: address.to_string(),
            worker_name: worker.to_string(),
            difficulty,
            timestamp: 0,
            job_id: "0".to_string(),
            daa_score,
        }
    }

    fn make_allocator(storage: Arc<dyn PersistenceGateway>) -> RewardAllocator {
        let config = AllocatorConfig { rebate_bps: 1000, pool_miner_info_tag: "duskpool".to_string() };
        let rest = Arc::new(RestClient::new("http://localhost:1"));
        RewardAllocator::new(config, storage, rest, Arc::new(Mutex::new(Vec::new())))
    }

    #[tokio::test]
    async fn allocation_splits_proportionally_and_conserves_total() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let allocator = make_allocator(storage.clone());
        {
            let mut window = allocator.share_window.lock().await;
            window.push(sample_contribution("addrA", "rig1", 100.0, 50));
            window.push(sample_contribution("addrB", "rig1", 300.0, 50));
            window.push(sample_contribution("addrC", "rig1", 999.0, 999_999));
        }

        let event = CoinbaseEvent { miner_reward: 4_000, pool_fee: 100, reward_block_hash: String::new(), tx_id: "tx1".to_string(), daa_score: 50 };
        let outcome = allocator.allocate(event, &[]).await.unwrap();

        assert_eq!(outcome.allocation_path, Some(AllocationPath::DaaWindow));
        assert_eq!(outcome.miners_credited, 2);
        assert!(outcome.total_credited <= 4_000);

        // addrC's contribution has a DAA score past the mined block and
        // must remain in the window for a later event.
        let window = allocator.share_window.lock().await;
        assert_eq!(window.len(), 1);
        assert_eq!(window[0].payout_address, "addrC");
    }

    #[tokio::test]
    async fn empty_window_falls_back_to_active_workers() {
        let storage: Arc<dyn PersistenceGateway> = Arc::new(SqliteGateway::open_in_memory().unwrap());
        let allocator = make_allocator(storage.clone());

        let active = vec![ActiveWorkerSnapshot {
            payout_address: "addrA".to_string(),
            worker_name: "rig1".to_string(),
            min_diff: 64.0,
            seconds_since_last_share: 600,
        }];

        let event = CoinbaseEvent { miner_reward: 1_000, pool_fee: 10, reward_block_hash: String::new(), tx_id: "tx2".to_string(), daa_score: 10 };
        let outcome = allocator.allocate(event, &active).await.unwrap();
        assert_eq!(outcome.allocation_path, Some(AllocationPath::TimeWeightedFallback));
        assert_eq!(outcome.miners_credited, 1);
    }

    #[test]
    fn fallback_weighting_has_a_floor() {
        let active = vec![ActiveWorkerSnapshot {
            payout_address: "addrA".to_string(),
            worker_name: "rig1".to_string(),
            min_diff: 64.0,
            seconds_since_last_share: 0,
        }];
        let works = aggregate_fallback(&active);
        assert_eq!(works["addrA"].difficulty, 6.0);
    }
}
