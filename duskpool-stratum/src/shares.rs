//! Shares Manager and VarDiff controller (C6)
//!
//! Classifies submissions against the Job Registry and Template Cache,
//! maintains the per-worker `WorkerStats`, and runs the VarDiff feedback
//! controller that renegotiates a worker's assigned difficulty.

use std::collections::HashMap;
use std::sync::Arc;

use duskpool_core::{
    current_timestamp, AsicType, Contribution, Hash, RecentShare, ShareOutcome, StratumErrorCode, Target,
    WorkerIdentity, WorkerStats,
};
use duskpool_crypto::{difficulty_to_target, round_down_pow2, PowHasher};
use log::{debug, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};

use crate::cache::{SubmitResult, TemplateCache, TemplateCacheError};
use crate::registry::JobRegistry;

/// VarDiff window durations in minutes, `0` meaning the steady-state
/// window (spec.md §4.6).
pub const VARDIFF_WINDOWS_MINUTES: [u64; 7] = [1, 3, 10, 30, 60, 240, 0];
pub const VARDIFF_TOLERANCES: [f64; 7] = [1.0, 0.5, 0.25, 0.15, 0.10, 0.10, 0.10];

/// Coarse hashrate-to-difficulty table used by the rejection-rate
/// override, seven bands from 64 up to 32768.
const REJECTION_OVERRIDE_BANDS: [f64; 7] = [64.0, 256.0, 1024.0, 4096.0, 8192.0, 16384.0, 32768.0];

const ACTIVITY_SWEEP_SECS: u64 = 600;
const VARDIFF_TICK_SECS: u64 = 10;

/// The share window entry produced by a valid submission, aggregated by
/// the Reward Allocator.
pub type ShareWindow = Arc<Mutex<Vec<Contribution>>>;

pub struct SharesManagerConfig {
    pub shares_per_minute: f64,
    pub clamp_pow2: bool,
    pub min_diff: f64,
    pub max_diff: f64,
}

pub struct SharesManager {
    config: SharesManagerConfig,
    workers: Arc<Mutex<HashMap<String, WorkerStats>>>,
    assigned_difficulty: Arc<Mutex<HashMap<String, f64>>>,
    share_window: ShareWindow,
    registry: Arc<JobRegistry>,
    template_cache: Arc<TemplateCache>,
    notify_senders: Arc<Mutex<HashMap<String, mpsc::Sender<String>>>>,
}

impl SharesManager {
    /// `share_window` is shared pool-wide (not per-port): the Reward
    /// Allocator aggregates contributions across every Stratum port for a
    /// single coinbase event.
    pub fn new(config: SharesManagerConfig, registry: Arc<JobRegistry>, template_cache: Arc<TemplateCache>, share_window: ShareWindow) -> Self {
        SharesManager {
            config,
            workers: Arc::new(Mutex::new(HashMap::new())),
            assigned_difficulty: Arc::new(Mutex::new(HashMap::new())),
            share_window,
            registry,
            template_cache,
            notify_senders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn share_window(&self) -> ShareWindow {
        self.share_window.clone()
    }

    /// `notify_tx` is the worker's own session's outbound channel, used by
    /// `vardiff_tick` to push `mining.set_difficulty` when it renegotiates
    /// this worker's difficulty.
    pub async fn register_worker(&self, identity: WorkerIdentity, asic_type: AsicType, min_diff: f64, var_diff_enabled: bool, notify_tx: mpsc::Sender<String>) {
        let key = identity.key();
        let stats = WorkerStats::new(identity, asic_type, min_diff, var_diff_enabled);
        self.assigned_difficulty.lock().await.insert(key.clone(), min_diff);
        self.notify_senders.lock().await.insert(key.clone(), notify_tx);
        self.workers.lock().await.insert(key, stats);
    }

    pub async fn assigned_difficulty(&self, worker_key: &str) -> Option<f64> {
        self.assigned_difficulty.lock().await.get(worker_key).copied()
    }

    /// Classifies and records a share per spec.md §4.6. `job_id` resolves
    /// through the Job Registry to a template in the Template Cache.
    pub async fn add_share(
        &self,
        miner_id: &str,
        identity: &WorkerIdentity,
        job_id: &str,
        nonce: u64,
        hasher: &dyn PowHasher,
    ) -> Result<ShareOutcome, StratumErrorCode> {
        let worker_key = identity.key();
        let now = current_timestamp();

        let mut workers = self.workers.lock().await;
        let stats = workers.get_mut(&worker_key).ok_or(StratumErrorCode::Unknown)?;
        stats.prune_recent_shares(now);

        if stats.is_duplicate(nonce) {
            stats.duplicated_shares += 1;
            debug!("duplicate share from {} (nonce={})", worker_key, nonce);
            return Ok(ShareOutcome::Duplicate);
        }

        let header_hash = match self.registry.get_hash(job_id).await {
            Some(h) => h,
            None => {
                stats.stale_shares += 1;
                return Err(StratumErrorCode::JobNotFound);
            }
        };

        let template = match self.template_cache.get_pow(&header_hash).await {
            Some(t) => t,
            None => {
                stats.stale_shares += 1;
                return Err(StratumErrorCode::JobNotFound);
            }
        };

        let assigned_diff = *self.assigned_difficulty.lock().await.get(&worker_key).unwrap_or(&stats.min_diff);
        let assigned_target = difficulty_to_target(assigned_diff);
        let pow_hash = hasher.hash_nonce(&template.raw_header, nonce);
        let pow_target = Target::from_hash(&pow_hash);

        if !pow_target.meets(&assigned_target) {
            stats.invalid_shares += 1;
            return Err(StratumErrorCode::LowDifficultyShare);
        }

        stats.shares_found += 1;
        stats.var_diff_shares_found += 1;
        stats.last_share = now;
        stats.recent_shares.push_back(RecentShare { timestamp_secs: now, difficulty: assigned_diff, nonce });

        let contribution = Contribution {
            payout_address: identity.payout_address.clone(),
            worker_name: identity.worker_name.clone(),
            difficulty: assigned_diff,
            timestamp: now,
            job_id: job_id.to_string(),
            daa_score: template.daa_score,
        };
        self.share_window.lock().await.push(contribution);

        if pow_target.meets(&template.target) {
            stats.blocks_found += 1;
            drop(workers);
            match self.template_cache.submit(miner_id, &identity.payout_address, header_hash, nonce).await {
                Ok(SubmitResult::Accepted) => info!("block submitted by {}", worker_key),
                Ok(SubmitResult::Rejected(reason)) => warn!("block submission by {} rejected: {}", worker_key, reason),
                Err(TemplateCacheError::Storage(e)) => warn!("failed to persist block record for {}: {}", worker_key, e),
                Err(TemplateCacheError::Rpc(e)) => warn!("upstream rpc error submitting block for {}: {}", worker_key, e),
            }
            return Ok(ShareOutcome::Block);
        }

        Ok(ShareOutcome::Valid)
    }

    /// One VarDiff tick for every worker with `var_diff_enabled`. Intended
    /// to run on a 10-second interval (spec.md §4.6).
    pub async fn vardiff_tick(&self) {
        let now = current_timestamp();
        let mut workers = self.workers.lock().await;
        let mut assigned = self.assigned_difficulty.lock().await;
        let senders = self.notify_senders.lock().await;

        for (key, stats) in workers.iter_mut() {
            if !stats.var_diff_enabled {
                continue;
            }
            let current_diff = *assigned.get(key).unwrap_or(&stats.min_diff);
            if let Some(new_diff) = self.evaluate_vardiff(stats, current_diff, now) {
                assigned.insert(key.clone(), new_diff);
                stats.var_diff_start_time = 0;
                stats.var_diff_window = 0;
                stats.var_diff_shares_found = 0;
                info!("vardiff adjusted {} -> {:.2}", key, new_diff);

                if let Some(tx) = senders.get(key) {
                    let message = json!({ "id": Value::Null, "method": "mining.set_difficulty", "params": [new_diff] }).to_string();
                    if tx.send(message).await.is_err() {
                        warn!("failed to push mining.set_difficulty to {}", key);
                    }
                }
            }
        }
    }

    fn evaluate_vardiff(&self, stats: &mut WorkerStats, current_diff: f64, now: u64) -> Option<f64> {
        if stats.shares_found >= 20 && stats.invalid_shares as f64 / stats.shares_found as f64 >= 0.20 {
            let band_diff = self.rejection_override_difficulty(stats.hashrate);
            return Some(self.clamp(band_diff));
        }

        if stats.var_diff_start_time == 0 {
            stats.var_diff_start_time = now;
        }

        let window_minutes = VARDIFF_WINDOWS_MINUTES[stats.var_diff_window.min(VARDIFF_WINDOWS_MINUTES.len() - 1)];
        let tolerance = VARDIFF_TOLERANCES[stats.var_diff_window.min(VARDIFF_TOLERANCES.len() - 1)];
        let elapsed_minutes = (now.saturating_sub(stats.var_diff_start_time)) as f64 / 60.0;

        let duration_minutes = if window_minutes == 0 { elapsed_minutes.max(1.0 / 60.0) } else { window_minutes as f64 };
        if elapsed_minutes < duration_minutes && window_minutes != 0 {
            return None;
        }

        let share_rate = stats.var_diff_shares_found as f64 / duration_minutes.max(1.0 / 60.0);
        let expected_rate = self.config.shares_per_minute;
        let ratio = share_rate / expected_rate;

        if window_minutes == 0 {
            if (1.0 - ratio).abs() >= tolerance {
                let new_diff = current_diff * ratio.max(0.1);
                return Some(self.clamp(self.maybe_clamp_pow2(new_diff)));
            }
            return None;
        }

        if (1.0 - ratio).abs() < tolerance {
            if stats.var_diff_window + 1 < VARDIFF_WINDOWS_MINUTES.len() {
                stats.var_diff_window += 1;
            }
            return None;
        }

        let new_diff = current_diff * ratio.max(0.1);
        Some(self.clamp(self.maybe_clamp_pow2(new_diff)))
    }

    fn maybe_clamp_pow2(&self, diff: f64) -> f64 {
        if self.config.clamp_pow2 {
            round_down_pow2(diff)
        } else {
            diff
        }
    }

    fn rejection_override_difficulty(&self, hashrate: f64) -> f64 {
        for band in REJECTION_OVERRIDE_BANDS {
            if hashrate <= band * 1_000_000.0 {
                return band;
            }
        }
        *REJECTION_OVERRIDE_BANDS.last().unwrap()
    }

    fn clamp(&self, diff: f64) -> f64 {
        diff.clamp(self.config.min_diff, self.config.max_diff)
    }

    /// Per-worker hashrate estimate scaled to the recent-share window,
    /// closes sockets whose worker has gone silent past the activity
    /// window. Returns the keys of workers that should be disconnected;
    /// the caller (session layer) owns actually closing the socket.
    pub async fn activity_sweep(&self) -> Vec<String> {
        let now = current_timestamp();
        let mut workers = self.workers.lock().await;
        let mut stale = Vec::new();

        for (key, stats) in workers.iter_mut() {
            stats.prune_recent_shares(now);
            stats.hashrate = estimate_hashrate(&stats.recent_shares);
            if now.saturating_sub(stats.last_share) > ACTIVITY_SWEEP_SECS {
                stale.push(key.clone());
            }
        }

        for key in &stale {
            workers.remove(key);
        }
        stale
    }

    pub async fn remove_worker(&self, worker_key: &str) {
        self.workers.lock().await.remove(worker_key);
        self.assigned_difficulty.lock().await.remove(worker_key);
        self.notify_senders.lock().await.remove(worker_key);
    }

    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    /// Snapshot of all currently active workers, consumed by the Reward
    /// Allocator's time-weighted fallback path (spec.md §4.7 step 4) when
    /// the primary DAA-window share list is empty.
    pub async fn worker_snapshot(&self) -> Vec<WorkerStats> {
        self.workers.lock().await.values().cloned().collect()
    }
}

/// Hashrate estimate from the recent-share deque: `Σ(difficulty * 2^32) /
/// window_seconds`, the usual share-weighted hashrate approximation.
fn estimate_hashrate(recent_shares: &std::collections::VecDeque<RecentShare>) -> f64 {
    if recent_shares.is_empty() {
        return 0.0;
    }
    let oldest = recent_shares.front().unwrap().timestamp_secs;
    let newest = recent_shares.back().unwrap().timestamp_secs;
    let window = (newest.saturating_sub(oldest)).max(1) as f64;
    let total_difficulty: f64 = recent_shares.iter().map(|s| s.difficulty).sum();
    total_difficulty * 2f64.powi(32) / window
}

#[cfg(test)]
mod tests {
    use super::*;
    use duskpool_crypto::Sha256dHasher;
    use duskpool_rpc::{NewBlockTemplateEvent, RpcError, SubmitOutcome};
    use duskpool_storage::SqliteGateway;
    use duskpool_core::Template;
    use async_trait::async_trait;

    struct AcceptingNode;

    #[async_trait]
    impl duskpool_rpc::NodeClient for AcceptingNode {
        async fn get_server_info(&self) -> Result<serde_json::Value, RpcError> {
            Ok(serde_json::json!({}))
        }
        async fn get_block_template(&self, _pay_address: &str, _extra_data: &str) -> Result<NewBlockTemplateEvent, RpcError> {
            unimplemented!()
        }
        async fn submit_block(&self, _raw_block: Vec<u8>, _allow_non_daa_blocks: bool) -> Result<SubmitOutcome, RpcError> {
            Ok(SubmitOutcome::Accepted)
        }
        async fn get_daa_score_timestamp_estimate(&self, _daa_scores: &[u64]) -> Result<Vec<i64>, RpcError> {
            Ok(vec![])
        }
    }

    async fn make_manager() -> (SharesManager, Hash) {
        let registry = Arc::new(JobRegistry::new());
        let cache = Arc::new(TemplateCache::new(
            10,
            registry.clone(),
            Arc::new(AcceptingNode),
            Arc::new(SqliteGateway::open_in_memory().unwrap()),
            Arc::new(Sha256dHasher),
        ));
        let header_hash = [5u8; 32];
        cache
            .insert(Template {
                header_hash,
                raw_header: vec![9, 9, 9],
                transactions: vec![],
                pre_pow_hash: [0u8; 32],
                daa_score: 100,
                target: Target::MAX,
            })
            .await;

        let config = SharesManagerConfig { shares_per_minute: 10.0, clamp_pow2: true, min_diff: 1.0, max_diff: 1_000_000.0 };
        (SharesManager::new(config, registry, cache), header_hash)
    }

    #[tokio::test]
    async fn duplicate_nonce_is_rejected_silently() {
        let (manager, _) = make_manager().await;
        let identity = WorkerIdentity { payout_address: "addr".into(), worker_name: "rig".into() };
        let (notify_tx, _notify_rx) = mpsc::channel(8);
        manager.register_worker(identity.clone(), AsicType::Generic, 1.0, false, notify_tx).await;

        let outcome1 = manager.add_share("miner1", &identity, "0", 1, &Sha256dHasher).await.unwrap();
        assert_eq!(outcome1, ShareOutcome::Block);

        let outcome2 = manager.add_share("miner1", &identity, "0", 1, &Sha256dHasher).await.unwrap();
        assert_eq!(outcome2, ShareOutcome::Duplicate);
    }

    #[tokio::test]
    async fn unknown_job_id_is_stale() {
        let (manager, _) = make_manager().await;
        let identity = WorkerIdentity { payout_address: "addr".into(), worker_name: "rig".into() };
        let (notify_tx, _notify_rx) = mpsc::channel(8);
        manager.register_worker(identity.clone(), AsicType::Generic, 1.0, false, notify_tx).await;

        let err = manager.add_share("miner1", &identity, "nonexistent-job", 1, &Sha256dHasher).await.unwrap_err();
        assert_eq!(err, StratumErrorCode::JobNotFound);
    }

    #[test]
    fn vardiff_windows_and_tolerances_match_spec() {
        assert_eq!(VARDIFF_WINDOWS_MINUTES, [1, 3, 10, 30, 60, 240, 0]);
        assert_eq!(VARDIFF_TOLERANCES, [1.0, 0.5, 0.25, 0.15, 0.10, 0.10, 0.10]);
    }

    #[test]
    fn hashrate_estimate_is_zero_for_empty_window() {
        assert_eq!(estimate_hashrate(&std::collections::VecDeque::new()), 0.0);
    }
}
