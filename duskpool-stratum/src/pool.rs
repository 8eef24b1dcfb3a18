//! Wires the Job Registry (C1), Template Cache (C2), and Shares Manager
//! (C6) to the Stratum Session Layer (C5): accepts connections on each
//! configured port, derives jobs from upstream templates, and broadcasts
//! `mining.notify` to every authorized session.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use duskpool_core::{current_timestamp, AsicType};
use duskpool_crypto::PowHasher;
use duskpool_rpc::{NewBlockTemplateEvent, NodeClient};
use duskpool_storage::PersistenceGateway;
use log::{error, info, warn};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};

use crate::cache::TemplateCache;
use crate::registry::JobRegistry;
use crate::session::{ConnectionState, PortPolicy, SessionInfo, StratumSession};
use crate::shares::{ShareWindow, SharesManager, SharesManagerConfig};

const VARDIFF_TICK: Duration = Duration::from_secs(10);
const STATS_SWEEP: Duration = Duration::from_secs(600);

pub struct StratumPort {
    pub policy: Arc<PortPolicy>,
    pub shares_config: SharesManagerConfig,
}

/// A connected session's outbound channel plus a live view of its
/// `ConnectionState`/`AsicType`, so `broadcast_notify` can gate delivery
/// and shape the wire encoding without touching the session's own lock.
struct NotifyHandle {
    tx: mpsc::Sender<String>,
    info: watch::Receiver<SessionInfo>,
}

pub struct MiningPool {
    registry: Arc<JobRegistry>,
    template_cache: Arc<TemplateCache>,
    shares_managers: HashMap<u16, Arc<SharesManager>>,
    share_window: ShareWindow,
    storage: Arc<dyn PersistenceGateway>,
    hasher: Arc<dyn PowHasher>,
    notify_senders: Arc<Mutex<HashMap<SocketAddr, NotifyHandle>>>,
}

impl MiningPool {
    pub fn new(
        template_cache_size: usize,
        node: Arc<dyn NodeClient>,
        storage: Arc<dyn PersistenceGateway>,
        hasher: Arc<dyn PowHasher>,
        ports: Vec<StratumPort>,
    ) -> Self {
        let registry = Arc::new(JobRegistry::new());
        let template_cache = Arc::new(TemplateCache::new(template_cache_size, registry.clone(), node, storage.clone(), hasher.clone()));
        let share_window: ShareWindow = Arc::new(Mutex::new(Vec::new()));

        let mut shares_managers = HashMap::new();
        for port in ports {
            let manager = Arc::new(SharesManager::new(port.shares_config, registry.clone(), template_cache.clone(), share_window.clone()));
            shares_managers.insert(port.policy.port, manager);
        }

        MiningPool {
            registry,
            template_cache,
            shares_managers,
            share_window,
            storage,
            hasher,
            notify_senders: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn registry(&self) -> Arc<JobRegistry> {
        self.registry.clone()
    }

    pub fn template_cache(&self) -> Arc<TemplateCache> {
        self.template_cache.clone()
    }

    /// Pool-wide share window shared by every port's `SharesManager`,
    /// handed to the Reward Allocator so it drains contributions across
    /// the whole pool rather than one port.
    pub fn share_window(&self) -> ShareWindow {
        self.share_window.clone()
    }

    /// Snapshot of every active worker across all ports, for the Reward
    /// Allocator's time-weighted fallback path.
    pub async fn active_worker_snapshots(&self) -> Vec<duskpool_core::WorkerStats> {
        let mut snapshot = Vec::new();
        for manager in self.shares_managers.values() {
            snapshot.extend(manager.worker_snapshot().await);
        }
        snapshot
    }

    /// Binds and accepts connections for one configured Stratum port.
    pub async fn serve_port(&self, policy: Arc<PortPolicy>) -> std::io::Result<()> {
        let bind_addr: SocketAddr = ([0, 0, 0, 0], policy.port).into();
        let listener = TcpListener::bind(bind_addr).await?;
        info!("stratum listening on {}", bind_addr);

        let shares_manager = self.shares_managers.get(&policy.port).cloned().expect("shares manager configured for every port");

        loop {
            let (stream, addr) = listener.accept().await?;
            let policy = policy.clone();
            let shares_manager = shares_manager.clone();
            let storage = self.storage.clone();
            let hasher = self.hasher.clone();
            let notify_senders = self.notify_senders.clone();

            tokio::spawn(async move {
                let (notify_tx, notify_rx) = mpsc::channel(64);
                let session = StratumSession::new(addr, policy, shares_manager, storage, hasher, notify_tx.clone());
                let info = session.subscribe_info();
                notify_senders.lock().await.insert(addr, NotifyHandle { tx: notify_tx, info });

                if let Err(e) = session.run(stream, notify_rx).await {
                    warn!("session {} ended: {}", addr, e);
                }

                notify_senders.lock().await.remove(&addr);
            });
        }
    }

    /// Inserts a new upstream template, derives a job ID, and broadcasts
    /// `mining.notify` to every connected session.
    pub async fn handle_new_block_template(&self, event: NewBlockTemplateEvent) {
        let header_hash = match decode_hash(&event.header_hash) {
            Some(h) => h,
            None => {
                error!("malformed header hash in new-block-template event: {}", event.header_hash);
                return;
            }
        };
        let target = decode_hash(&event.target).map(duskpool_core::Target).unwrap_or(duskpool_core::Target::MAX);
        let pre_pow_hash = decode_hash(&event.pre_pow_hash).unwrap_or([0u8; 32]);

        let template = duskpool_core::Template {
            header_hash,
            raw_header: event.raw_header,
            transactions: event.transactions,
            pre_pow_hash,
            daa_score: event.daa_score,
            target,
        };

        let job_id = self.template_cache.insert(template).await;
        self.broadcast_notify(&job_id, event.daa_score).await;
    }

    /// Delivers `mining.notify` only to sessions that have completed
    /// `mining.authorize`, and encodes it per the subscriber's ASIC family
    /// (Bitmain-compatible miners expect a trailing timestamp, spec.md
    /// §6).
    async fn broadcast_notify(&self, job_id: &str, daa_score: u64) {
        let senders = self.notify_senders.lock().await;
        for (addr, handle) in senders.iter() {
            let info = *handle.info.borrow();
            if info.connection_state != ConnectionState::Authorized {
                continue;
            }
            let notification = encode_notify(job_id, daa_score, info.encoding);
            if handle.tx.send(notification).await.is_err() {
                warn!("failed to deliver mining.notify to {}", addr);
            }
        }
    }

    /// Spawns the per-port VarDiff tick and activity sweep background
    /// tasks (spec.md §4.6).
    pub fn spawn_maintenance_tasks(&self) {
        for manager in self.shares_managers.values() {
            let manager = manager.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(VARDIFF_TICK);
                loop {
                    ticker.tick().await;
                    manager.vardiff_tick().await;
                }
            });

            let manager = manager.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(STATS_SWEEP);
                loop {
                    ticker.tick().await;
                    let stale = manager.activity_sweep().await;
                    if !stale.is_empty() {
                        info!("activity sweep pruned {} inactive workers", stale.len());
                    }
                }
            });
        }
    }
}

fn encode_notify(job_id: &str, daa_score: u64, encoding: AsicType) -> String {
    match encoding {
        AsicType::Bitmain => json!({
            "id": Value::Null,
            "method": "mining.notify",
            "params": [job_id, daa_score, current_timestamp()],
        })
        .to_string(),
        AsicType::Generic => json!({
            "id": Value::Null,
            "method": "mining.notify",
            "params": [job_id, daa_score],
        })
        .to_string(),
    }
}

fn decode_hash(hex_str: &str) -> Option<duskpool_core::Hash> {
    let bytes = hex::decode(hex_str).ok()?;
    if bytes.len() != 32 {
        return None;
    }
    let mut h = [0u8; 32];
    h.copy_from_slice(&bytes);
    Some(h)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duskpool_crypto::Sha256dHasher;
    use duskpool_rpc::{RpcError, SubmitOutcome};
    use duskpool_storage::SqliteGateway;

    struct NoopNode;

    #[async_trait]
    impl NodeClient for NoopNode {
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

    fn make_pool() -> MiningPool {
        let policy = Arc::new(PortPolicy {
            port: 5555,
            initial_difficulty: 1.0,
            extra_nonce_size: 2,
            allow_user_difficulty: false,
            var_diff: true,
            min_diff: 1.0,
        });
        let shares_config = SharesManagerConfig { shares_per_minute: 10.0, clamp_pow2: true, min_diff: 1.0, max_diff: 1_000_000.0 };
        MiningPool::new(
            16,
            Arc::new(NoopNode),
            Arc::new(SqliteGateway::open_in_memory().unwrap()),
            Arc::new(Sha256dHasher),
            vec![StratumPort { policy, shares_config }],
        )
    }

    #[tokio::test]
    async fn new_block_template_derives_job_and_caches_it() {
        let pool = make_pool();
        pool.handle_new_block_template(NewBlockTemplateEvent {
            header_hash: hex::encode([1u8; 32]),
            raw_header: vec![1, 2, 3],
            transactions: vec![],
            pre_pow_hash: hex::encode([0u8; 32]),
            daa_score: 42,
            target: hex::encode([0xffu8; 32]),
        })
        .await;
        assert_eq!(pool.template_cache().len().await, 1);
        assert_eq!(pool.registry().len().await, 1);
    }

    #[tokio::test]
    async fn malformed_header_hash_is_ignored() {
        let pool = make_pool();
        pool.handle_new_block_template(NewBlockTemplateEvent {
            header_hash: "not-hex".to_string(),
            raw_header: vec![],
            transactions: vec![],
            pre_pow_hash: hex::encode([0u8; 32]),
            daa_score: 1,
            target: hex::encode([0xffu8; 32]),
        })
        .await;
        assert_eq!(pool.template_cache().len().await, 0);
    }
}
