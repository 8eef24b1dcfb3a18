//! Template Cache (C2)
//!
//! Bounded mapping `headerHash -> Template`, insertion idempotent on
//! `headerHash`. Eviction drops the oldest insertion together with its
//! Job Registry entry, keeping the two collections' key sets identical at
//! all times (spec.md §8 invariant 5).

use std::collections::HashMap;
use std::sync::Arc;

use duskpool_core::{current_timestamp, Hash, Target, Template};
use duskpool_crypto::PowHasher;
use duskpool_rpc::{NodeClient, SubmitOutcome};
use duskpool_storage::PersistenceGateway;
use log::{info, warn};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::registry::JobRegistry;

#[derive(Debug, Error)]
pub enum TemplateCacheError {
    #[error("storage error: {0}")]
    Storage(#[from] duskpool_storage::StorageError),
    #[error("upstream rpc error: {0}")]
    Rpc(#[from] duskpool_rpc::RpcError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitResult {
    Accepted,
    Rejected(String),
}

struct Inner {
    templates: HashMap<Hash, Template>,
    order: std::collections::VecDeque<Hash>,
}

pub struct TemplateCache {
    capacity: usize,
    inner: Mutex<Inner>,
    registry: Arc<JobRegistry>,
    node: Arc<dyn NodeClient>,
    storage: Arc<dyn PersistenceGateway>,
    hasher: Arc<dyn PowHasher>,
}

impl TemplateCache {
    pub fn new(
        capacity: usize,
        registry: Arc<JobRegistry>,
        node: Arc<dyn NodeClient>,
        storage: Arc<dyn PersistenceGateway>,
        hasher: Arc<dyn PowHasher>,
    ) -> Self {
        TemplateCache {
            capacity,
            inner: Mutex::new(Inner { templates: HashMap::new(), order: std::collections::VecDeque::new() }),
            registry,
            node,
            storage,
            hasher,
        }
    }

    /// Inserts `template`, deriving a job ID for it. Idempotent on
    /// `header_hash`: re-inserting the same hash does not create a second
    /// job. Evicts the oldest entry (cache + registry together) when over
    /// capacity.
    pub async fn insert(&self, template: Template) -> String {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = inner.templates.get(&template.header_hash) {
            if let Some(job_id) = self.find_job_id_for(existing.header_hash).await {
                return job_id;
            }
        }

        inner.templates.insert(template.header_hash, template.clone());
        inner.order.push_back(template.header_hash);

        if inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.templates.remove(&oldest);
                warn!("template cache over capacity, evicted {}", hex::encode(oldest));
            }
            self.registry.expire_next().await;
        }

        drop(inner);
        self.registry.derive_id(template.header_hash, template.daa_score).await
    }

    async fn find_job_id_for(&self, header_hash: Hash) -> Option<String> {
        self.registry.find_job_id_for_hash(header_hash).await
    }

    pub async fn get_pow(&self, header_hash: &Hash) -> Option<Template> {
        self.inner.lock().await.templates.get(header_hash).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.templates.len()
    }

    /// Applies `nonce` to the template identified by `header_hash`,
    /// finalizes the hash, forwards the assembled block to the node, and
    /// records a provisional `block_details` row with empty reward fields.
    pub async fn submit(
        &self,
        miner_id: &str,
        address: &str,
        header_hash: Hash,
        nonce: u64,
    ) -> Result<SubmitResult, TemplateCacheError> {
        let template = match self.get_pow(&header_hash).await {
            Some(t) => t,
            None => return Ok(SubmitResult::Rejected("job-not-found".to_string())),
        };

        let final_hash = self.hasher.hash_nonce(&template.raw_header, nonce);
        if !Target::from_hash(&final_hash).meets(&template.target) {
            return Ok(SubmitResult::Rejected("does-not-meet-target".to_string()));
        }

        let mut raw_block = template.raw_header.clone();
        raw_block.extend_from_slice(&nonce.to_be_bytes());
        for tx in &template.transactions {
            raw_block.extend_from_slice(tx);
        }

        match self.node.submit_block(raw_block, false).await? {
            SubmitOutcome::Accepted => {
                info!("miner {} ({}) found a block: {}", miner_id, address, hex::encode(final_hash));
                self.storage
                    .add_block_details(&hex::encode(final_hash), "", 0, template.daa_score, None)
                    .await?;
                Ok(SubmitResult::Accepted)
            }
            SubmitOutcome::Rejected(reason) => {
                warn!("node rejected submitted block from {}: {}", miner_id, reason);
                Ok(SubmitResult::Rejected(reason))
            }
        }
    }
}

/// Convenience helper mirroring spec.md's `current_timestamp()` usage for
/// logging freshness; kept here rather than re-exported widely since only
/// this module currently needs it alongside the submission path.
#[allow(dead_code)]
fn now() -> u64 {
    current_timestamp()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use duskpool_core::Target;
    use duskpool_crypto::Sha256dHasher;
    use duskpool_rpc::{NewBlockTemplateEvent, RpcError};
    use duskpool_storage::SqliteGateway;

    struct FakeNode {
        outcome: SubmitOutcome,
    }

    #[async_trait]
    impl NodeClient for FakeNode {
        async fn get_server_info(&self) -> Result<serde_json::Value, RpcError> {
            Ok(serde_json::json!({}))
        }
        async fn get_block_template(&self, _pay_address: &str, _extra_data: &str) -> Result<NewBlockTemplateEvent, RpcError> {
            unimplemented!()
        }
        async fn submit_block(&self, _raw_block: Vec<u8>, _allow_non_daa_blocks: bool) -> Result<SubmitOutcome, RpcError> {
            Ok(self.outcome.clone())
        }
        async fn get_daa_score_timestamp_estimate(&self, _daa_scores: &[u64]) -> Result<Vec<i64>, RpcError> {
            Ok(vec![])
        }
    }

    fn sample_template(header_hash: Hash) -> Template {
        Template {
            header_hash,
            raw_header: vec![1, 2, 3],
            transactions: vec![],
            pre_pow_hash: [0u8; 32],
            daa_score: 10,
            target: Target::MAX,
        }
    }

    fn make_cache(outcome: SubmitOutcome) -> TemplateCache {
        TemplateCache::new(
            2,
            Arc::new(JobRegistry::new()),
            Arc::new(FakeNode { outcome }),
            Arc::new(SqliteGateway::open_in_memory().unwrap()),
            Arc::new(Sha256dHasher),
        )
    }

    #[tokio::test]
    async fn insert_derives_job_id_and_respects_capacity() {
        let cache = make_cache(SubmitOutcome::Accepted);
        cache.insert(sample_template([1u8; 32])).await;
        cache.insert(sample_template([2u8; 32])).await;
        cache.insert(sample_template([3u8; 32])).await;
        assert_eq!(cache.len().await, 2);
    }

    #[tokio::test]
    async fn submit_unknown_header_hash_is_rejected() {
        let cache = make_cache(SubmitOutcome::Accepted);
        let result = cache.submit("miner1", "addr", [9u8; 32], 1).await.unwrap();
        assert_eq!(result, SubmitResult::Rejected("job-not-found".to_string()));
    }

    #[tokio::test]
    async fn submit_forwards_accepted_block_and_records_provisional_row() {
        let cache = make_cache(SubmitOutcome::Accepted);
        cache.insert(sample_template([4u8; 32])).await;
        let result = cache.submit("miner1", "addr", [4u8; 32], 7).await.unwrap();
        assert_eq!(result, SubmitResult::Accepted);
    }
}
