//! Job Registry (C1)
//!
//! Assigns a short, monotonically increasing hex job ID to each template
//! hash accepted by the Template Cache. Expiration is FIFO and kept in
//! lockstep with the cache by construction: callers always pair an
//! `expire_next` with an eviction on the cache side.

use std::collections::{HashMap, VecDeque};

use duskpool_core::{DaaScore, Hash};
use tokio::sync::Mutex;

struct RegistryEntry {
    header_hash: Hash,
    daa_score: DaaScore,
}

struct Inner {
    next_id: u64,
    jobs: HashMap<String, RegistryEntry>,
    order: VecDeque<String>,
}

pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        JobRegistry { inner: Mutex::new(Inner { next_id: 0, jobs: HashMap::new(), order: VecDeque::new() }) }
    }

    /// Issues the next job ID for `header_hash`, rendered as short hex.
    pub async fn derive_id(&self, header_hash: Hash, daa_score: DaaScore) -> String {
        let mut inner = self.inner.lock().await;
        let id = format!("{:x}", inner.next_id);
        inner.next_id += 1;
        inner.jobs.insert(id.clone(), RegistryEntry { header_hash, daa_score });
        inner.order.push_back(id.clone());
        id
    }

    pub async fn get_hash(&self, job_id: &str) -> Option<Hash> {
        self.inner.lock().await.jobs.get(job_id).map(|e| e.header_hash)
    }

    pub async fn get_daa_score(&self, job_id: &str) -> Option<DaaScore> {
        self.inner.lock().await.jobs.get(job_id).map(|e| e.daa_score)
    }

    /// Reverse lookup used by the Template Cache's idempotent `insert`: the
    /// still-live job ID already issued for `header_hash`, if any.
    pub async fn find_job_id_for_hash(&self, header_hash: Hash) -> Option<String> {
        let inner = self.inner.lock().await;
        inner.jobs.iter().find(|(_, entry)| entry.header_hash == header_hash).map(|(id, _)| id.clone())
    }

    /// Evicts and returns the oldest job ID, if any. Called in lockstep
    /// with the Template Cache's own eviction of the corresponding
    /// template.
    pub async fn expire_next(&self) -> Option<String> {
        let mut inner = self.inner.lock().await;
        let oldest = inner.order.pop_front()?;
        inner.jobs.remove(&oldest);
        Some(oldest)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.jobs.len()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ids_are_monotonically_increasing_hex() {
        let registry = JobRegistry::new();
        let a = registry.derive_id([1u8; 32], 1).await;
        let b = registry.derive_id([2u8; 32], 2).await;
        assert_eq!(a, "0");
        assert_eq!(b, "1");
    }

    #[tokio::test]
    async fn expire_next_is_fifo() {
        let registry = JobRegistry::new();
        let a = registry.derive_id([1u8; 32], 1).await;
        let _b = registry.derive_id([2u8; 32], 2).await;
        let expired = registry.expire_next().await.unwrap();
        assert_eq!(expired, a);
        assert!(registry.get_hash(&a).await.is_none());
    }

    #[tokio::test]
    async fn lookup_returns_daa_score() {
        let registry = JobRegistry::new();
        let id = registry.derive_id([3u8; 32], 777).await;
        assert_eq!(registry.get_daa_score(&id).await, Some(777));
    }
}
