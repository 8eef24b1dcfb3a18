//! REST fallback for the node API: transaction/block lookups used by the
//! Treasury Tracker's mined-block resolution (§4.8), plus request/response
//! calls (`getServerInfo`, `submitBlock`, `getDaaScoreTimestampEstimate`)
//! that don't fit the subscription socket.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::{NewBlockTemplateEvent, NodeClient, RpcError, SubmitOutcome};

const MAX_ATTEMPTS: u32 = 3;
const RETRYABLE_STATUSES: &[u16] = &[404, 422, 429, 500, 501, 503];

#[derive(Debug, Error)]
pub enum RestError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("request failed after {0} attempts with status {1}")]
    ExhaustedRetries(u32, u16),

    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransactionLookup {
    pub block_hash: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerboseData {
    #[serde(rename = "mergeSetBluesHashes")]
    pub merge_set_blues_hashes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockHeader {
    #[serde(rename = "daaScore")]
    pub daa_score: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockExtra {
    #[serde(rename = "minerInfo")]
    pub miner_info: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlockLookup {
    #[serde(rename = "verboseData")]
    pub verbose_data: VerboseData,
    pub header: BlockHeader,
    pub extra: BlockExtra,
}

/// Thin `reqwest`-backed client with the linear-backoff retry policy
/// required by the node's REST surface.
pub struct RestClient {
    client: Client,
    base_url: String,
}

impl RestClient {
    pub fn new(base_url: &str) -> Self {
        RestClient { client: Client::new(), base_url: base_url.trim_end_matches('/').to_string() }
    }

    async fn get_with_retry(&self, path: &str) -> Result<reqwest::Response, RestError> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_status: Option<StatusCode> = None;
        for attempt in 1..=MAX_ATTEMPTS {
            let response = self.client.get(&url).send().await?;
            let status = response.status();
            if status.is_success() {
                return Ok(response);
            }
            if RETRYABLE_STATUSES.contains(&status.as_u16()) {
                last_status = Some(status);
                warn!("GET {} returned {}, attempt {}/{}", url, status, attempt, MAX_ATTEMPTS);
                tokio::time::sleep(Duration::from_secs(attempt as u64)).await;
                continue;
            }
            return Err(RestError::UnexpectedStatus(status.as_u16()));
        }
        Err(RestError::ExhaustedRetries(MAX_ATTEMPTS, last_status.map(|s| s.as_u16()).unwrap_or(0)))
    }

    /// `/transactions/{txId}` → `{block_hash: [...]}`
    pub async fn get_transaction(&self, tx_id: &str) -> Result<TransactionLookup, RestError> {
        let response = self.get_with_retry(&format!("/transactions/{}", tx_id)).await?;
        Ok(response.json().await?)
    }

    /// `/blocks/{hash}` → `{verboseData.mergeSetBluesHashes, header.daaScore, extra.minerInfo}`
    pub async fn get_block(&self, hash: &str) -> Result<BlockLookup, RestError> {
        let response = self.get_with_retry(&format!("/blocks/{}", hash)).await?;
        Ok(response.json().await?)
    }

    pub async fn get_server_info(&self) -> Result<serde_json::Value, RestError> {
        let response = self.get_with_retry("/info/server").await?;
        Ok(response.json().await?)
    }

    pub async fn get_daa_score_timestamp_estimate(&self, daa_scores: &[u64]) -> Result<Vec<i64>, RestError> {
        let query = daa_scores.iter().map(|d| d.to_string()).collect::<Vec<_>>().join(",");
        let response = self.get_with_retry(&format!("/info/daa-score-timestamp-estimate?daaScores={}", query)).await?;
        Ok(response.json().await?)
    }

    /// `/blocks/template?payAddress=...&extraData=...` → a fresh block
    /// template, used by the Template Cache when it needs one on demand
    /// rather than waiting on the next subscription push.
    pub async fn get_block_template(&self, pay_address: &str, extra_data: &str) -> Result<NewBlockTemplateEvent, RestError> {
        let response = self.get_with_retry(&format!("/blocks/template?payAddress={}&extraData={}", pay_address, extra_data)).await?;
        Ok(response.json().await?)
    }

    pub async fn submit_block(&self, raw_block: Vec<u8>, allow_non_daa_blocks: bool) -> Result<SubmitOutcome, RestError> {
        let url = format!("{}/blocks/submit?allowNonDAABlocks={}", self.base_url, allow_non_daa_blocks);
        let response = self.client.post(&url).body(raw_block).send().await?;
        if response.status().is_success() {
            debug!("block submitted successfully");
            Ok(SubmitOutcome::Accepted)
        } else {
            let reason = response.text().await.unwrap_or_default();
            Ok(SubmitOutcome::Rejected(reason))
        }
    }
}

/// `RestClient` is the production `NodeClient`: the Template Cache submits
/// mined blocks and looks up templates over this REST surface, not the
/// subscription socket.
#[async_trait]
impl NodeClient for RestClient {
    async fn get_server_info(&self) -> Result<serde_json::Value, RpcError> {
        Ok(self.get_server_info().await?)
    }

    async fn get_block_template(&self, pay_address: &str, extra_data: &str) -> Result<NewBlockTemplateEvent, RpcError> {
        Ok(self.get_block_template(pay_address, extra_data).await?)
    }

    async fn submit_block(&self, raw_block: Vec<u8>, allow_non_daa_blocks: bool) -> Result<SubmitOutcome, RpcError> {
        Ok(self.submit_block(raw_block, allow_non_daa_blocks).await?)
    }

    async fn get_daa_score_timestamp_estimate(&self, daa_scores: &[u64]) -> Result<Vec<i64>, RpcError> {
        Ok(self.get_daa_score_timestamp_estimate(daa_scores).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses_match_spec() {
        assert_eq!(RETRYABLE_STATUSES, &[404, 422, 429, 500, 501, 503]);
    }

    #[test]
    fn rest_client_strips_trailing_slash() {
        let client = RestClient::new("http://localhost:16110/");
        assert_eq!(client.base_url, "http://localhost:16110");
    }
}
