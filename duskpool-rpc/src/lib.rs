//! Duskpool Upstream Feed (C3)
//!
//! Maintains the pool's one connection to the node: a WebSocket
//! subscription to `new-block-template` / `block-added` / UTXO-processor
//! events, plus a REST fallback used by the Reward Allocator and Treasury
//! Tracker to resolve transactions and blocks. Reconnection is serialized
//! by a single-flight guard the way the teacher's `PeerManager` serializes
//! peer reconnects.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message;

pub mod rest;
pub use rest::{RestClient, RestError};

const RPC_RETRY_INTERVAL: Duration = Duration::from_secs(5);
const WATCHDOG_TICK: Duration = Duration::from_secs(30);
const WATCHDOG_STALE_AFTER: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("rpc request timeout")]
    Timeout,

    #[error("node rejected request: {0}")]
    Rejected(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("rest error: {0}")]
    Rest(#[from] rest::RestError),
}

/// Block template pushed by `new-block-template`, consumed by C1/C2.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBlockTemplateEvent {
    pub header_hash: String,
    pub raw_header: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
    pub pre_pow_hash: String,
    pub daa_score: u64,
    pub target: String,
}

/// A transaction output, as scanned by the Treasury Tracker for matches
/// against the pool's payout address.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub address: String,
    pub amount: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockTransaction {
    pub tx_id: String,
    pub outputs: Vec<TransactionOutput>,
    pub is_coinbase: bool,
}

/// `block-added` event, consumed by the Treasury Tracker's block queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockAddedEvent {
    pub block_hash: String,
    pub merge_set_blues_hashes: Vec<String>,
    pub daa_score: u64,
    pub timestamp: i64,
    #[serde(default)]
    pub transactions: Vec<BlockTransaction>,
    #[serde(default = "default_true")]
    pub is_chain_block: bool,
}

fn default_true() -> bool {
    true
}

/// UTXO-processor `maturity` event for a pool-address coinbase output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaturityEvent {
    pub reward: u64,
    pub block_daa_score: u64,
    pub tx_id: String,
    pub is_coinbase: bool,
    pub estimated_timestamp: i64,
}

#[derive(Debug, Clone)]
pub enum NodeEvent {
    NewBlockTemplate(NewBlockTemplateEvent),
    BlockAdded(BlockAddedEvent),
    UtxoProcStart,
    Maturity(MaturityEvent),
}

/// Result of submitting a mined block to the node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    Rejected(String),
}

/// Everything the Template Cache needs from the node for request/response
/// calls (`RestClient` is the production implementation; `WsNodeClient`
/// only carries the long-lived subscription feed and does not implement
/// this trait). A trait so the Template Cache can be tested against an
/// in-memory fake node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn get_server_info(&self) -> Result<serde_json::Value, RpcError>;

    async fn get_block_template(&self, pay_address: &str, extra_data: &str) -> Result<NewBlockTemplateEvent, RpcError>;

    async fn submit_block(&self, raw_block: Vec<u8>, allow_non_daa_blocks: bool) -> Result<SubmitOutcome, RpcError>;

    async fn get_daa_score_timestamp_estimate(&self, daa_scores: &[u64]) -> Result<Vec<i64>, RpcError>;
}

/// WebSocket-backed node client. Owns the background reader/reconnect
/// task; events are delivered to callers over an `mpsc` channel handed
/// out by `subscribe`.
pub struct WsNodeClient {
    url: String,
    events_tx: mpsc::Sender<NodeEvent>,
    reconnecting: Arc<Mutex<bool>>,
    last_block_added: Arc<Mutex<std::time::Instant>>,
    force_reconnect: Arc<Notify>,
}

impl WsNodeClient {
    /// Connects and spawns the background subscription + watchdog tasks.
    /// Returns the client plus the receiving half of the event channel.
    pub async fn connect(url: &str) -> (Self, mpsc::Receiver<NodeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(1024);
        let client = WsNodeClient {
            url: url.to_string(),
            events_tx,
            reconnecting: Arc::new(Mutex::new(false)),
            last_block_added: Arc::new(Mutex::new(std::time::Instant::now())),
            force_reconnect: Arc::new(Notify::new()),
        };
        client.spawn_feed_task();
        client.spawn_watchdog();
        (client, events_rx)
    }

    fn spawn_feed_task(&self) {
        let url = self.url.clone();
        let events_tx = self.events_tx.clone();
        let reconnecting = self.reconnecting.clone();
        let last_block_added = self.last_block_added.clone();
        let force_reconnect = self.force_reconnect.clone();
        tokio::spawn(async move {
            loop {
                match Self::run_subscription(&url, events_tx.clone(), last_block_added.clone(), force_reconnect.clone()).await {
                    Ok(()) => info!("upstream feed closed cleanly"),
                    Err(e) => warn!("upstream feed error: {}, reconnecting in {:?}", e, RPC_RETRY_INTERVAL),
                }
                *reconnecting.lock().await = true;
                tokio::time::sleep(RPC_RETRY_INTERVAL).await;
                *reconnecting.lock().await = false;
            }
        });
    }

    /// Every `WATCHDOG_TICK`, checks how long it's been since the last
    /// `block-added` event. Past `WATCHDOG_STALE_AFTER` the feed is
    /// considered stalled (socket open, node gone silent) and the watchdog
    /// wakes the subscription task's read loop so it tears down and
    /// reconnects, which re-subscribes to every topic and thereby
    /// re-registers the Treasury Tracker against the fresh connection.
    fn spawn_watchdog(&self) {
        let last_block_added = self.last_block_added.clone();
        let reconnecting = self.reconnecting.clone();
        let force_reconnect = self.force_reconnect.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WATCHDOG_TICK);
            loop {
                ticker.tick().await;
                let elapsed = last_block_added.lock().await.elapsed();
                if elapsed > WATCHDOG_STALE_AFTER {
                    let already_reconnecting = *reconnecting.lock().await;
                    if !already_reconnecting {
                        warn!("no block-added event for {:?}, tearing down subscriptions", elapsed);
                        force_reconnect.notify_one();
                        *last_block_added.lock().await = std::time::Instant::now();
                    }
                }
            }
        });
    }

    async fn run_subscription(
        url: &str,
        events_tx: mpsc::Sender<NodeEvent>,
        last_block_added: Arc<Mutex<std::time::Instant>>,
        force_reconnect: Arc<Notify>,
    ) -> Result<(), RpcError> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(url).await?;
        info!("connected to upstream node at {}", url);
        let (mut write, mut read) = ws_stream.split();

        write.send(Message::Text(subscribe_payload("new-block-template"))).await?;
        write.send(Message::Text(subscribe_payload("block-added"))).await?;
        write.send(Message::Text(subscribe_payload("utxo-proc-start"))).await?;
        write.send(Message::Text(subscribe_payload("maturity"))).await?;

        loop {
            let msg = tokio::select! {
                msg = read.next() => match msg {
                    Some(msg) => msg?,
                    None => return Ok(()),
                },
                _ = force_reconnect.notified() => {
                    warn!("watchdog forced reconnect of upstream feed at {}", url);
                    return Err(RpcError::Timeout);
                }
            };
            if !msg.is_text() {
                continue;
            }
            let text = msg.into_text()?;
            match parse_event(&text) {
                Ok(Some(event)) => {
                    if matches!(event, NodeEvent::BlockAdded(_)) {
                        *last_block_added.lock().await = std::time::Instant::now();
                    }
                    if events_tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => debug!("unrecognized upstream message: {}", text),
                Err(e) => warn!("failed to parse upstream message: {}", e),
            }
        }
    }
}

fn subscribe_payload(topic: &str) -> String {
    serde_json::json!({ "method": format!("subscribe-{}", topic) }).to_string()
}

fn parse_event(text: &str) -> Result<Option<NodeEvent>, RpcError> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let topic = value.get("topic").and_then(|t| t.as_str()).unwrap_or_default();
    match topic {
        "new-block-template" => Ok(Some(NodeEvent::NewBlockTemplate(serde_json::from_value(value["data"].clone())?))),
        "block-added" => Ok(Some(NodeEvent::BlockAdded(serde_json::from_value(value["data"].clone())?))),
        "utxo-proc-start" => Ok(Some(NodeEvent::UtxoProcStart)),
        "maturity" => Ok(Some(NodeEvent::Maturity(serde_json::from_value(value["data"].clone())?))),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_block_added_event() {
        let msg = serde_json::json!({
            "topic": "block-added",
            "data": {
                "block_hash": "abc",
                "merge_set_blues_hashes": ["a", "b"],
                "daa_score": 42,
                "timestamp": 100,
            }
        })
        .to_string();
        let event = parse_event(&msg).unwrap().unwrap();
        match event {
            NodeEvent::BlockAdded(e) => {
                assert_eq!(e.block_hash, "abc");
                assert_eq!(e.daa_score, 42);
            }
            _ => panic!("wrong event variant"),
        }
    }

    #[test]
    fn unrecognized_topic_yields_none() {
        let msg = serde_json::json!({ "topic": "something-else", "data": {} }).to_string();
        assert!(parse_event(&msg).unwrap().is_none());
    }
}
