//! Stratum Session Layer (C5)
//!
//! Line-delimited JSON transport. Each line is a request
//! `{id, method, params}` or a notification. Inbound buffer is capped at
//! 512 bytes; oversize lines end the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use duskpool_core::{AsicType, StratumErrorCode, WorkerIdentity};
use duskpool_crypto::{is_protocol_address, PowHasher};
use duskpool_storage::PersistenceGateway;
use log::{debug, info, warn};
use rand::Rng;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};

use crate::shares::SharesManager;

const MAX_INBOUND_LINE_BYTES: usize = 512;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("oversize inbound line ({0} bytes)")]
    Oversize(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Subscribed,
    Authorized,
    Closed,
}

/// Snapshot of connection state and ASIC encoding the pool needs to gate
/// and shape `mining.notify` broadcasts, published by the session over a
/// `watch` channel so the pool never touches the session's own lock.
#[derive(Debug, Clone, Copy)]
pub struct SessionInfo {
    pub connection_state: ConnectionState,
    pub encoding: AsicType,
}

/// Per-connection mutable state (spec.md §3 "Connection State").
pub struct SessionState {
    pub assigned_difficulty: f64,
    pub extra_nonce: Option<String>,
    pub encoding: AsicType,
    pub workers: std::collections::HashMap<String, WorkerIdentity>,
    pub connection_state: ConnectionState,
    pub closing: bool,
}

pub struct PortPolicy {
    pub port: u16,
    pub initial_difficulty: f64,
    pub extra_nonce_size: usize,
    pub allow_user_difficulty: bool,
    pub var_diff: bool,
    pub min_diff: f64,
}

/// Detects ASIC family by user-agent, governing header encoding.
fn detect_asic_type(user_agent: &str) -> AsicType {
    let bitmain_re = Regex::new(r"(?i)bitmain|antminer|godminer").unwrap();
    if bitmain_re.is_match(user_agent) {
        AsicType::Bitmain
    } else {
        AsicType::Generic
    }
}

pub struct StratumSession {
    addr: SocketAddr,
    state: Mutex<SessionState>,
    policy: Arc<PortPolicy>,
    shares_manager: Arc<SharesManager>,
    storage: Arc<dyn PersistenceGateway>,
    hasher: Arc<dyn PowHasher>,
    notify_tx: mpsc::Sender<String>,
    info_tx: watch::Sender<SessionInfo>,
}

impl StratumSession {
    pub fn new(
        addr: SocketAddr,
        policy: Arc<PortPolicy>,
        shares_manager: Arc<SharesManager>,
        storage: Arc<dyn PersistenceGateway>,
        hasher: Arc<dyn PowHasher>,
        notify_tx: mpsc::Sender<String>,
    ) -> Self {
        let (info_tx, _info_rx) = watch::channel(SessionInfo { connection_state: ConnectionState::Connected, encoding: AsicType::Generic });
        StratumSession {
            addr,
            state: Mutex::new(SessionState {
                assigned_difficulty: policy.initial_difficulty,
                extra_nonce: None,
                encoding: AsicType::Generic,
                workers: std::collections::HashMap::new(),
                connection_state: ConnectionState::Connected,
                closing: false,
            }),
            policy,
            shares_manager,
            storage,
            hasher,
            notify_tx,
            info_tx,
        }
    }

    /// Lets the pool observe this session's `ConnectionState`/`AsicType`
    /// without reaching into its internal lock, used to gate and shape
    /// `mining.notify` broadcasts.
    pub fn subscribe_info(&self) -> watch::Receiver<SessionInfo> {
        self.info_tx.subscribe()
    }

    async fn push_notification(&self, method: &str, params: Value) {
        let line = json!({ "id": Value::Null, "method": method, "params": params }).to_string();
        if self.notify_tx.send(line).await.is_err() {
            debug!("{} failed to push {}, session gone", self.addr, method);
        }
    }

    /// Drives a single connection until it closes or an oversize line is
    /// received. `notify_rx` carries outbound `mining.notify` /
    /// `mining.set_difficulty` lines pushed by the pool; writes from both
    /// the request loop and the notify forwarder are serialized through
    /// `write_half`'s mutex so lines are never interleaved.
    pub async fn run(&self, stream: TcpStream, mut notify_rx: mpsc::Receiver<String>) -> Result<(), SessionError> {
        let (read_half, write_half) = stream.into_split();
        let write_half = Arc::new(Mutex::new(write_half));
        let mut reader = BufReader::new(read_half);
        let mut line = String::new();

        let forwarder_write_half = write_half.clone();
        let addr = self.addr;
        let forwarder = tokio::spawn(async move {
            while let Some(notify_line) = notify_rx.recv().await {
                let mut writer = forwarder_write_half.lock().await;
                if writer.write_all(notify_line.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                    debug!("{} notify write failed, stopping forwarder", addr);
                    break;
                }
            }
        });

        let result = loop {
            line.clear();
            let bytes_read = match reader.read_line(&mut line).await {
                Ok(n) => n,
                Err(e) => break Err(SessionError::Io(e)),
            };
            if bytes_read == 0 {
                break Ok(());
            }
            if line.len() > MAX_INBOUND_LINE_BYTES {
                warn!("{} sent oversize line ({} bytes), closing", self.addr, line.len());
                break Err(SessionError::Oversize(line.len()));
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match self.handle_line(trimmed).await {
                Ok(Some(response)) => {
                    let mut writer = write_half.lock().await;
                    if writer.write_all(response.as_bytes()).await.is_err() || writer.write_all(b"\n").await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("{} protocol error: {}", self.addr, e);
                    break Err(e);
                }
            }

            if self.state.lock().await.closing {
                break Ok(());
            }
        };

        forwarder.abort();
        result
    }

    async fn handle_line(&self, line: &str) -> Result<Option<String>, SessionError> {
        let request: Value = serde_json::from_str(line)?;
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(|m| m.as_str()).unwrap_or_default();
        let params = request.get("params").cloned().unwrap_or(Value::Array(vec![]));

        let result = match method {
            "mining.subscribe" => self.handle_subscribe(&params).await,
            "mining.authorize" => self.handle_authorize(&params).await,
            "mining.submit" => self.handle_submit(&params).await,
            other => {
                debug!("{} sent unrecognized method {}", self.addr, other);
                Err((StratumErrorCode::Unknown, format!("unrecognized method {}", other)))
            }
        };

        let response = match result {
            Ok(value) => json!({ "id": id, "result": value, "error": Value::Null }),
            Err((code, message)) => json!({ "id": id, "result": Value::Null, "error": [code.code(), message, Value::Null] }),
        };
        Ok(Some(response.to_string()))
    }

    async fn handle_subscribe(&self, params: &Value) -> Result<Value, (StratumErrorCode, String)> {
        let mut state = self.state.lock().await;
        if state.connection_state != ConnectionState::Connected {
            return Err((StratumErrorCode::Unknown, "duplicate subscribe".to_string()));
        }

        let user_agent = params.get(0).and_then(|v| v.as_str()).unwrap_or_default();
        state.encoding = detect_asic_type(user_agent);

        let extra_nonce = if self.policy.extra_nonce_size > 0 {
            let mut rng = rand::thread_rng();
            let bytes: Vec<u8> = (0..self.policy.extra_nonce_size).map(|_| rng.gen()).collect();
            Some(hex::encode(bytes))
        } else {
            None
        };
        state.extra_nonce = extra_nonce.clone();
        state.connection_state = ConnectionState::Subscribed;
        self.info_tx.send_replace(SessionInfo { connection_state: state.connection_state, encoding: state.encoding });

        let response = match state.encoding {
            AsicType::Bitmain => json!([true, extra_nonce.unwrap_or_default(), 4]),
            AsicType::Generic => json!([true, "EthereumStratum/1.0.0"]),
        };
        Ok(response)
    }

    async fn handle_authorize(&self, params: &Value) -> Result<Value, (StratumErrorCode, String)> {
        let full_name = params.get(0).and_then(|v| v.as_str()).unwrap_or_default();
        let user_difficulty = params.get(1).and_then(|v| v.as_f64());

        let (payout_address, worker_name) = split_worker_name(full_name);

        if !is_protocol_address(&payout_address) {
            let user = self
                .storage
                .get_user(&payout_address)
                .await
                .map_err(|e| (StratumErrorCode::Unknown, format!("lookup failed: {}", e)))?;
            if user.is_none() {
                return Err((StratumErrorCode::Unknown, "unknown address or user".to_string()));
            }
        }

        let identity = WorkerIdentity { payout_address: payout_address.clone(), worker_name: worker_name.clone() };
        let worker_key = identity.key();

        let mut state = self.state.lock().await;
        if state.workers.contains_key(&worker_key) {
            return Err((StratumErrorCode::Unknown, "duplicate worker name".to_string()));
        }

        let min_diff = if self.policy.allow_user_difficulty {
            user_difficulty.unwrap_or(self.policy.initial_difficulty).clamp(self.policy.min_diff, f64::MAX)
        } else {
            self.policy.initial_difficulty
        };
        state.assigned_difficulty = min_diff;
        state.workers.insert(worker_key, identity.clone());
        state.connection_state = ConnectionState::Authorized;
        let encoding = state.encoding;
        let extra_nonce = state.extra_nonce.clone();
        self.info_tx.send_replace(SessionInfo { connection_state: state.connection_state, encoding });
        drop(state);

        self.shares_manager.register_worker(identity, encoding, min_diff, self.policy.var_diff, self.notify_tx.clone()).await;
        self.push_notification("mining.set_difficulty", json!([min_diff])).await;
        if let Some(prefix) = extra_nonce {
            self.push_notification("mining.set_extranonce", json!([prefix, 4])).await;
        }
        info!("{} authorized as {}", self.addr, full_name);
        Ok(Value::Bool(true))
    }

    async fn handle_submit(&self, params: &Value) -> Result<Value, (StratumErrorCode, String)> {
        let full_name = params.get(0).and_then(|v| v.as_str()).unwrap_or_default();
        let job_id = params.get(1).and_then(|v| v.as_str()).unwrap_or_default();
        let extra_nonce2 = params.get(2).and_then(|v| v.as_str()).unwrap_or_default();

        let state = self.state.lock().await;
        if state.connection_state != ConnectionState::Authorized {
            return Err((StratumErrorCode::Unknown, "not authorized".to_string()));
        }
        let (payout_address, worker_name) = split_worker_name(full_name);
        let identity = WorkerIdentity { payout_address, worker_name };
        if !state.workers.contains_key(&identity.key()) {
            return Err((StratumErrorCode::Unknown, "unknown worker".to_string()));
        }

        let nonce = match state.encoding {
            AsicType::Bitmain => extra_nonce2.parse::<u64>().map_err(|_| (StratumErrorCode::Unknown, "invalid decimal nonce".to_string()))?,
            AsicType::Generic => {
                let prefix = state.extra_nonce.clone().unwrap_or_default();
                let combined = format!("{:0>16}", format!("{}{}", prefix, extra_nonce2));
                u64::from_str_radix(&combined[combined.len().saturating_sub(16)..], 16)
                    .map_err(|_| (StratumErrorCode::Unknown, "invalid nonce encoding".to_string()))?
            }
        };
        drop(state);

        let miner_id = identity.key();
        match self.shares_manager.add_share(&miner_id, &identity, job_id, nonce, self.hasher.as_ref()).await {
            // Duplicates and valid/block shares are both acknowledged with
            // `true`; the protocol has no distinct duplicate-ack form.
            Ok(_outcome) => Ok(Value::Bool(true)),
            Err(code) => Err((code, code.message().to_string())),
        }
    }
}

fn split_worker_name(full_name: &str) -> (String, String) {
    match full_name.split_once('.') {
        Some((address, worker)) => (address.to_string(), worker.to_string()),
        None => (full_name.to_string(), "default".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_bitmain_family_by_user_agent() {
        assert_eq!(detect_asic_type("cgminer/4.9.0 (Antminer)"), AsicType::Bitmain);
        assert_eq!(detect_asic_type("GodMiner v1.0"), AsicType::Bitmain);
        assert_eq!(detect_asic_type("lolMiner/1.2"), AsicType::Generic);
    }

    #[test]
    fn splits_worker_name_on_dot() {
        assert_eq!(split_worker_name("dusk:abc.rig01"), ("dusk:abc".to_string(), "rig01".to_string()));
        assert_eq!(split_worker_name("dusk:abc"), ("dusk:abc".to_string(), "default".to_string()));
    }
}
