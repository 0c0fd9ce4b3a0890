//! Shared fixtures: an in-process Electrum server and regtest chain data.
#![allow(dead_code)]

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{
    Amount, CompactTarget, Network, NetworkKind, OutPoint, ScriptBuf, Sequence, Transaction,
    TxIn, TxMerkleNode, TxOut, Txid, Witness,
};
use electrum_sync::account::signing::electrum_script_hash;
use electrum_sync::{FailoverController, ScriptType, ServerConfig, ServerPool, SigningConfiguration, SyncConfig};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// How the mock answers requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Normal,
    /// Read requests, never answer
    Hang,
    /// Answer every request with a line that is not JSON
    Malformed,
    /// Serve headers whose proof-of-work does not check out
    BadPow,
}

#[derive(Default)]
struct ChainState {
    headers: Vec<Header>,
    history: HashMap<String, Vec<(Txid, i64)>>,
    txs: HashMap<Txid, Transaction>,
}

struct MockState {
    chain: Mutex<ChainState>,
    behavior: Mutex<Behavior>,
    requests: Mutex<HashMap<String, usize>>,
    connections: AtomicUsize,
    notify: broadcast::Sender<String>,
    kill: broadcast::Sender<()>,
}

pub struct MockElectrum {
    pub address: String,
    state: Arc<MockState>,
    accept: JoinHandle<()>,
}

impl MockElectrum {
    pub async fn start(headers: Vec<Header>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (notify, _) = broadcast::channel(64);
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(MockState {
            chain: Mutex::new(ChainState {
                headers,
                ..Default::default()
            }),
            behavior: Mutex::new(Behavior::Normal),
            requests: Mutex::new(HashMap::new()),
            connections: AtomicUsize::new(0),
            notify,
            kill,
        });

        let accept_state = state.clone();
        let accept = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(stream, accept_state.clone()));
            }
        });

        Self {
            address,
            state,
            accept,
        }
    }

    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::plaintext(&self.address)
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.state
            .requests
            .lock()
            .unwrap()
            .get(method)
            .copied()
            .unwrap_or(0)
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn set_chain(&self, headers: Vec<Header>) {
        self.state.chain.lock().unwrap().headers = headers;
    }

    /// Make `tx` known and list it in the history of every script it pays.
    /// `height` follows Electrum: 0 for unconfirmed.
    pub fn add_transaction(&self, tx: &Transaction, height: i64) {
        let mut chain = self.state.chain.lock().unwrap();
        let txid = tx.compute_txid();
        for output in &tx.output {
            chain
                .history
                .entry(electrum_script_hash(&output.script_pubkey))
                .or_default()
                .push((txid, height));
        }
        chain.txs.insert(txid, tx.clone());
    }

    /// Forget the raw transaction but keep it listed in history, like a
    /// server whose mempool evicted it between two requests.
    pub fn forget_transaction(&self, txid: &Txid) {
        self.state.chain.lock().unwrap().txs.remove(txid);
    }

    /// Announce the current status of `script` to every subscribed connection.
    pub fn push_script_status(&self, script: &ScriptBuf) {
        let script_hash = electrum_script_hash(script);
        let status = script_status(self.state.chain.lock().unwrap().history.get(&script_hash));
        let line = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.scripthash.subscribe",
            "params": [script_hash, status],
        });
        let _ = self.state.notify.send(format!("{}\n", line));
    }

    /// Announce the current tip to every subscribed connection.
    pub fn push_tip(&self) {
        let tip = tip_json(&self.state.chain.lock().unwrap().headers);
        let line = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.headers.subscribe",
            "params": [tip],
        });
        let _ = self.state.notify.send(format!("{}\n", line));
    }

    /// Close every open connection; the listener stays up.
    pub fn drop_connections(&self) {
        let _ = self.state.kill.send(());
    }

    /// Stop accepting and close every connection.
    pub fn shutdown(&self) {
        self.accept.abort();
        self.drop_connections();
    }
}

impl Drop for MockElectrum {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Electrum status of a script: sha256 of `"txid:height:"` per entry, or null.
fn script_status(history: Option<&Vec<(Txid, i64)>>) -> Value {
    match history {
        Some(entries) if !entries.is_empty() => {
            let mut hasher = Sha256::new();
            for (txid, height) in entries {
                hasher.update(format!("{}:{}:", txid, height));
            }
            json!(hex::encode(hasher.finalize()))
        }
        _ => Value::Null,
    }
}

fn tip_json(headers: &[Header]) -> Value {
    match headers.last() {
        Some(tip) => json!({"height": headers.len() - 1, "hex": encode::serialize_hex(tip)}),
        None => Value::Null,
    }
}

impl MockState {
    fn handle(&self, method: &str, params: &Value, behavior: Behavior) -> Result<Value, String> {
        let chain = self.chain.lock().unwrap();
        match method {
            "server.version" => Ok(json!(["MockElectrum 1.0", "1.4"])),
            "server.ping" => Ok(Value::Null),
            "blockchain.headers.subscribe" => Ok(tip_json(&chain.headers)),
            "blockchain.block.headers" => {
                let start = params[0].as_u64().ok_or("bad start")? as usize;
                let count = params[1].as_u64().ok_or("bad count")? as usize;
                let end = (start + count).min(chain.headers.len());
                let slice = chain.headers.get(start..end).unwrap_or(&[]);
                let hex: String = slice
                    .iter()
                    .map(|h| {
                        let mut header = *h;
                        if behavior == Behavior::BadPow {
                            header.bits = CompactTarget::from_consensus(0x1d00_ffff);
                        }
                        encode::serialize_hex(&header)
                    })
                    .collect();
                Ok(json!({"count": slice.len(), "hex": hex, "max": 2016}))
            }
            "blockchain.scripthash.get_history" => {
                let script_hash = params[0].as_str().ok_or("bad script hash")?;
                let items: Vec<Value> = chain
                    .history
                    .get(script_hash)
                    .map(|entries| {
                        entries
                            .iter()
                            .map(|(txid, height)| json!({"tx_hash": txid.to_string(), "height": height}))
                            .collect()
                    })
                    .unwrap_or_default();
                Ok(Value::Array(items))
            }
            "blockchain.scripthash.subscribe" => {
                let script_hash = params[0].as_str().ok_or("bad script hash")?;
                Ok(script_status(chain.history.get(script_hash)))
            }
            "blockchain.transaction.get" => {
                let txid: Txid = params[0]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .ok_or("bad txid")?;
                chain
                    .txs
                    .get(&txid)
                    .map(|tx| json!(encode::serialize_hex(tx)))
                    .ok_or_else(|| "unknown transaction".to_string())
            }
            other => Err(format!("unknown method {}", other)),
        }
    }
}

async fn serve(stream: TcpStream, state: Arc<MockState>) {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();
    let mut notifications = state.notify.subscribe();
    let mut kill = state.kill.subscribe();
    let mut subscribed = false;

    loop {
        tokio::select! {
            _ = kill.recv() => return,
            note = notifications.recv() => match note {
                Ok(line) if subscribed => {
                    if write.write_all(line.as_bytes()).await.is_err() {
                        return;
                    }
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return,
            },
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                let method = request["method"].as_str().unwrap_or_default().to_string();
                *state.requests.lock().unwrap().entry(method.clone()).or_default() += 1;

                let behavior = *state.behavior.lock().unwrap();
                let reply = match behavior {
                    Behavior::Hang => continue,
                    Behavior::Malformed => "this is not json\n".to_string(),
                    Behavior::Normal | Behavior::BadPow => {
                        if method.ends_with(".subscribe") {
                            subscribed = true;
                        }
                        let response = match state.handle(&method, &request["params"], behavior) {
                            Ok(result) => json!({"jsonrpc": "2.0", "id": request["id"], "result": result}),
                            Err(message) => json!({
                                "jsonrpc": "2.0",
                                "id": request["id"],
                                "error": {"code": -32600, "message": message},
                            }),
                        };
                        format!("{}\n", response)
                    }
                };
                if write.write_all(reply.as_bytes()).await.is_err() {
                    return;
                }
            }
        }
    }
}

/// An address nothing listens on.
pub async fn unused_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn test_config(dir: &Path) -> SyncConfig {
    SyncConfig {
        data_dir: dir.to_path_buf(),
        gap_limit_receive: 5,
        gap_limit_change: 2,
        reorg_lookback: 10,
        request_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_millis(500),
        backoff_base: Duration::from_millis(200),
        backoff_max: Duration::from_secs(1),
        headers_batch_size: 8,
        ..SyncConfig::default()
    }
}

pub fn controller(servers: &[ServerConfig], config: &SyncConfig) -> Arc<FailoverController> {
    let pool = Arc::new(ServerPool::new(servers).unwrap());
    Arc::new(FailoverController::new(pool, config))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// ---------------------------------------------------------------------------
// Chain fixtures
// ---------------------------------------------------------------------------

pub fn mine(prev: &Header, salt: u8) -> Header {
    let mut header = Header {
        version: bitcoin::block::Version::TWO,
        prev_blockhash: prev.block_hash(),
        merkle_root: TxMerkleNode::from_byte_array([salt; 32]),
        time: prev.time + 600,
        bits: CompactTarget::from_consensus(0x207f_ffff),
        nonce: 0,
    };
    while header.validate_pow(header.target()).is_err() {
        header.nonce += 1;
    }
    header
}

/// Regtest genesis followed by `len - 1` mined headers.
pub fn regtest_chain(len: usize) -> Vec<Header> {
    let genesis = bitcoin::constants::genesis_block(Network::Regtest).header;
    extend_chain(&[genesis], len.saturating_sub(1), 0)
}

/// `base` plus `count` new headers; different salts give different branches.
pub fn extend_chain(base: &[Header], count: usize, salt: u8) -> Vec<Header> {
    let mut chain = base.to_vec();
    for _ in 0..count {
        let parent = *chain.last().unwrap();
        chain.push(mine(&parent, salt));
    }
    chain
}

pub fn funding_tx(script: &ScriptBuf, value: u64, salt: u8) -> Transaction {
    Transaction {
        version: bitcoin::transaction::Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: OutPoint::new(Txid::from_byte_array([salt; 32]), 0),
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: vec![TxOut {
            value: Amount::from_sat(value),
            script_pubkey: script.clone(),
        }],
    }
}

/// Watch-only single-key configuration for a test seed.
pub fn regtest_signing(seed: u8) -> SigningConfiguration {
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(NetworkKind::Test, &[seed; 32]).unwrap();
    SigningConfiguration::SingleKey {
        xpub: Xpub::from_priv(&secp, &master),
        script_type: ScriptType::P2wpkh,
    }
}

pub fn receive_script(signing: &SigningConfiguration, index: u32) -> ScriptBuf {
    let secp = Secp256k1::verification_only();
    signing.script_at(&secp, Network::Regtest, 0, index).unwrap()
}
