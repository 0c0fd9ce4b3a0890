//! Header sync worker
//!
//! Follows `blockchain.headers.subscribe` through the failover controller and
//! pulls missing headers in batches with `blockchain.block.headers`. Every
//! change of the verified tip is broadcast to the coin's account indexers.

use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::BlockHash;
use serde_json::{json, Value};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::store::{ExtendOutcome, HeaderChainStatus, HeaderChainStore};
use crate::coin::Coin;
use crate::error::SyncError;
use crate::failover::{FailoverController, SubscriptionEvent};
use crate::server::Server;
use crate::storage::Storage;

const HEADER_HEX_LEN: usize = 160;

pub type SharedHeaders = Arc<RwLock<HeaderChainStore>>;

/// Verified tip moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TipEvent {
    pub height: u32,
    /// Headers dropped by a reorg on the way there
    pub rolled_back: u32,
}

pub struct HeaderSync {
    coin: Coin,
    store: SharedHeaders,
    controller: Arc<FailoverController>,
    storage: Storage,
    batch_size: u32,
    tips: broadcast::Sender<TipEvent>,
}

impl HeaderSync {
    pub fn new(
        coin: Coin,
        controller: Arc<FailoverController>,
        storage: Storage,
        lookback: u32,
        batch_size: u32,
    ) -> Result<Self, SyncError> {
        let store = match storage.load_headers(coin.code)? {
            Some(stored) => {
                let store = HeaderChainStore::from_stored(&stored, lookback)?;
                log::info!("📦 Loaded {} headers for {} up to {}", stored.len(), coin.code, store.tip_height());
                store
            }
            None => HeaderChainStore::new(coin.network, lookback),
        };
        let (tips, _) = broadcast::channel(64);
        Ok(Self {
            coin,
            store: Arc::new(RwLock::new(store)),
            controller,
            storage,
            batch_size: batch_size.max(1),
            tips,
        })
    }

    pub fn store(&self) -> &SharedHeaders {
        &self.store
    }

    pub fn status(&self) -> HeaderChainStatus {
        self.read_store().status()
    }

    pub fn subscribe_tips(&self) -> broadcast::Receiver<TipEvent> {
        self.tips.subscribe()
    }

    fn read_store(&self) -> RwLockReadGuard<'_, HeaderChainStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_store(&self) -> RwLockWriteGuard<'_, HeaderChainStore> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Run until the returned handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let sync = self.clone();
        tokio::spawn(async move {
            let mut subscription = sync
                .controller
                .subscribe("blockchain.headers.subscribe", Vec::new());
            while let Some(event) = subscription.next_event().await {
                let tip = match &event {
                    SubscriptionEvent::Subscribed(value) | SubscriptionEvent::Resubscribed(value) => {
                        parse_tip(value)
                    }
                    SubscriptionEvent::Notification(params) => params
                        .first()
                        .ok_or_else(|| SyncError::Protocol("empty headers notification".into()))
                        .and_then(parse_tip),
                };
                match tip {
                    Ok((height, header)) => sync.on_tip(height, header).await,
                    Err(err) => log::warn!("Ignoring tip from server: {}", err),
                }
            }
        })
    }

    async fn on_tip(&self, height: u32, header: Header) {
        let hash = header.block_hash();
        {
            let mut store = self.write_store();
            if let Some(err) = store.error() {
                log::warn!("Header sync for {} halted: {}", self.coin.code, err);
                return;
            }
            store.set_target(height, hash);
            store.set_syncing(true);
        }

        let started = Instant::now();
        let result = self.catch_up(height, hash).await;

        let (status, changes) = {
            let mut store = self.write_store();
            store.set_syncing(false);
            if let Err(err @ SyncError::Chain { .. }) = &result {
                store.set_error(Some(err.clone()));
            }
            (store.status(), store.take_changes())
        };
        if let Some((from, tail)) = changes {
            self.persist(from, &tail);
        }

        match result {
            Ok(outcome) if outcome.changed() => {
                log::info!(
                    "⛓️  {} headers at {} (+{} / -{}) in {:?}",
                    self.coin.code,
                    status.verified_height,
                    outcome.appended,
                    outcome.rolled_back,
                    started.elapsed()
                );
                let _ = self.tips.send(TipEvent {
                    height: status.verified_height,
                    rolled_back: outcome.rolled_back,
                });
            }
            Ok(_) => {}
            Err(err) => log::error!("❌ Header sync for {} failed: {}", self.coin.code, err),
        }
    }

    /// Write the headers from `from` on, rewriting the whole file only when
    /// it does not hold the chain below `from`.
    fn persist(&self, from: u32, tail: &[u8]) {
        let coin = self.coin.code;
        let base = self.read_store().base_height();
        let written = match self.storage.save_header_tail(coin, base, from, tail) {
            Ok(true) => Ok(()),
            Ok(false) => {
                log::debug!("Rewriting stored headers for {}", coin);
                let stored = self.read_store().to_stored();
                self.storage.save_headers(coin, &stored)
            }
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            log::warn!("Failed to persist headers for {}: {}", coin, err);
        }
    }

    /// Bring the store up to `target`, following reorgs within the lookback window.
    pub async fn catch_up(&self, target: u32, target_hash: BlockHash) -> Result<ExtendOutcome, SyncError> {
        let mut total = ExtendOutcome::default();
        let mut rewind = false;
        let mut rewinds = 0;

        loop {
            let (tip, base, lookback, at_target) = {
                let store = self.read_store();
                (
                    store.tip_height(),
                    store.base_height(),
                    store.lookback(),
                    store.height_of(&target_hash) == Some(target),
                )
            };
            if at_target {
                break;
            }
            // Server is on another branch at or below our tip.
            if !rewind && tip >= target {
                rewind = true;
            }
            if rewind {
                rewinds += 1;
                if rewinds > 2 {
                    log::debug!("{} tip {} still unknown after refetch", self.coin.code, target_hash);
                    break;
                }
            }

            let from = if rewind {
                (tip.min(target) + 1).saturating_sub(lookback).max(base + 1)
            } else {
                tip + 1
            };
            if from > target {
                return Err(SyncError::chain("non-contiguous"));
            }
            let count = (target - from + 1).min(self.batch_size);

            let (server, headers) = self.fetch_headers(from, count).await?;
            if headers.is_empty() {
                break;
            }
            if let Err(err) = HeaderChainStore::validate(&headers) {
                log::warn!("Server {} sent invalid headers: {}", server, err);
                self.controller.ban(&server);
                continue;
            }

            let result = self.write_store().extend(&headers);
            match result {
                Ok(outcome) => {
                    total.rolled_back += outcome.rolled_back;
                    total.appended += outcome.appended;
                    rewind = false;
                }
                Err(SyncError::Chain { ref reason }) if reason == "non-contiguous" && !rewind => {
                    log::info!("Batch at {} does not attach; refetching below tip {}", from, tip);
                    rewind = true;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    async fn fetch_headers(&self, from: u32, count: u32) -> Result<(Arc<Server>, Vec<Header>), SyncError> {
        let timeout = self.controller.request_timeout();
        self.controller
            .with_active_connection(|connection| async move {
                let result = connection
                    .request("blockchain.block.headers", vec![json!(from), json!(count)], timeout)
                    .await?;
                let headers = parse_headers(&result)?;
                Ok::<_, SyncError>((connection.server().clone(), headers))
            })
            .await
    }
}

fn decode_header(raw: &str) -> Result<Header, SyncError> {
    let bytes = hex::decode(raw).map_err(|e| SyncError::Protocol(format!("header hex: {}", e)))?;
    encode::deserialize(&bytes).map_err(|e| SyncError::Protocol(format!("header: {}", e)))
}

/// `{"height": N, "hex": "<80-byte header>"}`
pub(crate) fn parse_tip(value: &Value) -> Result<(u32, Header), SyncError> {
    let height = value
        .get("height")
        .and_then(Value::as_u64)
        .and_then(|h| u32::try_from(h).ok())
        .ok_or_else(|| SyncError::Protocol("tip without height".into()))?;
    let raw = value
        .get("hex")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Protocol("tip without header".into()))?;
    Ok((height, decode_header(raw)?))
}

/// `{"count": N, "hex": "<N concatenated headers>", "max": M}`
fn parse_headers(value: &Value) -> Result<Vec<Header>, SyncError> {
    let raw = value
        .get("hex")
        .and_then(Value::as_str)
        .ok_or_else(|| SyncError::Protocol("headers result without hex".into()))?;
    if raw.len() % HEADER_HEX_LEN != 0 || !raw.is_ascii() {
        return Err(SyncError::Protocol(format!("headers hex has length {}", raw.len())));
    }
    let headers = (0..raw.len())
        .step_by(HEADER_HEX_LEN)
        .map(|start| decode_header(&raw[start..start + HEADER_HEX_LEN]))
        .collect::<Result<Vec<_>, _>>()?;

    let declared = value.get("count").and_then(Value::as_u64);
    if declared.is_some_and(|count| count != headers.len() as u64) {
        return Err(SyncError::Protocol("headers count does not match payload".into()));
    }
    Ok(headers)
}
