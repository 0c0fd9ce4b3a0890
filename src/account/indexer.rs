//! Account Indexer
//!
//! One per account. A sync pass derives the account's scripts, asks the
//! server for each script's history through the failover controller, fetches
//! any transactions not cached yet and swaps in a new [`AccountSnapshot`].
//!
//! At most one pass runs per account: a sync requested while a pass is in
//! flight waits for that pass instead of starting another. The pass itself is
//! a spawned task so a caller dropping its future never leaves a half-merged
//! cache behind.
//!
//! A watching indexer also subscribes every derived script hash and runs a
//! pass when a script's status no longer matches the last pass, so mempool
//! payments show up without waiting for a block.

use bitcoin::consensus::encode;
use bitcoin::Txid;
use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};

use super::addresses::{AddressSet, DerivedAddress, CHANGE_CHAIN, RECEIVE_CHAIN};
use super::signing::SigningConfiguration;
use super::transactions::{build_snapshot, AccountSnapshot, Balance, OrderedTransactions, TxEntry};
use crate::coin::Coin;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::failover::{FailoverController, FailoverSubscription, SubscriptionEvent};
use crate::headers::{HeaderChainStatus, SharedHeaders, TipEvent};
use crate::storage::{AccountRecord, Storage};

/// Requests issued concurrently per batch
const BATCH: usize = 32;

type PassFuture = Shared<BoxFuture<'static, Result<Arc<AccountSnapshot>, SyncError>>>;

/// Electrum script status: `None` for a script without history
type ScriptStatus = Option<String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    Uninitialized,
    Syncing,
    Ready,
    FatalError,
}

/// Static description of an account, as handed over by the keystore.
#[derive(Debug, Clone)]
pub struct AccountConfig {
    pub code: String,
    pub name: String,
    pub coin: Coin,
    pub signing: Vec<SigningConfiguration>,
}

#[derive(Debug, Clone, Copy)]
pub struct IndexerSettings {
    pub gap_limit_receive: u32,
    pub gap_limit_change: u32,
    pub exhausted_retry_budget: u32,
}

impl From<&SyncConfig> for IndexerSettings {
    fn from(config: &SyncConfig) -> Self {
        Self {
            gap_limit_receive: config.gap_limit_receive,
            gap_limit_change: config.gap_limit_change,
            exhausted_retry_budget: config.exhausted_retry_budget,
        }
    }
}

/// Mutable indexing state, only touched by the running pass.
#[derive(Default)]
struct Work {
    addresses: Option<AddressSet>,
    txs: HashMap<Txid, TxEntry>,
    record: Option<AccountRecord>,
}

/// Live `blockchain.scripthash.subscribe` forwarders, one per script hash.
struct ScriptWatch {
    changes: mpsc::UnboundedSender<()>,
    tasks: HashMap<String, JoinHandle<()>>,
}

impl ScriptWatch {
    fn stop(self) {
        for task in self.tasks.into_values() {
            task.abort();
        }
    }
}

struct Inner {
    config: AccountConfig,
    controller: Arc<FailoverController>,
    headers: SharedHeaders,
    storage: Storage,
    settings: IndexerSettings,
    state: watch::Sender<SyncState>,
    fatal: Mutex<Option<SyncError>>,
    snapshot: RwLock<Option<Arc<AccountSnapshot>>>,
    work: tokio::sync::Mutex<Work>,
    in_flight: Mutex<Option<(u64, PassFuture, AbortHandle)>>,
    /// Script statuses as of the last completed pass
    statuses: Mutex<HashMap<String, ScriptStatus>>,
    scripts: Mutex<Option<ScriptWatch>>,
    passes: AtomicU64,
    merges: AtomicU64,
    exhausted_streak: AtomicU32,
}

pub struct AccountIndexer {
    inner: Arc<Inner>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl AccountIndexer {
    pub fn new(
        config: AccountConfig,
        controller: Arc<FailoverController>,
        headers: SharedHeaders,
        storage: Storage,
        settings: IndexerSettings,
    ) -> Self {
        let (state, _) = watch::channel(SyncState::Uninitialized);
        Self {
            inner: Arc::new(Inner {
                config,
                controller,
                headers,
                storage,
                settings,
                state,
                fatal: Mutex::new(None),
                snapshot: RwLock::new(None),
                work: tokio::sync::Mutex::new(Work::default()),
                in_flight: Mutex::new(None),
                statuses: Mutex::new(HashMap::new()),
                scripts: Mutex::new(None),
                passes: AtomicU64::new(0),
                merges: AtomicU64::new(0),
                exhausted_streak: AtomicU32::new(0),
            }),
            watcher: Mutex::new(None),
        }
    }

    pub fn code(&self) -> &str {
        &self.inner.config.code
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn coin(&self) -> &Coin {
        &self.inner.config.coin
    }

    pub fn signing_configurations(&self) -> &[SigningConfiguration] {
        &self.inner.config.signing
    }

    pub fn state(&self) -> SyncState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn fatal_error(&self) -> Option<SyncError> {
        lock(&self.inner.fatal).clone()
    }

    pub fn is_fatal(&self) -> bool {
        self.state() == SyncState::FatalError
    }

    /// Completed merges since creation.
    pub fn merge_count(&self) -> u64 {
        self.inner.merges.load(Ordering::SeqCst)
    }

    /// Header status of the account's coin.
    pub fn status(&self) -> HeaderChainStatus {
        self.inner
            .headers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .status()
    }

    /// Latest merged view; balance and transactions always belong together.
    pub fn snapshot(&self) -> Option<Arc<AccountSnapshot>> {
        self.inner
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn ready_snapshot(&self) -> Result<Arc<AccountSnapshot>, SyncError> {
        if self.is_fatal() {
            return Err(SyncError::Fatal(self.code().to_string()));
        }
        self.snapshot()
            .ok_or_else(|| SyncError::NotReady(self.code().to_string()))
    }

    pub fn balance(&self) -> Result<Balance, SyncError> {
        Ok(self.ready_snapshot()?.balance)
    }

    pub fn transactions(&self) -> Result<OrderedTransactions, SyncError> {
        Ok(self.ready_snapshot()?.transactions.clone())
    }

    /// Make sure the account has been synced at least once.
    pub async fn initialize(&self) -> Result<(), SyncError> {
        if self.is_fatal() {
            return Err(SyncError::Fatal(self.code().to_string()));
        }
        if self.snapshot().is_some() {
            return Ok(());
        }
        self.sync().await.map(|_| ())
    }

    /// Run a sync pass, or join the one already in flight.
    pub async fn sync(&self) -> Result<Arc<AccountSnapshot>, SyncError> {
        self.inner.start_pass().await
    }

    /// Sync again whenever the coin's verified tip moves or the status of
    /// one of the account's scripts changes.
    pub fn watch(&self, mut tips: broadcast::Receiver<TipEvent>) {
        let (changes, mut changed) = mpsc::unbounded_channel();
        if let Some(previous) = lock(&self.inner.scripts).replace(ScriptWatch {
            changes,
            tasks: HashMap::new(),
        }) {
            previous.stop();
        }
        self.inner.watch_scripts();

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let indexer_code = self.code().to_string();
        let task = tokio::spawn(async move {
            loop {
                let cause = tokio::select! {
                    tip = tips.recv() => match tip {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => "new tip",
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    Some(()) = changed.recv() => {
                        // one pass covers every change queued so far
                        while changed.try_recv().is_ok() {}
                        "script status change"
                    }
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if *inner.state.borrow() == SyncState::FatalError {
                    return;
                }
                if let Err(err) = inner.start_pass().await {
                    log::warn!("Sync of {} after {} failed: {}", indexer_code, cause, err);
                }
            }
        });
        if let Some(previous) = lock(&self.watcher).replace(task) {
            previous.abort();
        }
    }

    /// Stop watching and abort any in-flight pass; outstanding requests are
    /// dropped and the state falls back to what the last merge left.
    pub fn cancel(&self) {
        self.stop_watching();
        if let Some((_, _, abort)) = lock(&self.inner.in_flight).take() {
            log::info!("Cancelling sync of {}", self.code());
            abort.abort();
            self.inner.settle_cancelled();
        }
    }

    fn stop_watching(&self) {
        if let Some(watcher) = lock(&self.watcher).take() {
            watcher.abort();
        }
        if let Some(scripts) = lock(&self.inner.scripts).take() {
            scripts.stop();
        }
    }
}

impl Drop for AccountIndexer {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl Inner {
    fn start_pass(self: &Arc<Self>) -> PassFuture {
        let mut slot = lock(&self.in_flight);
        if let Some((_, pass, _)) = slot.as_ref() {
            log::debug!("Joining in-flight sync of {}", self.config.code);
            return pass.clone();
        }

        let id = self.passes.fetch_add(1, Ordering::SeqCst);
        let inner = self.clone();
        let handle = tokio::spawn(async move {
            let result = inner.run_pass().await;
            let mut slot = lock(&inner.in_flight);
            if slot.as_ref().map_or(false, |(current, _, _)| *current == id) {
                slot.take();
            }
            result
        });
        let abort = handle.abort_handle();
        let weak = Arc::downgrade(self);
        let pass = async move {
            match handle.await {
                Ok(result) => result,
                Err(_) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.settle_cancelled();
                    }
                    Err(SyncError::Cancelled)
                }
            }
        }
        .boxed()
        .shared();
        *slot = Some((id, pass.clone(), abort));
        pass
    }

    fn set_state(&self, state: SyncState) {
        self.state.send_replace(state);
    }

    /// Leave `Syncing` after an aborted pass.
    fn settle_cancelled(&self) {
        let has_snapshot = self
            .snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some();
        self.state.send_if_modified(|state| {
            if *state != SyncState::Syncing {
                return false;
            }
            *state = if has_snapshot {
                SyncState::Ready
            } else {
                SyncState::Uninitialized
            };
            true
        });
    }

    /// Subscribe every script hash of the last pass not subscribed yet.
    fn watch_scripts(self: &Arc<Self>) {
        let hashes: Vec<String> = lock(&self.statuses).keys().cloned().collect();
        let mut scripts = lock(&self.scripts);
        let Some(watch) = scripts.as_mut() else {
            return;
        };
        let before = watch.tasks.len();
        for hash in hashes {
            if watch.tasks.contains_key(&hash) {
                continue;
            }
            let subscription = self
                .controller
                .subscribe("blockchain.scripthash.subscribe", vec![json!(hash)]);
            let task = tokio::spawn(forward_status(
                Arc::downgrade(self),
                hash.clone(),
                subscription,
                watch.changes.clone(),
            ));
            watch.tasks.insert(hash, task);
        }
        if watch.tasks.len() > before {
            log::debug!(
                "{}: watching {} scripts ({} new)",
                self.config.code,
                watch.tasks.len(),
                watch.tasks.len() - before
            );
        }
    }

    /// Whether `status` differs from what the last pass saw for `hash`.
    fn status_changed(&self, hash: &str, status: &ScriptStatus) -> bool {
        lock(&self.statuses).get(hash).map_or(true, |known| known != status)
    }

    fn enter_fatal(&self, err: SyncError) -> SyncError {
        log::error!("❌ Account {} failed: {}", self.config.code, err);
        *lock(&self.fatal) = Some(err);
        self.set_state(SyncState::FatalError);
        SyncError::Fatal(self.config.code.clone())
    }

    async fn run_pass(self: &Arc<Self>) -> Result<Arc<AccountSnapshot>, SyncError> {
        if *self.state.borrow() == SyncState::FatalError {
            return Err(SyncError::Fatal(self.config.code.clone()));
        }
        let previous = *self.state.borrow();
        self.set_state(SyncState::Syncing);
        let started = Instant::now();
        log::info!("🔄 Syncing account {}", self.config.code);

        match self.pass().await {
            Ok(snapshot) => {
                self.exhausted_streak.store(0, Ordering::SeqCst);
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Some(snapshot.clone());
                self.merges.fetch_add(1, Ordering::SeqCst);
                self.set_state(SyncState::Ready);
                self.watch_scripts();
                log::info!(
                    "✅ Account {} synced at height {}: {} transactions, {} available, {} incoming ({:?})",
                    self.config.code,
                    snapshot.synced_height,
                    snapshot.transactions.len(),
                    snapshot.balance.available,
                    snapshot.balance.incoming,
                    started.elapsed()
                );
                Ok(snapshot)
            }
            Err(err @ SyncError::InvalidSigningConfiguration(_)) => Err(self.enter_fatal(err)),
            Err(err @ SyncError::AllServersExhausted(_)) => {
                let streak = self.exhausted_streak.fetch_add(1, Ordering::SeqCst) + 1;
                if streak >= self.settings.exhausted_retry_budget {
                    return Err(self.enter_fatal(err));
                }
                log::warn!(
                    "Account {} sync failed ({}/{}): {}",
                    self.config.code,
                    streak,
                    self.settings.exhausted_retry_budget,
                    err
                );
                self.set_state(previous);
                Err(err)
            }
            Err(err) => {
                log::warn!("Account {} sync failed: {}", self.config.code, err);
                self.set_state(previous);
                Err(err)
            }
        }
    }

    async fn pass(&self) -> Result<Arc<AccountSnapshot>, SyncError> {
        let mut guard = self.work.lock().await;
        let work = &mut *guard;
        let network = self.config.coin.network;

        if work.addresses.is_none() {
            for config in &self.config.signing {
                config.validate(network)?;
            }
            let record = self
                .storage
                .load_account(self.config.coin.code, &self.config.code)?
                .unwrap_or_else(|| AccountRecord {
                    code: self.config.code.clone(),
                    ..Default::default()
                });
            let mut addresses = AddressSet::new(
                self.config.signing.clone(),
                network,
                self.settings.gap_limit_receive,
                self.settings.gap_limit_change,
            );
            addresses.ensure_window(RECEIVE_CHAIN, record.receive_window);
            addresses.ensure_window(CHANGE_CHAIN, record.change_window);
            work.addresses = Some(addresses);
            work.record = Some(record);
        }
        let (Some(addresses), Some(record)) = (work.addresses.as_mut(), work.record.as_mut()) else {
            return Err(SyncError::NotReady(self.config.code.clone()));
        };

        addresses.extend()?;
        let mut to_query: Vec<DerivedAddress> = addresses.addresses().to_vec();
        let mut history: HashMap<Txid, Option<u32>> = HashMap::new();
        let mut statuses = HashMap::with_capacity(to_query.len());
        while !to_query.is_empty() {
            for chunk in to_query.chunks(BATCH) {
                let results = join_all(chunk.iter().map(|a| self.get_history(&a.script_hash))).await;
                for (address, result) in chunk.iter().zip(results) {
                    let (items, status) = result?;
                    if !items.is_empty() {
                        addresses.mark_used(&address.script_hash);
                    }
                    history.extend(items);
                    statuses.insert(address.script_hash.clone(), status);
                }
            }
            to_query = addresses.extend()?;
            if !to_query.is_empty() {
                log::debug!("{}: gap limit moved, scanning {} more addresses", self.config.code, to_query.len());
            }
        }

        let missing: Vec<Txid> = history
            .keys()
            .filter(|txid| !work.txs.contains_key(*txid))
            .copied()
            .collect();
        let mut fetched = HashMap::with_capacity(missing.len());
        for chunk in missing.chunks(BATCH) {
            let results = join_all(chunk.iter().map(|txid| self.get_transaction(*txid))).await;
            for (txid, result) in chunk.iter().zip(results) {
                match result {
                    Ok(tx) => {
                        fetched.insert(*txid, tx);
                    }
                    // Dropped from the server's mempool since the history
                    // listed it; the next pass sees the new history.
                    Err(SyncError::Rpc { message, .. }) => {
                        log::debug!("{}: skipping {}: {}", self.config.code, txid, message);
                    }
                    Err(err) => return Err(err),
                }
            }
        }

        // Merge: anything no longer in any history (replaced, evicted) is dropped.
        let now = chrono::Utc::now().timestamp();
        let mut merged = HashMap::with_capacity(history.len());
        for (txid, height) in &history {
            let tx = match work.txs.remove(txid) {
                Some(entry) => entry.tx,
                None => match fetched.remove(txid) {
                    Some(tx) => tx,
                    None => continue,
                },
            };
            let first_seen = match height {
                Some(_) => None,
                None => Some(*record.first_seen.entry(txid.to_string()).or_insert(now)),
            };
            merged.insert(
                *txid,
                TxEntry {
                    tx,
                    height: *height,
                    first_seen,
                },
            );
        }
        work.txs = merged;
        record
            .first_seen
            .retain(|txid, _| Txid::from_str(txid).map_or(false, |t| history.get(&t) == Some(&None)));

        let snapshot = {
            let headers = self.headers.read().unwrap_or_else(|e| e.into_inner());
            let tip = headers.status().tip_height;
            build_snapshot(&work.txs, addresses, tip, |height| headers.timestamp_at(height))
        };

        record.receive_window = addresses.window(RECEIVE_CHAIN);
        record.change_window = addresses.window(CHANGE_CHAIN);
        record.synced_height = snapshot.synced_height;
        if let Err(err) = self.storage.save_account(self.config.coin.code, record) {
            log::warn!("Failed to persist account {}: {}", self.config.code, err);
        }
        *lock(&self.statuses) = statuses;

        Ok(Arc::new(snapshot))
    }

    async fn get_history(
        &self,
        script_hash: &str,
    ) -> Result<(Vec<(Txid, Option<u32>)>, ScriptStatus), SyncError> {
        let timeout = self.controller.request_timeout();
        self.controller
            .with_active_connection(|connection| async move {
                let value = connection
                    .request("blockchain.scripthash.get_history", vec![json!(script_hash)], timeout)
                    .await?;
                Ok::<_, SyncError>((parse_history(&value)?, script_status(&value)))
            })
            .await
    }

    async fn get_transaction(&self, txid: Txid) -> Result<bitcoin::Transaction, SyncError> {
        let timeout = self.controller.request_timeout();
        self.controller
            .with_active_connection(|connection| async move {
                let value = connection
                    .request("blockchain.transaction.get", vec![json!(txid.to_string())], timeout)
                    .await?;
                let raw = value
                    .as_str()
                    .ok_or_else(|| SyncError::Protocol("transaction is not a hex string".into()))?;
                let bytes = hex::decode(raw).map_err(|e| SyncError::Protocol(format!("transaction hex: {}", e)))?;
                let tx: bitcoin::Transaction =
                    encode::deserialize(&bytes).map_err(|e| SyncError::Protocol(format!("transaction: {}", e)))?;
                if tx.compute_txid() != txid {
                    return Err(SyncError::Protocol(format!("server returned the wrong transaction for {}", txid)));
                }
                Ok::<_, SyncError>(tx)
            })
            .await
    }
}

/// `[{"tx_hash": "...", "height": N}, ...]`; height 0 or -1 means unconfirmed.
fn parse_history(value: &Value) -> Result<Vec<(Txid, Option<u32>)>, SyncError> {
    let items = value
        .as_array()
        .ok_or_else(|| SyncError::Protocol("history is not an array".into()))?;
    items
        .iter()
        .map(|item| {
            let txid = item
                .get("tx_hash")
                .and_then(Value::as_str)
                .and_then(|s| Txid::from_str(s).ok())
                .ok_or_else(|| SyncError::Protocol("history entry without tx_hash".into()))?;
            let height = item
                .get("height")
                .and_then(Value::as_i64)
                .ok_or_else(|| SyncError::Protocol("history entry without height".into()))?;
            let height = u32::try_from(height).ok().filter(|h| *h > 0);
            Ok((txid, height))
        })
        .collect()
}

/// Forward status changes of one script to the watcher.
async fn forward_status(
    inner: Weak<Inner>,
    hash: String,
    mut subscription: FailoverSubscription,
    changes: mpsc::UnboundedSender<()>,
) {
    while let Some(event) = subscription.next_event().await {
        let status = match event {
            SubscriptionEvent::Subscribed(status) | SubscriptionEvent::Resubscribed(status) => status,
            SubscriptionEvent::Notification(params) => params.get(1).cloned().unwrap_or(Value::Null),
        };
        let status = status.as_str().map(str::to_string);
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.status_changed(&hash, &status) {
            log::debug!("{}: status of {} changed", inner.config.code, hash);
            if changes.send(()).is_err() {
                return;
            }
        }
    }
}

/// sha256 over `"<tx_hash>:<height>:"` for each history entry in server
/// order, hex encoded.
fn script_status(history: &Value) -> ScriptStatus {
    let items = history.as_array().filter(|items| !items.is_empty())?;
    let mut hasher = Sha256::new();
    for item in items {
        let tx_hash = item.get("tx_hash").and_then(Value::as_str).unwrap_or_default();
        let height = item.get("height").and_then(Value::as_i64).unwrap_or_default();
        hasher.update(format!("{}:{}:", tx_hash, height));
    }
    Some(hex::encode(hasher.finalize()))
}
