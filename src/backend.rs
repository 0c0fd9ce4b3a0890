/// Backend - Orchestration Layer
///
/// Entry point for the API/handler layer. Owns one failover controller and
/// header sync worker per coin plus one indexer per account, and turns every
/// internal failure into a structured [`UserError`].
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::account::{
    AccountConfig, AccountIndexer, Balance, IndexerSettings, OrderedTransactions, SyncState,
};
use crate::chart::{ChartBuilder, ChartEntry};
use crate::coin::{Coin, CoinCode};
use crate::config::{ServerConfig, ServersFile, SyncConfig};
use crate::error::{SyncError, UserError};
use crate::failover::FailoverController;
use crate::headers::sync::parse_tip;
use crate::headers::{HeaderChainStatus, HeaderSync};
use crate::keystore::{Keystore, KeystoreAccount};
use crate::protocol::{self, ProtocolClient};
use crate::rates::{self, RatesProvider};
use crate::server::{Server, ServerPool};
use crate::storage::Storage;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// Per-coin network plumbing shared by all accounts of that coin.
struct CoinSync {
    controller: Arc<FailoverController>,
    headers: Arc<HeaderSync>,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for CoinSync {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummaryEntry {
    pub code: String,
    pub name: String,
    pub coin_code: CoinCode,
    pub sync_state: SyncState,
    pub balance: Option<Balance>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub accounts: Vec<AccountSummaryEntry>,
    /// Available balance per coin, smallest unit
    pub totals: BTreeMap<CoinCode, u64>,
    pub coin_names: BTreeMap<CoinCode, String>,
    pub chart_data_missing: bool,
    pub chart_data_daily: Vec<ChartEntry>,
    pub chart_data_hourly: Vec<ChartEntry>,
    pub chart_fiat: String,
}

pub struct Backend {
    config: SyncConfig,
    storage: Storage,
    servers: HashMap<CoinCode, Vec<ServerConfig>>,
    keystore: Arc<dyn Keystore>,
    rates: Arc<dyn RatesProvider>,
    coins: Mutex<HashMap<CoinCode, Arc<CoinSync>>>,
    accounts: RwLock<Vec<Arc<AccountIndexer>>>,
}

fn user_error(err: SyncError) -> UserError {
    err.to_user_error()
}

impl Backend {
    // ============================================================================
    // Constructor
    // ============================================================================

    pub fn new(
        config: SyncConfig,
        servers: HashMap<CoinCode, Vec<ServerConfig>>,
        keystore: Arc<dyn Keystore>,
        rates: Arc<dyn RatesProvider>,
    ) -> Self {
        let storage = Storage::new_with_base_dir(config.data_dir.clone());
        Self {
            config,
            storage,
            servers,
            keystore,
            rates,
            coins: Mutex::new(HashMap::new()),
            accounts: RwLock::new(Vec::new()),
        }
    }

    pub fn from_servers_file(
        config: SyncConfig,
        file: &ServersFile,
        keystore: Arc<dyn Keystore>,
        rates: Arc<dyn RatesProvider>,
    ) -> Self {
        let servers = [CoinCode::Btc, CoinCode::Tbtc, CoinCode::Rbtc]
            .into_iter()
            .map(|coin| (coin, file.for_coin(coin)))
            .filter(|(_, list)| !list.is_empty())
            .collect();
        Self::new(config, servers, keystore, rates)
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    fn coins(&self) -> MutexGuard<'_, HashMap<CoinCode, Arc<CoinSync>>> {
        self.coins.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn account_list(&self) -> Vec<Arc<AccountIndexer>> {
        self.accounts
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Start header sync for `coin` on first use.
    fn coin_sync(&self, coin: CoinCode) -> Result<Arc<CoinSync>, SyncError> {
        let mut coins = self.coins();
        if let Some(sync) = coins.get(&coin) {
            return Ok(sync.clone());
        }

        let servers = self.servers.get(&coin).map(Vec::as_slice).unwrap_or(&[]);
        let pool = Arc::new(ServerPool::new(servers)?);
        let controller = Arc::new(FailoverController::new(pool, &self.config));
        let headers = Arc::new(HeaderSync::new(
            Coin::from_code(coin),
            controller.clone(),
            self.storage.clone(),
            self.config.reorg_lookback,
            self.config.headers_batch_size,
        )?);
        let tasks = vec![headers.spawn(), controller.spawn_keepalive(KEEPALIVE_INTERVAL)];
        log::info!("🚀 Started {} sync with {} servers", coin, servers.len());

        let sync = Arc::new(CoinSync {
            controller,
            headers,
            tasks,
        });
        coins.insert(coin, sync.clone());
        Ok(sync)
    }

    // ============================================================================
    // Account Management
    // ============================================================================

    /// Add every account the keystore knows about.
    pub fn load_accounts(&self) -> Result<Vec<String>, UserError> {
        self.keystore
            .accounts()
            .into_iter()
            .map(|account| self.add_account(account))
            .collect()
    }

    /// Register an account and start syncing it in the background.
    ///
    /// Adding an account that already exists returns its code unchanged.
    pub fn add_account(&self, account: KeystoreAccount) -> Result<String, UserError> {
        let code = account.code();
        // Held until the indexer is listed so concurrent adds of one account
        // cannot both get past the check.
        let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
        if accounts.iter().any(|a| a.code() == code) {
            return Ok(code);
        }
        let sync = self.coin_sync(account.coin).map_err(user_error)?;

        let indexer = Arc::new(AccountIndexer::new(
            AccountConfig {
                code: code.clone(),
                name: account.name,
                coin: Coin::from_code(account.coin),
                signing: account.signing,
            },
            sync.controller.clone(),
            sync.headers.store().clone(),
            self.storage.clone(),
            IndexerSettings::from(&self.config),
        ));
        indexer.watch(sync.headers.subscribe_tips());

        let initial = indexer.clone();
        tokio::spawn(async move {
            if let Err(err) = initial.initialize().await {
                log::warn!("Initial sync of {} failed: {}", initial.code(), err);
            }
        });

        log::info!("➕ Added account {} ({})", code, indexer.name());
        accounts.push(indexer);
        Ok(code)
    }

    /// Stop syncing `code` and forget its persisted state.
    pub fn remove_account(&self, code: &str) -> Result<(), UserError> {
        let removed = {
            let mut accounts = self.accounts.write().unwrap_or_else(|e| e.into_inner());
            let pos = accounts
                .iter()
                .position(|a| a.code() == code)
                .ok_or_else(|| user_error(SyncError::AccountNotFound(code.to_string())))?;
            accounts.remove(pos)
        };
        removed.cancel();
        self.storage
            .remove_account(removed.coin().code, code)
            .map_err(|e| user_error(e.into()))?;
        log::info!("➖ Removed account {}", code);
        Ok(())
    }

    /// Drop all indexers and rebuild them from the keystore.
    pub fn reinitialize_accounts(&self) -> Result<Vec<String>, UserError> {
        let old = std::mem::take(&mut *self.accounts.write().unwrap_or_else(|e| e.into_inner()));
        for account in &old {
            account.cancel();
        }
        log::info!("🔁 Reinitializing {} accounts", old.len());
        self.load_accounts()
    }

    fn find(&self, code: &str) -> Option<Arc<AccountIndexer>> {
        self.account_list().into_iter().find(|a| a.code() == code)
    }

    pub fn account(&self, code: &str) -> Result<Arc<AccountIndexer>, UserError> {
        self.find(code)
            .ok_or_else(|| user_error(SyncError::AccountNotFound(code.to_string())))
    }

    /// Coins whose header sync is running, sorted.
    pub fn active_coins(&self) -> Vec<CoinCode> {
        let mut coins: Vec<CoinCode> = self.coins().keys().copied().collect();
        coins.sort_unstable();
        coins
    }

    pub fn account_codes(&self) -> Vec<String> {
        self.account_list()
            .iter()
            .map(|a| a.code().to_string())
            .collect()
    }

    // ============================================================================
    // Queries
    // ============================================================================

    pub fn get_headers_status(&self, coin: CoinCode) -> Result<HeaderChainStatus, UserError> {
        let sync = self.coin_sync(coin).map_err(user_error)?;
        Ok(sync.headers.status())
    }

    pub fn get_balance(&self, code: &str) -> Result<Balance, UserError> {
        self.account(code)?.balance().map_err(user_error)
    }

    pub fn get_transactions(&self, code: &str) -> Result<OrderedTransactions, UserError> {
        self.account(code)?.transactions().map_err(user_error)
    }

    pub fn get_account_summary(&self, fiat: &str) -> AccountSummary {
        self.account_summary_at(fiat, chrono::Utc::now().timestamp())
    }

    /// Summary as of unix time `now`.
    pub fn account_summary_at(&self, fiat: &str, now: i64) -> AccountSummary {
        let accounts = self.account_list();

        let mut units: Vec<&str> = accounts
            .iter()
            .filter(|a| !a.is_fatal())
            .map(|a| a.coin().rates_unit())
            .collect();
        units.sort_unstable();
        units.dedup();

        let mut chart = ChartBuilder::new(
            self.rates.as_ref(),
            fiat,
            &units,
            now,
            self.config.chart_stale_after,
        );
        let mut entries = Vec::with_capacity(accounts.len());
        let mut totals = BTreeMap::new();
        let mut coin_names = BTreeMap::new();
        let mut incomplete = false;

        for account in &accounts {
            let coin = account.coin();
            let mut entry = AccountSummaryEntry {
                code: account.code().to_string(),
                name: account.name().to_string(),
                coin_code: coin.code,
                sync_state: account.state(),
                balance: None,
            };
            if account.is_fatal() {
                entries.push(entry);
                continue;
            }
            coin_names.insert(coin.code, coin.name.to_string());

            match account.snapshot() {
                Some(snapshot) => {
                    entry.balance = Some(snapshot.balance);
                    *totals.entry(coin.code).or_insert(0) += snapshot.balance.available;
                    chart.add_account(coin, snapshot.balance.available, &snapshot.transactions);
                }
                None => {
                    log::debug!("Account {} not synced yet, chart incomplete", account.code());
                    incomplete = true;
                }
            }
            entries.push(entry);
        }

        let chart = chart.finish();
        AccountSummary {
            accounts: entries,
            totals,
            coin_names,
            chart_data_missing: chart.missing || incomplete,
            chart_data_daily: chart.daily,
            chart_data_hourly: chart.hourly,
            chart_fiat: fiat.to_string(),
        }
    }

    // ============================================================================
    // Server Management
    // ============================================================================

    /// Validate a user-supplied server before it is persisted.
    pub async fn check_server(&self, server: &ServerConfig) -> Result<(), UserError> {
        self.try_server(server).await.map_err(user_error)
    }

    async fn try_server(&self, config: &ServerConfig) -> Result<(), SyncError> {
        let server = Arc::new(Server::from_config(config)?);
        let connection = ProtocolClient::new(&self.config).connect(server.clone()).await?;
        let tip = connection
            .request(
                "blockchain.headers.subscribe",
                Vec::new(),
                self.config.request_timeout,
            )
            .await;
        connection.disconnect();
        let (height, _) = parse_tip(&tip?)?;
        log::info!("✅ Server {} is usable (tip {})", server, height);
        Ok(())
    }

    pub async fn download_certificate(&self, address: &str) -> Result<String, UserError> {
        protocol::download_certificate(address, self.config.connect_timeout)
            .await
            .map_err(user_error)
    }

    // ============================================================================
    // Fiat Conversion
    // ============================================================================

    pub fn convert_to_fiat(&self, from_unit: &str, fiat: &str, amount: &str) -> Result<String, UserError> {
        rates::convert_to_fiat(self.rates.as_ref(), from_unit, fiat, amount).map_err(user_error)
    }

    pub fn convert_from_fiat(&self, fiat: &str, coin: CoinCode, amount: &str) -> Result<String, UserError> {
        rates::convert_from_fiat(self.rates.as_ref(), fiat, &Coin::from_code(coin), amount)
            .map_err(user_error)
    }

    /// Cancel all syncing and close every connection.
    pub async fn shutdown(&self) {
        let accounts = std::mem::take(&mut *self.accounts.write().unwrap_or_else(|e| e.into_inner()));
        for account in &accounts {
            account.cancel();
        }
        let coins: Vec<Arc<CoinSync>> = self.coins().drain().map(|(_, sync)| sync).collect();
        for sync in coins {
            sync.controller.disconnect().await;
        }
        log::info!("👋 Backend stopped");
    }
}
