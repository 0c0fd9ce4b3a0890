/// Sync configuration from environment variables
///
/// Controls the data directory, gap limits, reorg lookback, request timeouts
/// and failover backoff. Server lists are read from a TOML file.
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::coin::CoinCode;
use crate::error::StorageError;

#[derive(Clone, Debug)]
pub struct SyncConfig {
    /// Root directory for headers and account records
    pub data_dir: PathBuf,
    /// Optional TOML file with `[[servers]]` tables
    pub servers_file: Option<PathBuf>,
    /// Unused receive addresses scanned past the last used one
    pub gap_limit_receive: u32,
    /// Unused change addresses scanned past the last used one
    pub gap_limit_change: u32,
    /// Deepest reorg the header store will follow
    pub reorg_lookback: u32,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive timeouts before a server is considered unhealthy
    pub timeout_threshold: u32,
    /// Consecutive exhausted sync passes before an account turns fatal
    pub exhausted_retry_budget: u32,
    /// Age of the freshest price point beyond which chart data is flagged missing
    pub chart_stale_after: Duration,
    pub max_pending_requests: usize,
    pub headers_batch_size: u32,
}

impl SyncConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables (all optional):
    /// - `WALLET_DATA_DIR`: storage root (default `./wallet-data`)
    /// - `SERVERS_FILE`: TOML server list
    /// - `GAP_LIMIT_RECEIVE` / `GAP_LIMIT_CHANGE`: address discovery window
    /// - `REORG_LOOKBACK`: maximum reorg depth in blocks
    /// - `REQUEST_TIMEOUT_SECS` / `CONNECT_TIMEOUT_SECS`
    /// - `BACKOFF_BASE_MS` / `BACKOFF_MAX_SECS`: server cooldown
    /// - `TIMEOUT_THRESHOLD`, `EXHAUSTED_RETRY_BUDGET`
    /// - `CHART_STALE_HOURS`, `MAX_PENDING_REQUESTS`, `HEADERS_BATCH_SIZE`
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let data_dir = env::var("WALLET_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or(defaults.data_dir);
        log::info!("📁 Data directory: {}", data_dir.display());

        let servers_file = env::var("SERVERS_FILE").ok().map(PathBuf::from);
        if let Some(ref path) = servers_file {
            log::info!("📡 Server list: {}", path.display());
        }

        Self {
            data_dir,
            servers_file,
            gap_limit_receive: env_or("GAP_LIMIT_RECEIVE", defaults.gap_limit_receive),
            gap_limit_change: env_or("GAP_LIMIT_CHANGE", defaults.gap_limit_change),
            reorg_lookback: env_or("REORG_LOOKBACK", defaults.reorg_lookback),
            request_timeout: Duration::from_secs(env_or("REQUEST_TIMEOUT_SECS", 30)),
            connect_timeout: Duration::from_secs(env_or("CONNECT_TIMEOUT_SECS", 10)),
            backoff_base: Duration::from_millis(env_or("BACKOFF_BASE_MS", 1000)),
            backoff_max: Duration::from_secs(env_or("BACKOFF_MAX_SECS", 60)),
            timeout_threshold: env_or("TIMEOUT_THRESHOLD", defaults.timeout_threshold),
            exhausted_retry_budget: env_or("EXHAUSTED_RETRY_BUDGET", defaults.exhausted_retry_budget),
            chart_stale_after: Duration::from_secs(env_or::<u64>("CHART_STALE_HOURS", 2) * 3600),
            max_pending_requests: env_or("MAX_PENDING_REQUESTS", defaults.max_pending_requests),
            headers_batch_size: env_or("HEADERS_BATCH_SIZE", defaults.headers_batch_size),
        }
    }

    /// Cooldown after `failures` consecutive failures of one server.
    pub fn backoff(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(failures - 1).unwrap_or(u32::MAX);
        self.backoff_base
            .checked_mul(factor)
            .map_or(self.backoff_max, |d| d.min(self.backoff_max))
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./wallet-data"),
            servers_file: None,
            gap_limit_receive: 20,
            gap_limit_change: 6,
            reorg_lookback: 100,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            timeout_threshold: 3,
            exhausted_retry_budget: 3,
            chart_stale_after: Duration::from_secs(2 * 3600),
            max_pending_requests: 256,
            headers_batch_size: 2016,
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("⚠️  Ignoring unparsable {}={}", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}

/// A user-configured Electrum server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// `host:port`
    pub address: String,
    #[serde(default)]
    pub tls: bool,
    /// Pinned leaf certificate, PEM encoded
    #[serde(default)]
    pub pem_cert: Option<String>,
    /// SHA-256 fingerprint of the leaf certificate, hex
    #[serde(default)]
    pub fingerprint: Option<String>,
}

impl ServerConfig {
    pub fn plaintext(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            tls: false,
            pem_cert: None,
            fingerprint: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ServerEntry {
    coin: CoinCode,
    #[serde(flatten)]
    server: ServerConfig,
}

/// Parsed `SERVERS_FILE`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

impl ServersFile {
    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, StorageError> {
        Ok(toml::from_str(contents)?)
    }

    /// Servers configured for `coin`, in file order.
    pub fn for_coin(&self, coin: CoinCode) -> Vec<ServerConfig> {
        self.servers
            .iter()
            .filter(|entry| entry.coin == coin)
            .map(|entry| entry.server.clone())
            .collect()
    }
}
