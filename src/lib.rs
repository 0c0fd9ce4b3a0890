//! Electrum-Sync: watch-only wallet synchronization core
//!
//! Keeps accounts of Bitcoin-family coins in sync with a pool of Electrum
//! servers. Chain data is fetched through a failover layer, block headers are
//! verified locally, and every account's balance, transactions and fiat chart
//! data are derived from what the servers report.
//!
//! # Architecture
//!
//! - **Server Pool / Failover Controller**: ordered servers with health state,
//!   cooldowns and transparent resubscription
//! - **Protocol Client**: line-delimited JSON-RPC over plaintext or pinned TLS
//! - **Header Chain Store**: proof-of-work checked headers with reorg rollback
//! - **Account Indexer**: gap-limit address discovery and single-flight sync
//! - **Chart Builder**: daily/hourly fiat valuation from price history
//!
//! # Example
//!
//! ```ignore
//! use electrum_sync::{Backend, ServersFile, StaticKeystore, StaticRates, SyncConfig};
//!
//! let config = SyncConfig::from_env();
//! let servers = ServersFile::load(&path)?;
//! let backend = Backend::from_servers_file(config, &servers, keystore, rates);
//! backend.load_accounts()?;
//!
//! let status = backend.get_headers_status(CoinCode::Btc)?;
//! let summary = backend.get_account_summary("USD");
//! ```

// Public modules
pub mod account;
pub mod backend;
pub mod chart;
pub mod coin;
pub mod config;
pub mod error;
pub mod failover;
pub mod headers;
pub mod keystore;
pub mod protocol;
pub mod rates;
pub mod server;
pub mod storage;

// Re-exports for convenience
pub use account::{
    account_code, AccountConfig, AccountIndexer, Balance, IndexerSettings, OrderedTransactions,
    ScriptType, SigningConfiguration, SyncState, Transaction, TxKind,
};
pub use backend::{AccountSummary, AccountSummaryEntry, Backend};
pub use chart::{ChartBuilder, ChartData, ChartEntry};
pub use coin::{Coin, CoinCode};
pub use config::{ServerConfig, ServersFile, SyncConfig};
pub use error::{StorageError, SyncError, UserError};
pub use failover::{FailoverController, FailoverSubscription, SubscriptionEvent};
pub use headers::{HeaderChainStatus, HeaderChainStore, HeaderSync, TipEvent};
pub use keystore::{Keystore, KeystoreAccount, StaticKeystore};
pub use protocol::{Connection, ProtocolClient, Subscription};
pub use rates::{convert_from_fiat, convert_to_fiat, RatesProvider, StaticRates};
pub use server::{HealthState, Server, ServerPool};
pub use storage::Storage;

// Common result type
pub type Result<T> = std::result::Result<T, SyncError>;
