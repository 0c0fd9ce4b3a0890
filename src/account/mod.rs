//! Accounts: signing configurations, address discovery and indexing

pub mod addresses;
pub mod indexer;
pub mod signing;
pub mod transactions;

pub use indexer::{AccountConfig, AccountIndexer, IndexerSettings, SyncState};
pub use signing::{account_code, ScriptType, SigningConfiguration};
pub use transactions::{AccountSnapshot, Balance, OrderedTransactions, TimeseriesEntry, Transaction, TxKind};
