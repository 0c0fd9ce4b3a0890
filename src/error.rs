//! Error types for the sync core
//!
//! Transport-level failures (`Connect`, `Timeout`, `Protocol`, `Disconnected`)
//! are absorbed by the failover controller. Error replies (`Rpc`) and local
//! request bookkeeping failures (`Client`) go straight back to the caller.
//! Only exhaustion and chain-integrity failures reach the account layer, and
//! callers always see them as a structured [`UserError`].

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to connect to {server}: {cause}")]
    Connect { server: String, cause: String },

    #[error("Request {method} timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },

    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Well-formed error reply; the server itself is fine
    #[error("Server error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// Local request bookkeeping (ids, pending slots), not the server's fault
    #[error("Client error: {0}")]
    Client(String),

    #[error("Connection to {0} closed")]
    Disconnected(String),

    #[error("All {0} servers exhausted")]
    AllServersExhausted(usize),

    #[error("Chain error: {reason}")]
    Chain { reason: String },

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Account {0} is not synced yet")]
    NotReady(String),

    #[error("Account {0} is in a fatal error state")]
    Fatal(String),

    #[error("Invalid signing configuration: {0}")]
    InvalidSigningConfiguration(String),

    #[error("Unknown coin: {0}")]
    UnknownCoin(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl SyncError {
    pub fn connect(server: impl Into<String>, cause: impl ToString) -> Self {
        Self::Connect {
            server: server.into(),
            cause: cause.to_string(),
        }
    }

    pub fn chain(reason: impl Into<String>) -> Self {
        Self::Chain {
            reason: reason.into(),
        }
    }

    /// Errors that drive failover and are never surfaced to accounts directly.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Timeout { .. } | Self::Protocol(_) | Self::Disconnected(_)
        )
    }

    /// Stable identifier for the error kind, as shown to API consumers.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "configError",
            Self::Connect { .. } => "connectError",
            Self::Timeout { .. } => "timeout",
            Self::Protocol(_) => "protocolError",
            Self::Rpc { .. } => "serverError",
            Self::Client(_) => "clientError",
            Self::Disconnected(_) => "disconnected",
            Self::AllServersExhausted(_) => "allServersExhausted",
            Self::Chain { .. } => "chainError",
            Self::AccountNotFound(_) => "accountNotFound",
            Self::NotReady(_) => "notReady",
            Self::Fatal(_) => "fatalError",
            Self::InvalidSigningConfiguration(_) => "invalidSigningConfiguration",
            Self::UnknownCoin(_) => "unknownCoin",
            Self::InvalidAmount(_) => "invalidAmount",
            Self::Storage(_) => "storageError",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn to_user_error(&self) -> UserError {
        UserError {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

/// Structured failure handed to the UI layer.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct UserError {
    pub kind: &'static str,
    pub message: String,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Corrupt data in {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::Storage(err.to_string())
    }
}
