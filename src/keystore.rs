//! Signing collaborator
//!
//! The sync core only ever reads signing configurations; it never asks for
//! private key material. [`StaticKeystore`] is a watch-only keystore read
//! from a TOML file of `[[accounts]]` tables:
//!
//! ```toml
//! [[accounts]]
//! coin = "btc"
//! name = "Savings"
//! kind = "single"
//! script_type = "p2wpkh"
//! xpubs = ["xpub..."]
//!
//! [[accounts]]
//! coin = "btc"
//! name = "Vault"
//! kind = "multisig"
//! threshold = 2
//! xpubs = ["xpub...", "xpub...", "xpub..."]
//! ```

use bitcoin::bip32::Xpub;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;

use crate::account::{account_code, ScriptType, SigningConfiguration};
use crate::coin::CoinCode;
use crate::error::{StorageError, SyncError};

/// An account as the keystore describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeystoreAccount {
    pub coin: CoinCode,
    pub name: String,
    pub signing: Vec<SigningConfiguration>,
}

impl KeystoreAccount {
    /// Deterministic account code for this coin and signing setup.
    pub fn code(&self) -> String {
        account_code(self.coin, &self.signing)
    }
}

pub trait Keystore: Send + Sync {
    /// Every account the keystore knows, in keystore order.
    fn accounts(&self) -> Vec<KeystoreAccount>;

    /// Signing configurations of one account.
    fn signing_configurations(&self, account_code: &str) -> Option<Vec<SigningConfiguration>> {
        self.accounts()
            .into_iter()
            .find(|account| account.code() == account_code)
            .map(|account| account.signing)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum AccountKind {
    Address,
    Single,
    Multisig,
}

#[derive(Debug, Deserialize)]
struct AccountEntry {
    coin: CoinCode,
    name: String,
    kind: AccountKind,
    #[serde(default)]
    xpubs: Vec<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    threshold: Option<usize>,
    #[serde(default)]
    script_type: Option<ScriptType>,
}

#[derive(Debug, Default, Deserialize)]
struct KeystoreFile {
    #[serde(default)]
    accounts: Vec<AccountEntry>,
}

impl AccountEntry {
    fn into_account(self) -> Result<KeystoreAccount, SyncError> {
        let invalid = |msg: String| SyncError::InvalidSigningConfiguration(format!("{}: {}", self.name, msg));
        let xpubs = self
            .xpubs
            .iter()
            .map(|s| Xpub::from_str(s.trim()).map_err(|e| invalid(format!("bad extended key: {}", e))))
            .collect::<Result<Vec<_>, _>>()?;

        let signing = match self.kind {
            AccountKind::Address => {
                let address = self
                    .address
                    .clone()
                    .ok_or_else(|| invalid("address account without address".into()))?;
                vec![SigningConfiguration::Address { address }]
            }
            AccountKind::Single => {
                if xpubs.is_empty() {
                    return Err(invalid("single-key account without xpub".into()));
                }
                let script_type = self.script_type.unwrap_or(ScriptType::P2wpkh);
                xpubs
                    .into_iter()
                    .map(|xpub| SigningConfiguration::SingleKey { xpub, script_type })
                    .collect()
            }
            AccountKind::Multisig => {
                let threshold = self
                    .threshold
                    .ok_or_else(|| invalid("multisig account without threshold".into()))?;
                vec![SigningConfiguration::Multisig {
                    xpubs,
                    threshold,
                    script_type: self.script_type.unwrap_or(ScriptType::P2wsh),
                }]
            }
        };

        Ok(KeystoreAccount {
            coin: self.coin,
            name: self.name,
            signing,
        })
    }
}

/// Watch-only keystore with a fixed account list.
#[derive(Debug, Clone, Default)]
pub struct StaticKeystore {
    accounts: Vec<KeystoreAccount>,
}

impl StaticKeystore {
    pub fn new(accounts: Vec<KeystoreAccount>) -> Self {
        Self { accounts }
    }

    pub fn load(path: &Path) -> Result<Self, SyncError> {
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()).into());
        }
        let contents = std::fs::read_to_string(path).map_err(StorageError::from)?;
        let keystore = Self::parse(&contents)?;
        log::info!("🔑 Loaded {} watch-only accounts from {}", keystore.accounts.len(), path.display());
        Ok(keystore)
    }

    pub fn parse(contents: &str) -> Result<Self, SyncError> {
        let file: KeystoreFile = toml::from_str(contents).map_err(StorageError::from)?;
        let accounts = file
            .accounts
            .into_iter()
            .map(AccountEntry::into_account)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { accounts })
    }
}

impl Keystore for StaticKeystore {
    fn accounts(&self) -> Vec<KeystoreAccount> {
        self.accounts.clone()
    }
}
