//! Signing configurations
//!
//! Watch-only description of how an account's output scripts are formed.
//! Owned by the keystore; the indexer only derives scripts from it.

use bitcoin::bip32::{ChildNumber, Xpub};
use bitcoin::blockdata::opcodes::all::OP_CHECKMULTISIG;
use bitcoin::blockdata::script::Builder;
use bitcoin::hashes::{sha256, Hash};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::{Secp256k1, Verification};
use bitcoin::{Address, Network, NetworkKind, PublicKey, Script, ScriptBuf};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use crate::coin::CoinCode;
use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScriptType {
    P2pkh,
    P2wpkhP2sh,
    P2wpkh,
    P2tr,
    /// Sorted multisig in native segwit
    P2wsh,
}

impl ScriptType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScriptType::P2pkh => "p2pkh",
            ScriptType::P2wpkhP2sh => "p2wpkh-p2sh",
            ScriptType::P2wpkh => "p2wpkh",
            ScriptType::P2tr => "p2tr",
            ScriptType::P2wsh => "p2wsh",
        }
    }
}

impl fmt::Display for ScriptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScriptType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p2pkh" => Ok(ScriptType::P2pkh),
            "p2wpkh-p2sh" => Ok(ScriptType::P2wpkhP2sh),
            "p2wpkh" => Ok(ScriptType::P2wpkh),
            "p2tr" => Ok(ScriptType::P2tr),
            "p2wsh" => Ok(ScriptType::P2wsh),
            other => Err(SyncError::InvalidSigningConfiguration(format!(
                "unknown script type {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigningConfiguration {
    /// A single fixed address
    Address { address: String },
    SingleKey { xpub: Xpub, script_type: ScriptType },
    /// Keys in keystore order; scripts sort them
    Multisig {
        xpubs: Vec<Xpub>,
        threshold: usize,
        script_type: ScriptType,
    },
}

impl SigningConfiguration {
    pub fn is_address_based(&self) -> bool {
        matches!(self, SigningConfiguration::Address { .. })
    }

    pub fn extended_public_keys(&self) -> &[Xpub] {
        match self {
            SigningConfiguration::Address { .. } => &[],
            SigningConfiguration::SingleKey { xpub, .. } => std::slice::from_ref(xpub),
            SigningConfiguration::Multisig { xpubs, .. } => xpubs,
        }
    }

    pub fn address(&self) -> Option<&str> {
        match self {
            SigningConfiguration::Address { address } => Some(address),
            _ => None,
        }
    }

    /// Canonical text form, used for account codes and logs.
    pub fn descriptor(&self) -> String {
        match self {
            SigningConfiguration::Address { address } => format!("addr({})", address),
            SigningConfiguration::SingleKey { xpub, script_type } => {
                format!("{}({})", script_type, xpub)
            }
            SigningConfiguration::Multisig {
                xpubs,
                threshold,
                script_type,
            } => {
                let keys: Vec<String> = xpubs.iter().map(Xpub::to_string).collect();
                format!("{}(sortedmulti({},{}))", script_type, threshold, keys.join(","))
            }
        }
    }

    /// Reject configurations this coin cannot sync.
    pub fn validate(&self, network: Network) -> Result<(), SyncError> {
        let invalid = |msg: String| Err(SyncError::InvalidSigningConfiguration(msg));
        let kind = NetworkKind::from(network);

        for xpub in self.extended_public_keys() {
            if xpub.network != kind {
                return invalid(format!("extended key {} is not for {}", xpub, network));
            }
        }

        match self {
            SigningConfiguration::Address { address } => {
                parse_address(address, network)?;
            }
            SigningConfiguration::SingleKey { script_type, .. } => {
                if *script_type == ScriptType::P2wsh {
                    return invalid("p2wsh requires a multisig configuration".into());
                }
            }
            SigningConfiguration::Multisig {
                xpubs,
                threshold,
                script_type,
            } => {
                if *script_type != ScriptType::P2wsh {
                    return invalid(format!("multisig does not support {}", script_type));
                }
                if *threshold == 0 || *threshold > xpubs.len() {
                    return invalid(format!("threshold {} of {} keys", threshold, xpubs.len()));
                }
                if xpubs.len() > 15 {
                    return invalid("at most 15 keys are supported".into());
                }
            }
        }
        Ok(())
    }

    /// Output script of the address at `chain`/`index` (m/chain/index below each xpub).
    pub fn script_at<C: Verification>(
        &self,
        secp: &Secp256k1<C>,
        network: Network,
        chain: u32,
        index: u32,
    ) -> Result<ScriptBuf, SyncError> {
        match self {
            SigningConfiguration::Address { address } => {
                if chain != 0 || index != 0 {
                    return Err(SyncError::InvalidSigningConfiguration(
                        "address-based accounts have a single address".into(),
                    ));
                }
                Ok(parse_address(address, network)?.script_pubkey())
            }
            SigningConfiguration::SingleKey { xpub, script_type } => {
                let key = derive(secp, xpub, chain, index)?;
                single_key_script(secp, key, *script_type)
            }
            SigningConfiguration::Multisig {
                xpubs, threshold, ..
            } => {
                let mut keys = xpubs
                    .iter()
                    .map(|xpub| derive(secp, xpub, chain, index))
                    .collect::<Result<Vec<_>, _>>()?;
                keys.sort_by_key(|key| key.serialize());

                let mut builder = Builder::new().push_int(*threshold as i64);
                for key in &keys {
                    builder = builder.push_key(&PublicKey::new(*key));
                }
                let witness_script = builder
                    .push_int(keys.len() as i64)
                    .push_opcode(OP_CHECKMULTISIG)
                    .into_script();
                Ok(ScriptBuf::new_p2wsh(&witness_script.wscript_hash()))
            }
        }
    }
}

fn derive<C: Verification>(
    secp: &Secp256k1<C>,
    xpub: &Xpub,
    chain: u32,
    index: u32,
) -> Result<bitcoin::secp256k1::PublicKey, SyncError> {
    let invalid = |e: bitcoin::bip32::Error| SyncError::InvalidSigningConfiguration(e.to_string());
    let path = [
        ChildNumber::from_normal_idx(chain).map_err(invalid)?,
        ChildNumber::from_normal_idx(index).map_err(invalid)?,
    ];
    Ok(xpub.derive_pub(secp, &path).map_err(invalid)?.public_key)
}

fn single_key_script<C: Verification>(
    secp: &Secp256k1<C>,
    key: bitcoin::secp256k1::PublicKey,
    script_type: ScriptType,
) -> Result<ScriptBuf, SyncError> {
    let compressed = CompressedPublicKey(key);
    Ok(match script_type {
        ScriptType::P2pkh => ScriptBuf::new_p2pkh(&PublicKey::new(key).pubkey_hash()),
        ScriptType::P2wpkh => ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash()),
        ScriptType::P2wpkhP2sh => {
            let redeem = ScriptBuf::new_p2wpkh(&compressed.wpubkey_hash());
            ScriptBuf::new_p2sh(&redeem.script_hash())
        }
        ScriptType::P2tr => {
            let (internal, _) = key.x_only_public_key();
            ScriptBuf::new_p2tr(secp, internal, None)
        }
        ScriptType::P2wsh => {
            return Err(SyncError::InvalidSigningConfiguration(
                "p2wsh requires a multisig configuration".into(),
            ))
        }
    })
}

fn parse_address(address: &str, network: Network) -> Result<Address, SyncError> {
    Address::from_str(address)
        .map_err(|e| SyncError::InvalidSigningConfiguration(format!("{}: {}", address, e)))?
        .require_network(network)
        .map_err(|e| SyncError::InvalidSigningConfiguration(format!("{}: {}", address, e)))
}

/// Key under which Electrum servers index a script: reversed SHA-256, hex.
pub fn electrum_script_hash(script: &Script) -> String {
    let mut hash = sha256::Hash::hash(script.as_bytes()).to_byte_array();
    hash.reverse();
    hex::encode(hash)
}

/// Stable identifier of the account formed by `configs` on `coin`.
pub fn account_code(coin: CoinCode, configs: &[SigningConfiguration]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(coin.as_str().as_bytes());
    for config in configs {
        hasher.update(b"\n");
        hasher.update(config.descriptor().as_bytes());
    }
    let digest = hasher.finalize();
    format!("{}-{}", coin, hex::encode(&digest[..8]))
}
