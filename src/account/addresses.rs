//! Gap-limit address discovery
//!
//! Each signing configuration contributes a receive chain (0) and a change
//! chain (1). A chain keeps `gap_limit` unused addresses derived past its
//! last used one; marking an address near the edge as used widens the window.

use bitcoin::secp256k1::{Secp256k1, VerifyOnly};
use bitcoin::{Network, Script, ScriptBuf};
use std::collections::HashMap;

use super::signing::{electrum_script_hash, SigningConfiguration};
use crate::error::SyncError;

pub const RECEIVE_CHAIN: u32 = 0;
pub const CHANGE_CHAIN: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedAddress {
    /// Position of the signing configuration within the account
    pub config: usize,
    pub chain: u32,
    pub index: u32,
    pub script: ScriptBuf,
    pub script_hash: String,
}

#[derive(Debug, Clone)]
struct AddressChain {
    config: usize,
    chain: u32,
    gap_limit: u32,
    derived: u32,
    last_used: Option<u32>,
}

impl AddressChain {
    fn required(&self) -> u32 {
        (self.last_used.map_or(0, |i| i + 1) + self.gap_limit).max(1)
    }
}

pub struct AddressSet {
    configs: Vec<SigningConfiguration>,
    network: Network,
    secp: Secp256k1<VerifyOnly>,
    chains: Vec<AddressChain>,
    addresses: Vec<DerivedAddress>,
    by_script: HashMap<ScriptBuf, usize>,
    by_script_hash: HashMap<String, usize>,
}

impl AddressSet {
    pub fn new(
        configs: Vec<SigningConfiguration>,
        network: Network,
        gap_receive: u32,
        gap_change: u32,
    ) -> Self {
        let mut chains = Vec::new();
        for (config, signing) in configs.iter().enumerate() {
            if signing.is_address_based() {
                chains.push(AddressChain {
                    config,
                    chain: RECEIVE_CHAIN,
                    gap_limit: 0,
                    derived: 0,
                    last_used: None,
                });
                continue;
            }
            for (chain, gap_limit) in [(RECEIVE_CHAIN, gap_receive), (CHANGE_CHAIN, gap_change)] {
                chains.push(AddressChain {
                    config,
                    chain,
                    gap_limit,
                    derived: 0,
                    last_used: None,
                });
            }
        }
        Self {
            configs,
            network,
            secp: Secp256k1::verification_only(),
            chains,
            addresses: Vec::new(),
            by_script: HashMap::new(),
            by_script_hash: HashMap::new(),
        }
    }

    pub fn configs(&self) -> &[SigningConfiguration] {
        &self.configs
    }

    /// Derive whatever the current windows require; returns only new addresses.
    pub fn extend(&mut self) -> Result<Vec<DerivedAddress>, SyncError> {
        let mut fresh = Vec::new();
        for pos in 0..self.chains.len() {
            let required = self.chains[pos].required();
            while self.chains[pos].derived < required {
                let AddressChain {
                    config,
                    chain,
                    derived,
                    ..
                } = self.chains[pos];
                let script = self.configs[config].script_at(&self.secp, self.network, chain, derived)?;
                let address = DerivedAddress {
                    config,
                    chain,
                    index: derived,
                    script_hash: electrum_script_hash(&script),
                    script,
                };
                self.by_script.insert(address.script.clone(), self.addresses.len());
                self.by_script_hash
                    .insert(address.script_hash.clone(), self.addresses.len());
                self.addresses.push(address.clone());
                fresh.push(address);
                self.chains[pos].derived += 1;
            }
        }
        Ok(fresh)
    }

    /// Widen a chain to at least `window` addresses (restoring a persisted window).
    pub fn ensure_window(&mut self, chain: u32, window: u32) {
        for entry in self.chains.iter_mut().filter(|c| c.chain == chain && c.gap_limit > 0) {
            if window > 0 && entry.required() < window {
                let used = window.saturating_sub(entry.gap_limit);
                if used > 0 {
                    entry.last_used = Some(entry.last_used.map_or(used - 1, |u| u.max(used - 1)));
                }
            }
        }
    }

    /// Record that the address with `script_hash` has history.
    pub fn mark_used(&mut self, script_hash: &str) -> bool {
        let Some(&pos) = self.by_script_hash.get(script_hash) else {
            return false;
        };
        let address = &self.addresses[pos];
        if let Some(chain) = self
            .chains
            .iter_mut()
            .find(|c| c.config == address.config && c.chain == address.chain)
        {
            chain.last_used = Some(chain.last_used.map_or(address.index, |u| u.max(address.index)));
        }
        true
    }

    pub fn contains(&self, script: &Script) -> bool {
        self.by_script.contains_key(script)
    }

    pub fn lookup(&self, script: &Script) -> Option<&DerivedAddress> {
        self.by_script.get(script).map(|&pos| &self.addresses[pos])
    }

    pub fn addresses(&self) -> &[DerivedAddress] {
        &self.addresses
    }

    /// Largest derived count per chain, for persistence.
    pub fn window(&self, chain: u32) -> u32 {
        self.chains
            .iter()
            .filter(|c| c.chain == chain)
            .map(|c| c.derived)
            .max()
            .unwrap_or(0)
    }

    /// First unused receive address of the first configuration.
    pub fn next_receive(&self) -> Option<&DerivedAddress> {
        let chain = self.chains.iter().find(|c| c.chain == RECEIVE_CHAIN)?;
        let index = chain.last_used.map_or(0, |i| i + 1);
        self.addresses
            .iter()
            .find(|a| a.config == chain.config && a.chain == RECEIVE_CHAIN && a.index == index)
    }
}
