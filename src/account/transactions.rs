//! Balance and transaction derivation
//!
//! Turns the raw transactions touching an account's scripts into a balance,
//! an ordered transaction list and a cumulative-balance timeseries.

use bitcoin::{OutPoint, Txid};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use super::addresses::AddressSet;

/// A transaction as known to the indexer: raw data plus chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxEntry {
    pub tx: bitcoin::Transaction,
    /// `None` while unconfirmed
    pub height: Option<u32>,
    /// Unix time the transaction was first seen unconfirmed
    pub first_seen: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxKind {
    Received,
    Sent,
    #[serde(rename = "self")]
    SelfTransfer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub txid: String,
    pub kind: TxKind,
    /// Net effect on the account in the smallest unit
    pub amount: i64,
    pub fee: Option<u64>,
    pub height: Option<u32>,
    pub confirmations: u32,
    /// Block time, once the block's header is verified
    pub timestamp: Option<i64>,
    pub created_timestamp: Option<i64>,
}

impl Transaction {
    pub fn is_confirmed(&self) -> bool {
        self.height.is_some()
    }

    /// Block time if confirmed, first-seen time otherwise.
    pub fn time(&self) -> Option<i64> {
        if self.is_confirmed() {
            self.timestamp
        } else {
            self.created_timestamp
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    pub available: u64,
    pub incoming: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeseriesEntry {
    pub time: i64,
    /// Account balance at `time`, smallest unit
    pub value: i64,
}

/// Unconfirmed first, then by height descending.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct OrderedTransactions(Vec<Transaction>);

impl OrderedTransactions {
    pub fn new(mut txs: Vec<Transaction>) -> Self {
        txs.sort_by(|a, b| {
            let key = |t: &Transaction| (t.height.map_or(u32::MAX, |h| h), t.created_timestamp);
            key(b).cmp(&key(a)).then_with(|| a.txid.cmp(&b.txid))
        });
        Self(txs)
    }

    pub fn as_slice(&self) -> &[Transaction] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Earliest timed transaction, `None` if nothing carries a time.
    pub fn earliest_time(&self) -> Option<i64> {
        self.0.iter().filter_map(Transaction::time).min()
    }

    /// Whether some confirmed transaction still lacks its block time.
    pub fn missing_timestamps(&self) -> bool {
        self.0.iter().any(|t| t.time().is_none())
    }

    /// Balance at every `step` seconds from `start` through `end`.
    ///
    /// Returns `None` when any transaction lacks a time, since the series
    /// would be wrong rather than merely incomplete.
    pub fn timeseries(&self, start: i64, end: i64, step: i64) -> Option<Vec<TimeseriesEntry>> {
        if step <= 0 {
            return Some(Vec::new());
        }
        let mut timed = self
            .0
            .iter()
            .map(|t| t.time().map(|time| (time, t.amount)))
            .collect::<Option<Vec<_>>>()?;
        timed.sort_unstable();

        let mut entries = Vec::new();
        let mut balance = 0i64;
        let mut next = timed.iter().peekable();
        let mut time = start;
        while time <= end {
            while let Some((_, amount)) = next.next_if(|(t, _)| *t <= time) {
                balance += amount;
            }
            entries.push(TimeseriesEntry {
                time,
                value: balance,
            });
            time += step;
        }
        Some(entries)
    }
}

/// Balance and transaction list of one sync pass; replaced as a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountSnapshot {
    pub balance: Balance,
    pub transactions: OrderedTransactions,
    pub synced_height: u32,
}

/// Derive the account view from every transaction touching its scripts.
pub fn build_snapshot(
    entries: &HashMap<Txid, TxEntry>,
    addresses: &AddressSet,
    tip_height: u32,
    block_time: impl Fn(u32) -> Option<u32>,
) -> AccountSnapshot {
    // our outputs: outpoint -> value
    let mut ours: HashMap<OutPoint, u64> = HashMap::new();
    for (txid, entry) in entries {
        for (vout, output) in entry.tx.output.iter().enumerate() {
            if addresses.contains(&output.script_pubkey) {
                ours.insert(OutPoint::new(*txid, vout as u32), output.value.to_sat());
            }
        }
    }

    let spent: std::collections::HashSet<OutPoint> = entries
        .values()
        .flat_map(|e| e.tx.input.iter().map(|i| i.previous_output))
        .collect();

    let mut balance = Balance::default();
    let mut transactions = Vec::with_capacity(entries.len());

    for (txid, entry) in entries {
        let tx = &entry.tx;
        let sent: u64 = tx
            .input
            .iter()
            .filter_map(|i| ours.get(&i.previous_output))
            .sum();
        let received: u64 = tx
            .output
            .iter()
            .filter(|o| addresses.contains(&o.script_pubkey))
            .map(|o| o.value.to_sat())
            .sum();

        let kind = if sent == 0 {
            TxKind::Received
        } else if tx.output.iter().all(|o| addresses.contains(&o.script_pubkey)) {
            TxKind::SelfTransfer
        } else {
            TxKind::Sent
        };

        let fee = if tx.is_coinbase() {
            None
        } else {
            tx.input
                .iter()
                .map(|i| {
                    entries
                        .get(&i.previous_output.txid)
                        .and_then(|parent| parent.tx.output.get(i.previous_output.vout as usize))
                        .map(|o| o.value.to_sat())
                })
                .sum::<Option<u64>>()
                .and_then(|input| {
                    let output: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
                    input.checked_sub(output)
                })
        };

        for (vout, output) in tx.output.iter().enumerate() {
            let outpoint = OutPoint::new(*txid, vout as u32);
            if !ours.contains_key(&outpoint) || spent.contains(&outpoint) {
                continue;
            }
            let value = output.value.to_sat();
            // Change from our own unconfirmed spend is spendable right away.
            if entry.height.is_some() || sent > 0 {
                balance.available += value;
            } else {
                balance.incoming += value;
            }
        }

        let confirmations = entry
            .height
            .map_or(0, |h| tip_height.saturating_sub(h) + 1);
        transactions.push(Transaction {
            txid: txid.to_string(),
            kind,
            amount: received as i64 - sent as i64,
            fee,
            height: entry.height,
            confirmations,
            timestamp: entry.height.and_then(&block_time).map(i64::from),
            created_timestamp: entry.first_seen,
        });
    }

    AccountSnapshot {
        balance,
        transactions: OrderedTransactions::new(transactions),
        synced_height: tip_height,
    }
}
