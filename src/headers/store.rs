//! Header Chain Store
//!
//! A locally verified run of block headers starting at a trusted base
//! (the network's genesis block, or a restored snapshot). Headers are
//! checked for linkage and self-consistent proof of work before they are
//! accepted. Reorgs shallower than the lookback window roll the chain back
//! to the common ancestor; deeper ones are refused.

use bitcoin::block::Header;
use bitcoin::consensus::encode;
use bitcoin::hashes::Hash;
use bitcoin::{BlockHash, Network};
use serde::Serialize;
use std::collections::HashMap;

use crate::error::SyncError;
use crate::storage::{StoredHeaders, HEADER_SIZE};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderChainStatus {
    pub tip_height: u32,
    pub tip_hash: String,
    pub verified_height: u32,
    pub is_syncing: bool,
}

/// Result of a successful [`HeaderChainStore::extend`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendOutcome {
    /// Headers removed from the old tip before appending
    pub rolled_back: u32,
    pub appended: u32,
}

impl ExtendOutcome {
    pub fn changed(&self) -> bool {
        self.rolled_back > 0 || self.appended > 0
    }
}

#[derive(Debug)]
pub struct HeaderChainStore {
    base_height: u32,
    headers: Vec<Header>,
    by_hash: HashMap<BlockHash, u32>,
    lookback: u32,
    target: Option<(u32, BlockHash)>,
    syncing: bool,
    error: Option<SyncError>,
    /// Lowest height changed since the last [`HeaderChainStore::take_changes`]
    changed_from: Option<u32>,
}

impl HeaderChainStore {
    /// Start from the network's genesis header.
    pub fn new(network: Network, lookback: u32) -> Self {
        let genesis = bitcoin::constants::genesis_block(network).header;
        Self::with_base(0, genesis, lookback)
    }

    /// Start from a trusted header at `height`.
    pub fn with_base(height: u32, header: Header, lookback: u32) -> Self {
        let mut by_hash = HashMap::new();
        by_hash.insert(header.block_hash(), height);
        Self {
            base_height: height,
            headers: vec![header],
            by_hash,
            lookback: lookback.max(1),
            target: None,
            syncing: false,
            error: None,
            changed_from: Some(height),
        }
    }

    pub fn from_stored(stored: &StoredHeaders, lookback: u32) -> Result<Self, SyncError> {
        let mut decoded = Vec::with_capacity(stored.len());
        for raw in stored.records() {
            let header: Header = encode::deserialize(raw)
                .map_err(|e| SyncError::Storage(format!("invalid header: {}", e)))?;
            decoded.push(header);
        }
        let (first, rest) = decoded
            .split_first()
            .ok_or_else(|| SyncError::Storage("empty header snapshot".into()))?;

        let mut store = Self::with_base(stored.base_height, *first, lookback);
        // Stored headers were verified when first accepted; re-check linkage only.
        for header in rest {
            if header.prev_blockhash != store.tip_hash() {
                return Err(SyncError::Storage("stored headers do not link".into()));
            }
            store.push(*header);
        }
        store.changed_from = None;
        Ok(store)
    }

    pub fn to_stored(&self) -> StoredHeaders {
        StoredHeaders {
            base_height: self.base_height,
            headers: self.encode_from(self.base_height),
        }
    }

    /// Consensus bytes of every header from `height` to the tip.
    fn encode_from(&self, height: u32) -> Vec<u8> {
        let skip = height.saturating_sub(self.base_height) as usize;
        let mut out = Vec::with_capacity(self.headers.len().saturating_sub(skip) * HEADER_SIZE);
        for header in self.headers.iter().skip(skip) {
            out.extend(encode::serialize(header));
        }
        out
    }

    /// The first height changed since the last call and the encoded headers
    /// from there to the tip, or `None` if nothing changed.
    pub fn take_changes(&mut self) -> Option<(u32, Vec<u8>)> {
        let from = self.changed_from.take()?;
        Some((from, self.encode_from(from)))
    }

    pub fn base_height(&self) -> u32 {
        self.base_height
    }

    pub fn tip_height(&self) -> u32 {
        self.base_height + self.headers.len() as u32 - 1
    }

    pub fn tip_hash(&self) -> BlockHash {
        self.headers
            .last()
            .map_or_else(BlockHash::all_zeros, Header::block_hash)
    }

    pub fn header_at(&self, height: u32) -> Option<&Header> {
        let offset = height.checked_sub(self.base_height)?;
        self.headers.get(offset as usize)
    }

    /// Block time of the header at `height`, if verified.
    pub fn timestamp_at(&self, height: u32) -> Option<u32> {
        self.header_at(height).map(|h| h.time)
    }

    pub fn height_of(&self, hash: &BlockHash) -> Option<u32> {
        self.by_hash.get(hash).copied()
    }

    pub fn lookback(&self) -> u32 {
        self.lookback
    }

    /// Tip announced by the server, possibly ahead of what is verified.
    pub fn set_target(&mut self, height: u32, hash: BlockHash) {
        self.target = Some((height, hash));
    }

    pub fn target_height(&self) -> u32 {
        self.target.map_or(0, |(h, _)| h)
    }

    pub fn set_syncing(&mut self, syncing: bool) {
        self.syncing = syncing;
    }

    pub fn error(&self) -> Option<&SyncError> {
        self.error.as_ref()
    }

    pub fn set_error(&mut self, error: Option<SyncError>) {
        self.error = error;
    }

    pub fn status(&self) -> HeaderChainStatus {
        let verified_height = self.tip_height();
        let (tip_height, tip_hash) = match self.target {
            Some((height, hash)) if height > verified_height => (height, hash),
            _ => (verified_height, self.tip_hash()),
        };
        HeaderChainStatus {
            tip_height,
            tip_hash: tip_hash.to_string(),
            verified_height,
            is_syncing: self.syncing,
        }
    }

    /// Check that `headers` link to each other and carry valid proof of work.
    ///
    /// A failure here means the server produced bad data, independent of
    /// what is stored locally.
    pub fn validate(headers: &[Header]) -> Result<(), SyncError> {
        for (i, header) in headers.iter().enumerate() {
            header
                .validate_pow(header.target())
                .map_err(|_| SyncError::chain(format!("invalid proof of work in {}", header.block_hash())))?;
            if i > 0 && header.prev_blockhash != headers[i - 1].block_hash() {
                return Err(SyncError::chain("headers do not link"));
            }
        }
        Ok(())
    }

    /// Append `headers`, following a reorg if they fork below the tip.
    ///
    /// Headers already stored are skipped, so overlapping ranges can be
    /// applied any number of times.
    pub fn extend(&mut self, headers: &[Header]) -> Result<ExtendOutcome, SyncError> {
        Self::validate(headers)?;

        let Some(attach) = headers
            .iter()
            .position(|h| self.by_hash.contains_key(&h.prev_blockhash))
        else {
            if headers.is_empty() {
                return Ok(ExtendOutcome::default());
            }
            return Err(SyncError::chain("non-contiguous"));
        };

        let tip = self.tip_height();
        let mut height = self.by_hash[&headers[attach].prev_blockhash] + 1;
        let mut rest = &headers[attach..];
        while let Some(header) = rest.first() {
            match self.header_at(height) {
                Some(stored) if stored.block_hash() == header.block_hash() => {
                    rest = &rest[1..];
                    height += 1;
                }
                _ => break,
            }
        }
        if rest.is_empty() {
            return Ok(ExtendOutcome::default());
        }

        let ancestor = height - 1;
        let rolled_back = tip - ancestor;
        if rolled_back > 0 {
            if rolled_back >= self.lookback {
                return Err(SyncError::chain(format!(
                    "non-contiguous: reorg of {} blocks exceeds lookback of {}",
                    rolled_back, self.lookback
                )));
            }
            log::info!(
                "🔀 Reorg: rolling back {} headers to {} (height {})",
                rolled_back,
                self.tip_hash_at(ancestor),
                ancestor
            );
            self.truncate_to(ancestor);
        }

        for header in rest {
            self.push(*header);
        }
        Ok(ExtendOutcome {
            rolled_back,
            appended: rest.len() as u32,
        })
    }

    fn tip_hash_at(&self, height: u32) -> BlockHash {
        self.header_at(height)
            .map_or_else(BlockHash::all_zeros, Header::block_hash)
    }

    fn push(&mut self, header: Header) {
        let height = self.base_height + self.headers.len() as u32;
        self.mark_changed(height);
        self.by_hash.insert(header.block_hash(), height);
        self.headers.push(header);
    }

    fn mark_changed(&mut self, height: u32) {
        self.changed_from = Some(self.changed_from.map_or(height, |from| from.min(height)));
    }

    fn truncate_to(&mut self, height: u32) {
        self.mark_changed(height + 1);
        let keep = (height - self.base_height + 1) as usize;
        for removed in self.headers.drain(keep..) {
            self.by_hash.remove(&removed.block_hash());
        }
    }
}
