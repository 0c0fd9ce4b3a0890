//! File-system persistence
//!
//! Layout under the data directory:
//!
//! ```text
//! <data_dir>/<coin>/headers.bin
//! <data_dir>/<coin>/accounts/<account-code>.json
//! ```
//!
//! `headers.bin` is the base height (u32, little endian) followed by one
//! 80-byte consensus-encoded header per height. A new tip rewrites only the
//! records from the first changed height on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::coin::CoinCode;
use crate::error::StorageError;

pub const HEADER_SIZE: usize = 80;
const BASE_PREFIX: u64 = 4;

/// Verified headers, consensus encoded back to back, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredHeaders {
    pub base_height: u32,
    pub headers: Vec<u8>,
}

impl StoredHeaders {
    pub fn len(&self) -> usize {
        self.headers.len() / HEADER_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.headers.len() < HEADER_SIZE
    }

    pub fn records(&self) -> impl Iterator<Item = &[u8]> {
        self.headers.chunks_exact(HEADER_SIZE)
    }
}

/// What an account indexer needs to resume without rescanning from scratch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub code: String,
    /// Derived address count per chain (0 = receive, 1 = change)
    pub receive_window: u32,
    pub change_window: u32,
    /// Unix time at which each still-unconfirmed transaction was first seen
    #[serde(default)]
    pub first_seen: BTreeMap<String, i64>,
    #[serde(default)]
    pub synced_height: u32,
}

#[derive(Clone, Debug)]
pub struct Storage {
    base_path: PathBuf,
}

impl Storage {
    pub fn new_with_base_dir(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn coin_dir(&self, coin: CoinCode) -> PathBuf {
        self.base_path.join(coin.as_str())
    }

    fn account_path(&self, coin: CoinCode, code: &str) -> PathBuf {
        self.coin_dir(coin).join("accounts").join(format!("{}.json", code))
    }

    fn headers_path(&self, coin: CoinCode) -> PathBuf {
        self.coin_dir(coin).join("headers.bin")
    }

    /// Replace the stored chain.
    pub fn save_headers(&self, coin: CoinCode, headers: &StoredHeaders) -> Result<(), StorageError> {
        fs::create_dir_all(self.coin_dir(coin))?;
        let path = self.headers_path(coin);
        let mut bytes = Vec::with_capacity(BASE_PREFIX as usize + headers.headers.len());
        bytes.extend_from_slice(&headers.base_height.to_le_bytes());
        bytes.extend_from_slice(&headers.headers);
        let tmp = path.with_extension("bin.tmp");
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    /// Overwrite the records from `from_height` on with `tail`.
    ///
    /// Returns `false`, writing nothing, when the file does not already hold
    /// the chain from `base_height` up to `from_height`; callers then fall
    /// back to [`Storage::save_headers`].
    pub fn save_header_tail(
        &self,
        coin: CoinCode,
        base_height: u32,
        from_height: u32,
        tail: &[u8],
    ) -> Result<bool, StorageError> {
        let Some(offset) = from_height.checked_sub(base_height) else {
            return Ok(false);
        };
        let path = self.headers_path(coin);
        if !path.exists() {
            return Ok(false);
        }
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let keep = BASE_PREFIX + u64::from(offset) * HEADER_SIZE as u64;
        if file.metadata()?.len() < keep {
            return Ok(false);
        }
        let mut prefix = [0u8; BASE_PREFIX as usize];
        file.read_exact(&mut prefix)?;
        if u32::from_le_bytes(prefix) != base_height {
            return Ok(false);
        }

        file.set_len(keep)?;
        file.seek(SeekFrom::Start(keep))?;
        file.write_all(tail)?;
        file.sync_data()?;
        Ok(true)
    }

    /// Returns `None` when nothing was stored yet.
    pub fn load_headers(&self, coin: CoinCode) -> Result<Option<StoredHeaders>, StorageError> {
        let path = self.headers_path(coin);
        if !path.exists() {
            return Ok(None);
        }
        let mut bytes = fs::read(&path)?;
        if bytes.len() < BASE_PREFIX as usize {
            return Err(StorageError::Corrupt {
                path: path.display().to_string(),
                reason: "missing base height".into(),
            });
        }
        let headers = bytes.split_off(BASE_PREFIX as usize);
        let mut base = [0u8; BASE_PREFIX as usize];
        base.copy_from_slice(&bytes);

        let mut stored = StoredHeaders {
            base_height: u32::from_le_bytes(base),
            headers,
        };
        let torn = stored.headers.len() % HEADER_SIZE;
        if torn != 0 {
            // an interrupted tail write; the complete records are still good
            log::warn!("Dropping {} trailing bytes from {}", torn, path.display());
            stored.headers.truncate(stored.headers.len() - torn);
        }
        Ok(Some(stored))
    }

    pub fn save_account(&self, coin: CoinCode, record: &AccountRecord) -> Result<(), StorageError> {
        let path = self.account_path(coin, &record.code);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        write_json(&path, record)
    }

    pub fn load_account(&self, coin: CoinCode, code: &str) -> Result<Option<AccountRecord>, StorageError> {
        read_json_opt(&self.account_path(coin, code))
    }

    pub fn remove_account(&self, coin: CoinCode, code: &str) -> Result<(), StorageError> {
        let path = self.account_path(coin, code);
        if path.exists() {
            fs::remove_file(path)?;
        }
        Ok(())
    }
}

/// Write through a temp file so a crash never leaves half a record behind.
fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    let json = serde_json::to_string(value)?;
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, json)?;
    fs::rename(tmp, path)?;
    Ok(())
}

fn read_json_opt<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, StorageError> {
    if !path.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(path)?;
    serde_json::from_str(&contents)
        .map(Some)
        .map_err(|e| StorageError::Corrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
}
