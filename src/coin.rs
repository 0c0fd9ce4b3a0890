/// Supported coins
///
/// Every coin is a Bitcoin-family network synced over Electrum. The coin code
/// doubles as the key for server lists, rates lookups and on-disk directories.
use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoinCode {
    Btc,
    Tbtc,
    Rbtc,
}

impl CoinCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinCode::Btc => "btc",
            CoinCode::Tbtc => "tbtc",
            CoinCode::Rbtc => "rbtc",
        }
    }
}

impl fmt::Display for CoinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CoinCode {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "btc" => Ok(CoinCode::Btc),
            "tbtc" => Ok(CoinCode::Tbtc),
            "rbtc" => Ok(CoinCode::Rbtc),
            other => Err(SyncError::UnknownCoin(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coin {
    pub code: CoinCode,
    pub name: &'static str,
    pub unit: &'static str,
    pub decimals: u32,
    pub network: Network,
}

impl Coin {
    pub fn from_code(code: CoinCode) -> Self {
        match code {
            CoinCode::Btc => Self {
                code,
                name: "Bitcoin",
                unit: "BTC",
                decimals: 8,
                network: Network::Bitcoin,
            },
            CoinCode::Tbtc => Self {
                code,
                name: "Bitcoin Testnet",
                unit: "TBTC",
                decimals: 8,
                network: Network::Testnet,
            },
            CoinCode::Rbtc => Self {
                code,
                name: "Bitcoin Regtest",
                unit: "RBTC",
                decimals: 8,
                network: Network::Regtest,
            },
        }
    }

    /// Unit under which the rates collaborator publishes prices for this coin.
    pub fn rates_unit(&self) -> &'static str {
        rates_unit(self.unit)
    }

    /// Convert an amount in the smallest unit to a decimal string in the coin unit.
    pub fn format_amount(&self, amount: u64) -> String {
        let divisor = 10u64.pow(self.decimals);
        format!(
            "{}.{:0width$}",
            amount / divisor,
            amount % divisor,
            width = self.decimals as usize
        )
    }
}

/// Testnet units are quoted at their mainnet counterpart's rate.
///
/// This is a fixed table, not a string rule: only the units listed here are
/// mapped, everything else is looked up verbatim.
pub fn rates_unit(unit: &str) -> &str {
    match unit {
        "TBTC" | "RBTC" => "BTC",
        "TLTC" => "LTC",
        "TETH" | "RETH" => "ETH",
        other => other,
    }
}
