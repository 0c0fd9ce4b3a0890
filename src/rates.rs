//! Price data
//!
//! The sync core never fetches prices itself; it reads them through
//! [`RatesProvider`]. [`StaticRates`] is an in-memory provider loaded from a
//! JSON file, used by the binary and in tests.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

use crate::coin::{rates_unit, Coin};
use crate::error::{StorageError, SyncError};

pub trait RatesProvider: Send + Sync {
    /// Historical price of one `unit` in `fiat` at unix time `time`; 0.0 when unknown.
    fn price_at(&self, unit: &str, fiat: &str, time: i64) -> f64;

    fn earliest_history_timestamp(&self, unit: &str, fiat: &str) -> Option<i64>;

    /// Oldest of the per-unit latest history points (the whole set is only
    /// as fresh as its stalest member).
    fn latest_history_timestamp(&self, units: &[&str], fiat: &str) -> Option<i64>;

    /// Current spot price.
    fn last_for_pair(&self, unit: &str, fiat: &str) -> Option<f64>;
}

/// `{"last": {"BTC": {"USD": 1.0}}, "history": {"BTC": {"USD": [[time, price], ...]}}}`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticRates {
    #[serde(default)]
    last: HashMap<String, HashMap<String, f64>>,
    #[serde(default)]
    history: HashMap<String, HashMap<String, Vec<(i64, f64)>>>,
}

impl StaticRates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, StorageError> {
        if !path.exists() {
            return Err(StorageError::FileNotFound(path.display().to_string()));
        }
        let contents = std::fs::read_to_string(path)?;
        let mut rates: Self = serde_json::from_str(&contents)?;
        for series in rates.history.values_mut().flat_map(|m| m.values_mut()) {
            series.sort_by_key(|(time, _)| *time);
        }
        Ok(rates)
    }

    pub fn set_last(&mut self, unit: &str, fiat: &str, price: f64) {
        self.last
            .entry(unit.to_string())
            .or_default()
            .insert(fiat.to_string(), price);
    }

    pub fn add_history(&mut self, unit: &str, fiat: &str, time: i64, price: f64) {
        let series = self
            .history
            .entry(unit.to_string())
            .or_default()
            .entry(fiat.to_string())
            .or_default();
        let pos = series.partition_point(|(t, _)| *t < time);
        series.insert(pos, (time, price));
    }

    fn series(&self, unit: &str, fiat: &str) -> &[(i64, f64)] {
        self.history
            .get(unit)
            .and_then(|m| m.get(fiat))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl RatesProvider for StaticRates {
    /// Linear interpolation between the surrounding points.
    fn price_at(&self, unit: &str, fiat: &str, time: i64) -> f64 {
        let series = self.series(unit, fiat);
        let (Some(first), Some(last)) = (series.first(), series.last()) else {
            return 0.0;
        };
        if time < first.0 || time > last.0 {
            return 0.0;
        }
        let pos = series.partition_point(|(t, _)| *t < time);
        let (t1, p1) = series[pos];
        if t1 == time || pos == 0 {
            return p1;
        }
        let (t0, p0) = series[pos - 1];
        p0 + (p1 - p0) * (time - t0) as f64 / (t1 - t0) as f64
    }

    fn earliest_history_timestamp(&self, unit: &str, fiat: &str) -> Option<i64> {
        self.series(unit, fiat).first().map(|(t, _)| *t)
    }

    fn latest_history_timestamp(&self, units: &[&str], fiat: &str) -> Option<i64> {
        let mut oldest: Option<i64> = None;
        for unit in units {
            let latest = self.series(unit, fiat).last().map(|(t, _)| *t)?;
            oldest = Some(oldest.map_or(latest, |o| o.min(latest)));
        }
        oldest
    }

    fn last_for_pair(&self, unit: &str, fiat: &str) -> Option<f64> {
        self.last.get(unit).and_then(|m| m.get(fiat)).copied()
    }
}

fn parse_amount(amount: &str) -> Result<f64, SyncError> {
    amount
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|a| a.is_finite() && *a >= 0.0)
        .ok_or_else(|| SyncError::InvalidAmount(amount.to_string()))
}

/// Value of `amount` units of `from_unit` in `fiat`, two decimals.
pub fn convert_to_fiat(
    rates: &dyn RatesProvider,
    from_unit: &str,
    fiat: &str,
    amount: &str,
) -> Result<String, SyncError> {
    let amount = parse_amount(amount)?;
    let rate = rates.last_for_pair(rates_unit(from_unit), fiat).unwrap_or(0.0);
    Ok(format!("{:.2}", amount * rate))
}

/// Amount of `coin` bought by `amount` of `fiat`, in coin decimals.
pub fn convert_from_fiat(
    rates: &dyn RatesProvider,
    fiat: &str,
    coin: &Coin,
    amount: &str,
) -> Result<String, SyncError> {
    let amount = parse_amount(amount)?;
    let rate = rates.last_for_pair(coin.rates_unit(), fiat).unwrap_or(0.0);
    let result = if rate != 0.0 { amount / rate } else { 0.0 };
    Ok(format!("{:.*}", coin.decimals as usize, result))
}
