//! Timeseries/Valuation Builder
//!
//! Merges per-account balance timeseries with historical prices into daily
//! and hourly fiat series. When price history does not cover the data, or
//! is stale, the result says so through `missing` instead of guessing.
//!
//! The builder is pure: the current time is passed in, so rebuilding from the
//! same transactions and prices gives identical output.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::account::OrderedTransactions;
use crate::coin::Coin;
use crate::rates::RatesProvider;

const HOUR: i64 = 3600;
const DAY: i64 = 24 * HOUR;
const HOURLY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChartEntry {
    pub time: i64,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChartData {
    pub daily: Vec<ChartEntry>,
    pub hourly: Vec<ChartEntry>,
    pub missing: bool,
}

pub struct ChartBuilder<'a> {
    rates: &'a dyn RatesProvider,
    fiat: &'a str,
    now: i64,
    until: i64,
    daily: BTreeMap<i64, f64>,
    hourly: BTreeMap<i64, f64>,
    missing: bool,
}

impl<'a> ChartBuilder<'a> {
    /// `units` are the rates units of every coin with accounts; the chart
    /// only runs up to the point all of them have history for.
    pub fn new(
        rates: &'a dyn RatesProvider,
        fiat: &'a str,
        units: &[&str],
        now: i64,
        stale_after: Duration,
    ) -> Self {
        let latest = rates.latest_history_timestamp(units, fiat);
        let missing = match latest {
            None => true,
            Some(until) => now - until > stale_after.as_secs() as i64,
        };
        if missing {
            log::info!("📉 Chart data missing: price history until {:?}, now {}", latest, now);
        }
        Self {
            rates,
            fiat,
            now,
            until: latest.unwrap_or(0),
            daily: BTreeMap::new(),
            hourly: BTreeMap::new(),
            missing,
        }
    }

    pub fn is_missing(&self) -> bool {
        self.missing
    }

    fn flag_missing(&mut self, coin: &Coin, reason: &str) {
        log::info!("📉 Chart data missing for {}: {}", coin.code, reason);
        self.missing = true;
    }

    /// Fold one account into the series.
    pub fn add_account(&mut self, coin: &Coin, available: u64, transactions: &OrderedTransactions) {
        if self.missing {
            return;
        }
        let unit = coin.rates_unit();

        if transactions.missing_timestamps() {
            self.flag_missing(coin, "transaction without block time");
            return;
        }
        let Some(earliest_tx) = transactions.earliest_time() else {
            // no timed transaction: nothing to chart
            return;
        };
        match self.rates.earliest_history_timestamp(unit, self.fiat) {
            Some(earliest_price) if earliest_price <= earliest_tx => {}
            _ => {
                self.flag_missing(coin, "price history starts after the first transaction");
                return;
            }
        }

        let hourly_from = truncate_to_day(self.now - HOURLY_DAYS * DAY);
        let (Some(daily), Some(hourly)) = (
            transactions.timeseries(truncate_to_day(earliest_tx), self.until, DAY),
            transactions.timeseries(hourly_from, self.until, HOUR),
        ) else {
            self.flag_missing(coin, "transaction without time");
            return;
        };

        let Some(last_price) = self.rates.last_for_pair(unit, self.fiat) else {
            self.flag_missing(coin, "no current price");
            return;
        };

        let scale = 10f64.powi(coin.decimals as i32);
        for (series, entries) in [(&mut self.daily, daily), (&mut self.hourly, hourly)] {
            for entry in entries {
                let price = self.rates.price_at(unit, self.fiat, entry.time);
                *series.entry(entry.time).or_insert(0.0) += entry.value as f64 / scale * price;
            }
        }

        // Anchor the hourly series at the live balance and spot price.
        *self.hourly.entry(self.now).or_insert(0.0) += available as f64 / scale * last_price;
    }

    pub fn finish(self) -> ChartData {
        ChartData {
            daily: trim_leading_zeros(self.daily),
            hourly: trim_leading_zeros(self.hourly),
            missing: self.missing,
        }
    }
}

fn truncate_to_day(time: i64) -> i64 {
    time - time.rem_euclid(DAY)
}

fn trim_leading_zeros(series: BTreeMap<i64, f64>) -> Vec<ChartEntry> {
    series
        .into_iter()
        .map(|(time, value)| ChartEntry { time, value })
        .skip_while(|e| e.value == 0.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Transaction, TxKind};
    use crate::coin::CoinCode;
    use crate::rates::StaticRates;

    const NOW: i64 = 1_700_000_000;

    fn tx(txid: &str, amount: i64, time: i64) -> Transaction {
        Transaction {
            txid: txid.into(),
            kind: TxKind::Received,
            amount,
            fee: None,
            height: Some(1),
            confirmations: 1,
            timestamp: Some(time),
            created_timestamp: None,
        }
    }

    fn rates_covering(from: i64, to: i64) -> StaticRates {
        let mut rates = StaticRates::new();
        let mut t = from;
        while t <= to {
            rates.add_history("BTC", "USD", t, 20_000.0 + ((t - from) / HOUR) as f64);
            t += HOUR;
        }
        rates.set_last("BTC", "USD", 30_000.0);
        rates
    }

    #[test]
    fn test_builds_daily_and_hourly_series() {
        let coin = Coin::from_code(CoinCode::Btc);
        let first = NOW - 20 * DAY;
        let txs = OrderedTransactions::new(vec![tx("a", 100_000_000, first), tx("b", 50_000_000, NOW - 2 * DAY)]);
        let rates = rates_covering(first - DAY, NOW - HOUR);

        let mut builder = ChartBuilder::new(&rates, "USD", &["BTC"], NOW, Duration::from_secs(7200));
        builder.add_account(&coin, 150_000_000, &txs);
        let chart = builder.finish();

        assert!(!chart.missing);
        assert!(!chart.daily.is_empty());
        assert!(chart.daily.windows(2).all(|w| w[0].time < w[1].time));
        assert!(chart.daily[0].value > 0.0);
        assert_eq!(chart.daily[0].time % DAY, 0);
        // final live point: 1.5 BTC at spot
        let last = chart.hourly.last().unwrap();
        assert_eq!(last.time, NOW);
        assert_eq!(last.value, 1.5 * 30_000.0);
    }

    #[test]
    fn test_rebuild_is_bit_identical() {
        let coin = Coin::from_code(CoinCode::Btc);
        let first = NOW - 10 * DAY;
        let txs = OrderedTransactions::new(vec![tx("a", 12_345_678, first), tx("b", -2_345_678, NOW - 3 * DAY)]);
        let rates = rates_covering(first - DAY, NOW);

        let build = || {
            let mut builder = ChartBuilder::new(&rates, "USD", &["BTC"], NOW, Duration::from_secs(7200));
            builder.add_account(&coin, 10_000_000, &txs);
            builder.finish()
        };
        let a = build();
        let b = build();
        assert_eq!(a.daily.len(), b.daily.len());
        for (x, y) in a.daily.iter().chain(&a.hourly).zip(b.daily.iter().chain(&b.hourly)) {
            assert_eq!(x.time, y.time);
            assert_eq!(x.value.to_bits(), y.value.to_bits());
        }
    }

    #[test]
    fn test_stale_history_flags_missing() {
        let coin = Coin::from_code(CoinCode::Btc);
        let txs = OrderedTransactions::new(vec![tx("a", 1, NOW - DAY)]);
        let rates = rates_covering(NOW - 2 * DAY, NOW - 3 * HOUR);

        let mut builder = ChartBuilder::new(&rates, "USD", &["BTC"], NOW, Duration::from_secs(7200));
        assert!(builder.is_missing());
        builder.add_account(&coin, 1, &txs);
        let chart = builder.finish();
        assert!(chart.missing);
        assert!(chart.daily.is_empty());
        assert!(chart.hourly.is_empty());
    }

    #[test]
    fn test_history_starting_after_first_tx_flags_missing() {
        let coin = Coin::from_code(CoinCode::Btc);
        let txs = OrderedTransactions::new(vec![tx("a", 1, NOW - 5 * DAY)]);
        let rates = rates_covering(NOW - 2 * DAY, NOW);

        let mut builder = ChartBuilder::new(&rates, "USD", &["BTC"], NOW, Duration::from_secs(7200));
        builder.add_account(&coin, 1, &txs);
        assert!(builder.finish().missing);
    }

    #[test]
    fn test_unconfirmed_now_without_price_history() {
        let coin = Coin::from_code(CoinCode::Btc);
        let mut pending = tx("a", 1_000, NOW);
        pending.height = None;
        pending.timestamp = None;
        pending.created_timestamp = Some(NOW);
        let txs = OrderedTransactions::new(vec![pending]);
        let rates = StaticRates::new();

        let mut builder = ChartBuilder::new(&rates, "USD", &["BTC"], NOW, Duration::from_secs(7200));
        builder.add_account(&coin, 0, &txs);
        let chart = builder.finish();
        assert!(chart.missing);
        assert!(chart.daily.is_empty());
    }

    #[test]
    fn test_leading_zeros_trimmed() {
        let mut series = BTreeMap::new();
        series.insert(1, 0.0);
        series.insert(2, 0.0);
        series.insert(3, 5.0);
        series.insert(4, 0.0);
        let trimmed = trim_leading_zeros(series);
        assert_eq!(trimmed.iter().map(|e| e.time).collect::<Vec<_>>(), vec![3, 4]);
    }
}
