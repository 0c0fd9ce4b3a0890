use electrum_sync::{Backend, Coin, ServersFile, StaticKeystore, StaticRates, SyncConfig};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    // RUST_LOG=debug shows per-request traffic
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = SyncConfig::from_env();
    let servers = match &config.servers_file {
        Some(path) => ServersFile::load(path)?,
        None => anyhow::bail!("SERVERS_FILE is not set"),
    };

    let keystore_path = PathBuf::from(env::var("KEYSTORE_FILE").unwrap_or_else(|_| "keystore.toml".to_string()));
    let keystore = StaticKeystore::load(&keystore_path)?;

    let rates = match env::var("RATES_FILE") {
        Ok(path) => StaticRates::load(&PathBuf::from(path))?,
        Err(_) => {
            log::warn!("⚠️  RATES_FILE not set, fiat values will be zero");
            StaticRates::new()
        }
    };
    let fiat = env::var("FIAT").unwrap_or_else(|_| "USD".to_string());

    let backend = Backend::from_servers_file(config, &servers, Arc::new(keystore), Arc::new(rates));
    let codes = backend.load_accounts().map_err(|e| anyhow::anyhow!(e.message))?;
    log::info!("Starting watch-only sync for {} accounts", codes.len());

    let mut report = tokio::time::interval(Duration::from_secs(60));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = report.tick() => {
                for coin in backend.active_coins() {
                    if let Ok(status) = backend.get_headers_status(coin) {
                        log::info!(
                            "📊 {}: tip {} verified {}{}",
                            coin,
                            status.tip_height,
                            status.verified_height,
                            if status.is_syncing { " (syncing)" } else { "" }
                        );
                    }
                }
                let summary = backend.get_account_summary(&fiat);
                for (coin, total) in &summary.totals {
                    log::info!("💰 {}: {}", coin, Coin::from_code(*coin).format_amount(*total));
                }
                if summary.chart_data_missing {
                    log::info!("Chart data in {} incomplete", summary.chart_fiat);
                }
            }
        }
    }

    backend.shutdown().await;
    Ok(())
}
