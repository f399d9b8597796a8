use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::types::DiscoveryPeriod;
use serde::Deserialize;

use crate::fifo;
use crate::ingestion::{self, TokenRef, TransfersPager};
use crate::providers::BalancesFetcher;
use common::prices::PriceSource;

#[derive(Debug, Clone, PartialEq)]
pub struct SeedWallet {
    pub address: String,
    pub period: DiscoveryPeriod,
}

/// Where candidate wallets come from. Swappable so tests can inject fixed sets.
pub trait SeedSource {
    fn fetch_candidates(&self) -> impl std::future::Future<Output = Result<Vec<SeedWallet>>> + Send;
}

/// JSON seed file: `[{"address": "0x...", "period": "30d"}, ...]`.
pub struct JsonSeedFile {
    path: String,
}

impl JsonSeedFile {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SeedEntry {
    address: String,
    #[serde(default)]
    period: Option<String>,
}

impl SeedSource for JsonSeedFile {
    async fn fetch_candidates(&self) -> Result<Vec<SeedWallet>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| anyhow::anyhow!("cannot read seed file {}: {e}", self.path))?;
        let entries: Vec<SeedEntry> = serde_json::from_str(&content)?;
        Ok(entries
            .into_iter()
            .filter(|e| !e.address.is_empty())
            .map(|e| SeedWallet {
                address: e.address.to_lowercase(),
                period: e
                    .period
                    .as_deref()
                    .and_then(DiscoveryPeriod::parse)
                    .unwrap_or(DiscoveryPeriod::Manual),
            })
            .collect())
    }
}

/// Register seed candidates, then pull balances and full per-token history
/// for any wallet not yet extracted. Per-wallet failures are logged and do
/// not stop the batch.
pub async fn run_discovery_once<S, P, M>(
    db: &AsyncDb,
    seeds: &S,
    provider: &P,
    prices: &M,
    cfg: &Config,
) -> Result<u64>
where
    S: SeedSource + Sync,
    P: BalancesFetcher + TransfersPager + Sync,
    M: PriceSource + Sync,
{
    let candidates = seeds.fetch_candidates().await?;
    tracing::info!(candidates = candidates.len(), "seed candidates loaded");

    let rows: Vec<(String, String)> = candidates
        .iter()
        .map(|s| (s.address.clone(), s.period.as_str().to_string()))
        .collect();
    let inserted = db
        .call_named("discovery.insert_candidates", move |conn| {
            let tx = conn.transaction()?;
            let mut n = 0_u64;
            for (address, period) in &rows {
                n += tx.execute(
                    "INSERT OR IGNORE INTO wallets (wallet_address, period, is_active)
                     VALUES (?1, ?2, 1)",
                    rusqlite::params![address, period],
                )? as u64;
            }
            tx.commit()?;
            Ok(n)
        })
        .await?;
    metrics::counter!("tracker_wallets_discovered_total").increment(inserted);

    let pending: Vec<String> = db
        .call_named("discovery.list_pending", |conn| {
            let mut stmt = conn.prepare(
                "SELECT wallet_address FROM wallets
                 WHERE is_active = 1 AND transactions_extracted = 0",
            )?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
        .await?;

    let mut extracted = 0_u64;
    for wallet in pending {
        match extract_wallet(db, provider, prices, cfg, &wallet).await {
            Ok(tokens) => {
                extracted += 1;
                tracing::info!(wallet, tokens, "initial extraction done");
            }
            Err(e) => {
                let kind = common::provider::classify_api_error(&e).as_str();
                tracing::error!(wallet, error = %e, kind, "initial extraction failed");
            }
        }
    }

    tracing::info!(inserted, extracted, "discovery pass done");
    Ok(inserted)
}

async fn extract_wallet<P, M>(
    db: &AsyncDb,
    provider: &P,
    prices: &M,
    cfg: &Config,
    wallet: &str,
) -> Result<u64>
where
    P: BalancesFetcher + TransfersPager + Sync,
    M: PriceSource + Sync,
{
    let balances = provider.fetch_balances(wallet).await?;
    let total: f64 = balances.iter().map(|b| b.usd_value).sum();

    let mut tokens = 0_u64;
    for b in &balances {
        if b.usd_value < cfg.tracking.min_token_value_usd {
            continue;
        }
        let token = TokenRef {
            symbol: b.symbol.clone(),
            contract_address: b.contract_address.clone(),
            fungible_id: b.fungible_id.clone(),
        };
        let rows =
            ingestion::fetch_full_history(provider, wallet, &token, cfg.provider.max_pages).await?;
        ingestion::ingest_history(db, rows).await?;
        tokens += 1;
    }

    let now = crate::providers::iso(chrono::Utc::now());
    let (wallet_s, balances_c, now_c) = (wallet.to_string(), balances.clone(), now.clone());
    db.call_named("discovery.store_positions", move |conn| {
        let tx = conn.transaction()?;
        for b in &balances_c {
            tx.execute(
                "INSERT INTO token_positions (
                    wallet_address, fungible_id, symbol, contract_address, chain,
                    current_amount, current_usd_value, current_price_per_token,
                    in_portfolio, last_updated
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
                ON CONFLICT(wallet_address, fungible_id) DO UPDATE SET
                    current_amount = excluded.current_amount,
                    current_usd_value = excluded.current_usd_value,
                    current_price_per_token = excluded.current_price_per_token,
                    in_portfolio = 1,
                    last_updated = excluded.last_updated",
                rusqlite::params![
                    wallet_s,
                    b.fungible_id,
                    b.symbol,
                    b.contract_address,
                    b.chain,
                    b.amount,
                    b.usd_value,
                    b.price_per_token(),
                    now_c,
                ],
            )?;
        }
        tx.execute(
            "UPDATE wallets SET transactions_extracted = 1, total_portfolio_value = ?2,
                 token_count = ?3, last_sync = ?4, updated_at = ?4
             WHERE wallet_address = ?1",
            rusqlite::params![wallet_s, total, balances_c.len() as i64, now_c],
        )?;
        tx.commit()?;
        Ok(())
    })
    .await?;

    fifo::rebuild_wallet(db, prices, wallet).await?;
    Ok(tokens)
}
