use anyhow::Result;
use chrono::{Duration, Utc};
use common::config::Config;
use common::db::AsyncDb;
use common::prices::PriceSource;
use std::collections::HashMap;

use crate::notify::{ConsensusAlert, Notifier};

/// One windowed buy by a smart wallet, joined with its election row.
#[derive(Debug, Clone, PartialEq)]
pub struct SmartBuy {
    pub wallet_address: String,
    pub symbol: String,
    pub contract_address: String,
    pub chain: String,
    pub quantity: f64,
    pub price_per_token: f64,
    pub timestamp: String,
    /// The wallet's optimal threshold in USD.
    pub tier_usd: f64,
}

impl SmartBuy {
    pub fn investment_usd(&self) -> f64 {
        self.quantity * self.price_per_token
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenConsensus {
    pub symbol: String,
    pub contract_address: String,
    pub chain: String,
    pub whale_count: u32,
    pub total_investment: f64,
    pub avg_entry_price: f64,
    pub first_buy: String,
    pub last_buy: String,
    pub wallet_addresses: Vec<String>,
}

/// Group windowed buys by token. A wallet counts toward a token's consensus
/// only when its aggregate buy volume there reaches its own optimal
/// threshold; tokens keeping at least `min_whales` such wallets survive.
pub fn group_consensus(buys: &[SmartBuy], min_whales: u32) -> Vec<TokenConsensus> {
    let mut by_token: HashMap<&str, Vec<&SmartBuy>> = HashMap::new();
    for b in buys {
        by_token.entry(b.contract_address.as_str()).or_default().push(b);
    }

    let mut out = Vec::new();
    for (contract, token_buys) in by_token {
        let mut invested: HashMap<&str, f64> = HashMap::new();
        let mut tier: HashMap<&str, f64> = HashMap::new();
        for b in &token_buys {
            *invested.entry(b.wallet_address.as_str()).or_default() += b.investment_usd();
            tier.insert(b.wallet_address.as_str(), b.tier_usd);
        }

        let mut qualified: Vec<&str> = invested
            .iter()
            .filter(|(w, total)| **total >= tier.get(**w).copied().unwrap_or(f64::MAX))
            .map(|(w, _)| *w)
            .collect();
        qualified.sort_unstable();

        if (qualified.len() as u32) < min_whales {
            continue;
        }

        let qualified_buys: Vec<&&SmartBuy> = token_buys
            .iter()
            .filter(|b| qualified.binary_search(&b.wallet_address.as_str()).is_ok())
            .collect();

        let total_investment: f64 = qualified_buys.iter().map(|b| b.investment_usd()).sum();
        let total_quantity: f64 = qualified_buys.iter().map(|b| b.quantity).sum();
        let first_buy = qualified_buys
            .iter()
            .map(|b| b.timestamp.as_str())
            .min()
            .unwrap_or_default()
            .to_string();
        let last_buy = qualified_buys
            .iter()
            .map(|b| b.timestamp.as_str())
            .max()
            .unwrap_or_default()
            .to_string();

        out.push(TokenConsensus {
            symbol: token_buys[0].symbol.clone(),
            contract_address: contract.to_string(),
            chain: token_buys[0].chain.clone(),
            whale_count: qualified.len() as u32,
            total_investment,
            avg_entry_price: if total_quantity > 0.0 {
                total_investment / total_quantity
            } else {
                0.0
            },
            first_buy,
            last_buy,
            wallet_addresses: qualified.iter().map(|w| w.to_string()).collect(),
        });
    }

    out.sort_by(|a, b| b.total_investment.total_cmp(&a.total_investment));
    out
}

async fn load_window_buys<M: PriceSource + Sync>(
    db: &AsyncDb,
    market: &M,
    cfg: &Config,
    window_start: &str,
) -> Result<Vec<SmartBuy>> {
    let window_start = window_start.to_string();
    let rows: Vec<SmartBuy> = db
        .call_named("consensus.load_buys", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT t.wallet_address, t.symbol, t.contract_address,
                        COALESCE(tp.chain, ''), t.quantity, t.price_per_token, t.timestamp,
                        sw.optimal_threshold_tier
                 FROM transfers t
                 JOIN smart_wallets sw ON sw.wallet_address = t.wallet_address
                 LEFT JOIN token_positions tp
                   ON tp.wallet_address = t.wallet_address AND tp.fungible_id = t.fungible_id
                 WHERE t.action_type = 'buy'
                   AND t.price_per_token > 0
                   AND t.quantity > 0
                   AND t.contract_address IS NOT NULL
                   AND t.timestamp >= ?1
                 ORDER BY t.timestamp ASC",
            )?;
            let rows = stmt.query_map([&window_start], |row| {
                Ok(SmartBuy {
                    wallet_address: row.get(0)?,
                    symbol: row.get(1)?,
                    contract_address: row.get(2)?,
                    chain: row.get(3)?,
                    quantity: row.get(4)?,
                    price_per_token: row.get(5)?,
                    timestamp: row.get(6)?,
                    tier_usd: row.get::<_, i64>(7)? as f64,
                })
            })?;
            rows.collect()
        })
        .await?;

    let excluded: std::collections::HashSet<String> = cfg
        .scoring
        .excluded_tokens
        .iter()
        .map(|s| s.to_uppercase())
        .collect();

    Ok(rows
        .into_iter()
        .filter(|b| {
            let sym = b.symbol.to_uppercase();
            !market.is_stablecoin(&sym) && !excluded.contains(&sym)
        })
        .collect())
}

/// Detect consensus over the rolling window, upsert signals, emit alerts.
pub async fn run_consensus_once<M, N>(
    db: &AsyncDb,
    market: &M,
    notifier: &N,
    cfg: &Config,
) -> Result<u64>
where
    M: PriceSource + Sync,
    N: Notifier + Sync,
{
    let now = Utc::now();
    let window_start = crate::providers::iso(now - Duration::hours(cfg.consensus.window_hours));

    let buys = load_window_buys(db, market, cfg, &window_start).await?;
    let grouped = group_consensus(&buys, cfg.consensus.min_whales);
    tracing::info!(
        buys = buys.len(),
        candidates = grouped.len(),
        "consensus window grouped"
    );

    let mut emitted = 0_u64;
    for c in grouped {
        // Market-cap band check needs live enrichment; unknown tokens are
        // skipped rather than alerted blind.
        let Some(info) = market.token_info(&c.contract_address).await? else {
            tracing::debug!(symbol = %c.symbol, "no market data; skipping consensus candidate");
            continue;
        };
        if info.market_cap < cfg.consensus.mcap_min || info.market_cap > cfg.consensus.mcap_max {
            continue;
        }

        let wallets_json = serde_json::to_string(&c.wallet_addresses).unwrap_or_default();
        let detection_date = crate::providers::iso(now);
        let row = c.clone();
        db.call_named("consensus.upsert_signal", move |conn| {
            conn.execute(
                "INSERT INTO consensus_signals (
                    symbol, contract_address, detection_date, whale_count, total_investment,
                    first_buy, last_buy, is_active, period_start, period_end,
                    market_cap, liquidity_usd, avg_entry_price, wallet_addresses
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11, ?12, ?13)
                ON CONFLICT(contract_address, period_start) DO UPDATE SET
                    whale_count = excluded.whale_count,
                    total_investment = excluded.total_investment,
                    last_buy = excluded.last_buy,
                    detection_date = excluded.detection_date,
                    period_end = excluded.period_end,
                    market_cap = excluded.market_cap,
                    liquidity_usd = excluded.liquidity_usd,
                    avg_entry_price = excluded.avg_entry_price,
                    wallet_addresses = excluded.wallet_addresses,
                    is_active = 1",
                rusqlite::params![
                    row.symbol,
                    row.contract_address,
                    detection_date,
                    row.whale_count,
                    row.total_investment,
                    row.first_buy,
                    row.last_buy,
                    row.first_buy,
                    row.last_buy,
                    info.market_cap,
                    info.liquidity_usd,
                    row.avg_entry_price,
                    wallets_json,
                ],
            )?;
            Ok(())
        })
        .await?;

        let alert = ConsensusAlert {
            symbol: c.symbol.clone(),
            contract_address: c.contract_address.clone(),
            chain: c.chain.clone(),
            whale_count: c.whale_count,
            total_investment_usd: c.total_investment,
            first_buy: c.first_buy.clone(),
            last_buy: c.last_buy.clone(),
            market_cap: info.market_cap,
            liquidity_usd: info.liquidity_usd,
            wallet_addresses: c.wallet_addresses.clone(),
            period_start: c.first_buy.clone(),
            period_end: c.last_buy.clone(),
        };
        if let Err(e) = notifier.emit(&alert).await {
            // At-least-once: the signal row survives, the next pass re-emits.
            tracing::error!(symbol = %c.symbol, error = %e, "alert emission failed");
        }
        metrics::counter!("tracker_consensus_signals_total").increment(1);
        emitted += 1;
    }

    // Signals whose whole window has passed are no longer live calls.
    let stale_cutoff = window_start.clone();
    db.call_named("consensus.deactivate_stale", move |conn| {
        conn.execute(
            "UPDATE consensus_signals SET is_active = 0
             WHERE is_active = 1 AND last_buy < ?1",
            [&stale_cutoff],
        )?;
        Ok(())
    })
    .await?;

    Ok(emitted)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SignalPerformance {
    pub symbol: String,
    pub contract_address: String,
    pub detection_date: String,
    pub whale_count: u32,
    pub avg_entry_price: f64,
    pub current_price: Option<f64>,
    pub performance_pct: Option<f64>,
}

/// Entry-vs-now performance of stored signals, newest first.
pub async fn signal_performance<M: PriceSource + Sync>(
    db: &AsyncDb,
    market: &M,
) -> Result<Vec<SignalPerformance>> {
    let signals: Vec<(String, String, String, i64, f64)> = db
        .call_named("consensus.load_signals", |conn| {
            let mut stmt = conn.prepare(
                "SELECT symbol, contract_address, detection_date, whale_count, avg_entry_price
                 FROM consensus_signals
                 ORDER BY detection_date DESC
                 LIMIT 50",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                ))
            })?;
            rows.collect()
        })
        .await?;

    let mut out = Vec::new();
    for (symbol, contract, detection_date, whales, entry) in signals {
        let current = market
            .price(Some(&contract), &symbol)
            .await?
            .map(|p| p.usd);
        let performance_pct = match current {
            Some(p) if entry > 0.0 => Some((p - entry) / entry * 100.0),
            _ => None,
        };
        out.push(SignalPerformance {
            symbol,
            contract_address: contract,
            detection_date,
            whale_count: whales as u32,
            avg_entry_price: entry,
            current_price: current,
            performance_pct,
        });
    }
    Ok(out)
}
