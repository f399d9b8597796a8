use anyhow::Result;
use chrono::{Duration, Utc};
use common::config::Config;
use common::db::AsyncDb;
use common::types::ApiTransaction;
use serde::Serialize;
use std::collections::HashMap;

use crate::ingestion::{self, TokenRef, TransfersPager};
use crate::providers::{parse_iso, ContractChecker, SendsFetcher};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferredToken {
    pub symbol: String,
    pub contract_address: Option<String>,
    pub fungible_id: Option<String>,
    pub quantity: f64,
    pub value_usd: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationCandidate {
    pub destination: String,
    pub total_value: f64,
    pub transfer_percentage: f64,
    pub tokens: Vec<TransferredToken>,
}

/// Aggregate outgoing value per recipient over the window; a single recipient
/// taking more than `min_fraction` of the portfolio is a migration candidate.
pub fn analyze_sends(
    txs: &[ApiTransaction],
    portfolio_value: f64,
    min_fraction: f64,
    window_hours: i64,
) -> Option<MigrationCandidate> {
    if portfolio_value <= 0.0 {
        return None;
    }
    let cutoff = Utc::now() - Duration::hours(window_hours);

    let mut value_by_dest: HashMap<String, f64> = HashMap::new();
    let mut tokens_by_dest: HashMap<String, Vec<TransferredToken>> = HashMap::new();

    for tx in txs {
        if let Some(ts) = tx.attributes.mined_at.as_deref().and_then(parse_iso) {
            if ts < cutoff {
                continue;
            }
        }
        for transfer in &tx.attributes.transfers {
            if transfer.direction.as_deref() != Some("out") {
                continue;
            }
            let Some(recipient) = transfer.recipient.clone() else {
                continue;
            };
            let value = transfer.value.unwrap_or(0.0);
            if value <= 0.0 {
                continue;
            }

            *value_by_dest.entry(recipient.clone()).or_default() += value;
            tokens_by_dest
                .entry(recipient)
                .or_default()
                .push(TransferredToken {
                    symbol: transfer
                        .fungible_info
                        .symbol
                        .clone()
                        .unwrap_or_else(|| "UNKNOWN".to_string())
                        .to_uppercase(),
                    contract_address: transfer
                        .fungible_info
                        .implementations
                        .first()
                        .and_then(|i| i.address.clone()),
                    fungible_id: transfer.fungible_info.id.clone(),
                    quantity: transfer.quantity.as_ref().map_or(0.0, |q| q.as_f64()),
                    value_usd: value,
                });
        }
    }

    let (destination, total_value) = value_by_dest
        .into_iter()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    let transfer_percentage = total_value / portfolio_value * 100.0;
    if transfer_percentage < min_fraction * 100.0 {
        return None;
    }

    let tokens = tokens_by_dest.remove(&destination).unwrap_or_default();
    Some(MigrationCandidate {
        destination,
        total_value,
        transfer_percentage,
        tokens,
    })
}

/// Weighted average buy price of a (wallet, symbol) from its cost-bearing
/// buy rows; `None` when the wallet never bought the token at a known price.
async fn parent_avg_buy_price(db: &AsyncDb, wallet: &str, symbol: &str) -> Result<Option<f64>> {
    let wallet = wallet.to_string();
    let symbol = symbol.to_string();
    db.call_named("migration.parent_avg_price", move |conn| {
        conn.query_row(
            "SELECT SUM(quantity * price_per_token) / SUM(quantity)
             FROM transfers
             WHERE wallet_address = ?1 AND symbol = ?2
               AND action_type = 'buy' AND price_per_token > 0 AND quantity > 0",
            rusqlite::params![wallet, symbol],
            |row| row.get::<_, Option<f64>>(0),
        )
    })
    .await
}

/// Stamp the parent's average buy price onto the child's inbound rows.
/// `price_per_token` is never touched; the IS NULL guard makes re-runs
/// no-ops. Returns the number of rows updated.
pub async fn inherit_prices(
    db: &AsyncDb,
    parent: &str,
    child: &str,
    tokens: &[TransferredToken],
) -> Result<u64> {
    let mut symbols: Vec<String> = tokens.iter().map(|t| t.symbol.clone()).collect();
    symbols.sort();
    symbols.dedup();

    let mut updated = 0_u64;
    for symbol in symbols {
        let Some(avg_price) = parent_avg_buy_price(db, parent, &symbol).await? else {
            tracing::debug!(parent, symbol, "no parent buy price; skipping inheritance");
            continue;
        };

        let (parent_s, child_s, symbol_s) =
            (parent.to_string(), child.to_string(), symbol.clone());
        let rows = db
            .call_named("migration.inherit", move |conn| {
                conn.execute(
                    "UPDATE transfers
                     SET inherited_price_per_token = ?1, is_inherited_from_wallet = ?2
                     WHERE wallet_address = ?3 AND symbol = ?4
                       AND direction = 'in' AND inherited_price_per_token IS NULL",
                    rusqlite::params![avg_price, parent_s, child_s, symbol_s],
                )
            })
            .await? as u64;
        if rows > 0 {
            tracing::info!(child, symbol, avg_price, rows, "inherited cost basis");
        }
        updated += rows;
    }
    Ok(updated)
}

/// Full migration pass for one smart wallet: detect, verify EOA, register the
/// child, fetch its history, inherit the cost basis, record the migration.
pub async fn detect_for_wallet<P>(
    db: &AsyncDb,
    provider: &P,
    wallet: &str,
    portfolio_value: f64,
    cfg: &Config,
) -> Result<Option<MigrationCandidate>>
where
    P: SendsFetcher + TransfersPager + ContractChecker + Sync,
{
    let sends = provider
        .fetch_recent_sends(wallet, cfg.migration.window_hours)
        .await?;
    if sends.is_empty() {
        return Ok(None);
    }

    let Some(candidate) = analyze_sends(
        &sends,
        portfolio_value,
        cfg.migration.portfolio_fraction,
        cfg.migration.window_hours,
    ) else {
        return Ok(None);
    };

    tracing::info!(
        wallet,
        destination = %candidate.destination,
        value = candidate.total_value,
        pct = candidate.transfer_percentage,
        tokens = candidate.tokens.len(),
        "migration candidate"
    );

    // Contract or unverifiable destination: not a wallet migration.
    match provider.is_contract(&candidate.destination).await? {
        Some(false) => {}
        Some(true) => {
            tracing::info!(destination = %candidate.destination, "destination is a contract; ignored");
            return Ok(None);
        }
        None => {
            tracing::warn!(destination = %candidate.destination, "EOA check ambiguous; ignored");
            return Ok(None);
        }
    }

    // Register the child for scoring on the next pipeline pass.
    let child = candidate.destination.clone();
    let child_s = child.clone();
    db.call_named("migration.insert_child", move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO wallets (
                wallet_address, period, is_active, is_scored, transactions_extracted,
                total_portfolio_value, created_at, updated_at
            ) VALUES (?1, 'migration', 1, 0, 0, 0, datetime('now'), datetime('now'))",
            [child_s],
        )?;
        Ok(())
    })
    .await?;

    // History for each transferred token the provider can address.
    let mut seen = std::collections::HashSet::new();
    let mut fetched = 0_u32;
    for token in &candidate.tokens {
        let Some(fungible_id) = token.fungible_id.clone() else {
            tracing::debug!(symbol = %token.symbol, "no fungible id; skipping child history");
            continue;
        };
        if !seen.insert(fungible_id.clone()) {
            continue;
        }
        let token_ref = TokenRef {
            symbol: token.symbol.clone(),
            contract_address: token.contract_address.clone(),
            fungible_id,
        };
        match ingestion::fetch_full_history(provider, &child, &token_ref, cfg.provider.max_pages)
            .await
        {
            Ok(rows) => {
                ingestion::ingest_history(db, rows).await?;
                fetched += 1;
            }
            Err(e) => {
                tracing::error!(child = %child, symbol = %token_ref.symbol, error = %e,
                    "child history fetch failed");
            }
        }
    }

    if fetched > 0 {
        let child_s = child.clone();
        db.call_named("migration.mark_extracted", move |conn| {
            conn.execute(
                "UPDATE wallets SET transactions_extracted = 1, updated_at = datetime('now')
                 WHERE wallet_address = ?1",
                [child_s],
            )?;
            Ok(())
        })
        .await?;
    }

    inherit_prices(db, wallet, &child, &candidate.tokens).await?;

    let tokens_json = serde_json::to_string(&candidate.tokens)?;
    let migration_date = Utc::now().date_naive().to_string();
    let (parent_s, child_s) = (wallet.to_string(), child.clone());
    let (value, pct) = (candidate.total_value, candidate.transfer_percentage);
    db.call_named("migration.insert_record", move |conn| {
        conn.execute(
            "INSERT OR IGNORE INTO wallet_migrations (
                old_wallet, new_wallet, migration_date, tokens_transferred,
                total_value_transferred, transfer_percentage, is_validated
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
            rusqlite::params![parent_s, child_s, migration_date, tokens_json, value, pct],
        )?;
        Ok(())
    })
    .await?;

    metrics::counter!("tracker_migrations_detected_total").increment(1);
    Ok(Some(candidate))
}

/// Run migration detection across all smart wallets with known portfolios.
pub async fn run_migration_detection_once<P>(db: &AsyncDb, provider: &P, cfg: &Config) -> Result<u64>
where
    P: SendsFetcher + TransfersPager + ContractChecker + Sync,
{
    let wallets: Vec<(String, f64)> = db
        .call_named("migration.list_smart_wallets", |conn| {
            let mut stmt = conn.prepare(
                "SELECT w.wallet_address, w.total_portfolio_value
                 FROM wallets w
                 JOIN smart_wallets sw ON sw.wallet_address = w.wallet_address
                 WHERE w.is_active = 1 AND w.total_portfolio_value > 0
                 ORDER BY w.total_portfolio_value DESC",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            rows.collect()
        })
        .await?;

    let mut detected = 0_u64;
    for (wallet, portfolio_value) in wallets {
        match detect_for_wallet(db, provider, &wallet, portfolio_value, cfg).await {
            Ok(Some(_)) => detected += 1,
            Ok(None) => {}
            Err(e) => {
                tracing::error!(wallet, error = %e, "migration detection failed");
            }
        }
    }
    Ok(detected)
}
