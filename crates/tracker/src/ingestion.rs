use anyhow::{Context, Result};
use common::db::AsyncDb;
use common::types::{ActionType, ApiTransaction, Direction, TransferRow};

/// One token to pull history for.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenRef {
    pub symbol: String,
    pub contract_address: Option<String>,
    pub fungible_id: String,
}

pub trait TransfersPager {
    #[allow(dead_code)]
    fn transfers_url(&self, wallet: &str, fungible_id: &str, cursor: Option<&str>) -> String;

    fn fetch_transfers_page(
        &self,
        wallet: &str,
        fungible_id: &str,
        cursor: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(Vec<ApiTransaction>, Option<String>)>> + Send;
}

/// Both legs of a swap carry USD value; when they agree within this ratio the
/// total would double-count the trade, so it is halved.
const SWAP_RATIO_THRESHOLD: f64 = 0.8;

/// Collapse raw provider transactions into normalized transfer rows for one
/// (wallet, token). Each transaction nets the target token's in/out legs:
///   - net inflow with USD value  -> buy
///   - net inflow, no value, peer -> transfer_in
///   - net inflow, no value      -> airdrop
///   - net outflow with value    -> sell
///   - net outflow, no value     -> transfer_out
pub fn normalize_transactions(
    wallet: &str,
    token: &TokenRef,
    txs: &[ApiTransaction],
) -> Vec<TransferRow> {
    let mut rows = Vec::new();

    for tx in txs {
        let attrs = &tx.attributes;
        let Some(hash) = attrs.hash.as_deref().filter(|h| !h.is_empty()) else {
            continue;
        };
        let Some(mined_at) = attrs.mined_at.as_deref().filter(|t| !t.is_empty()) else {
            continue;
        };
        let operation_type = attrs.operation_type.as_deref().unwrap_or("");

        let mut in_qty = 0.0_f64;
        let mut out_qty = 0.0_f64;
        let mut in_value = 0.0_f64;
        let mut out_value = 0.0_f64;
        let mut sender: Option<String> = None;
        let mut recipient: Option<String> = None;

        for transfer in &attrs.transfers {
            let direction = transfer.direction.as_deref().unwrap_or("");
            // Self-transfers move nothing in or out of the wallet.
            if direction == "self" {
                continue;
            }
            if transfer.fungible_info.id.as_deref() != Some(token.fungible_id.as_str()) {
                continue;
            }
            let amount = transfer.quantity.as_ref().map_or(0.0, |q| q.as_f64());
            let value = transfer.value.unwrap_or(0.0);
            match direction {
                "in" => {
                    in_qty += amount;
                    in_value += value;
                    if sender.is_none() {
                        sender = transfer.sender.clone();
                    }
                }
                "out" => {
                    out_qty += amount;
                    out_value += value;
                    if recipient.is_none() {
                        recipient = transfer.recipient.clone();
                    }
                }
                _ => {}
            }
        }

        let net = in_qty - out_qty;
        if net.abs() <= f64::EPSILON {
            continue;
        }

        let mut total_value = in_value + out_value;
        if operation_type == "trade" && in_value > 0.0 && out_value > 0.0 {
            let ratio = in_value.min(out_value) / in_value.max(out_value);
            if ratio >= SWAP_RATIO_THRESHOLD {
                total_value /= 2.0;
            }
        }

        let quantity = net.abs();
        let price_per_token = if total_value > 0.0 {
            total_value / quantity
        } else {
            0.0
        };

        let (direction, action_type, counterparty) = if net > 0.0 {
            let action = if total_value > 0.0 {
                ActionType::Buy
            } else if sender.is_some() && operation_type != "airdrop" && operation_type != "mint" {
                ActionType::TransferIn
            } else {
                ActionType::Airdrop
            };
            (Direction::In, action, sender)
        } else {
            let action = if total_value > 0.0 {
                ActionType::Sell
            } else {
                ActionType::TransferOut
            };
            (Direction::Out, action, recipient)
        };

        rows.push(TransferRow {
            wallet_address: wallet.to_string(),
            transaction_hash: hash.to_string(),
            symbol: token.symbol.clone(),
            contract_address: token.contract_address.clone(),
            fungible_id: token.fungible_id.clone(),
            direction,
            action_type,
            quantity,
            price_per_token,
            inherited_price_per_token: None,
            is_inherited_from_wallet: None,
            counterparty_address: counterparty,
            timestamp: mined_at.to_string(),
            block_number: attrs.mined_at_block.unwrap_or(0),
        });
    }

    rows
}

/// Pull the complete transfer history of one (wallet, token). Pages are
/// deduplicated by transaction hash; a page of known hashes or a missing
/// cursor ends the walk, `max_pages` bounds it.
pub async fn fetch_full_history<P: TransfersPager + Sync>(
    pager: &P,
    wallet: &str,
    token: &TokenRef,
    max_pages: u32,
) -> Result<Vec<TransferRow>> {
    let mut seen_hashes = std::collections::HashSet::new();
    let mut raw: Vec<ApiTransaction> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0_u32;

    loop {
        if pages >= max_pages {
            tracing::warn!(
                wallet,
                token = %token.symbol,
                max_pages,
                "history pagination hit the page cap; truncating"
            );
            break;
        }
        let (txs, next) = pager
            .fetch_transfers_page(wallet, &token.fungible_id, cursor.as_deref())
            .await
            .with_context(|| format!("history fetch failed for {wallet}/{}", token.symbol))?;
        pages += 1;

        if txs.is_empty() {
            break;
        }

        let mut fresh = 0_u32;
        for tx in txs {
            let Some(hash) = tx.attributes.hash.clone() else {
                continue;
            };
            if seen_hashes.insert(hash) {
                raw.push(tx);
                fresh += 1;
            }
        }

        // A page of nothing but known hashes means the provider looped.
        if fresh == 0 {
            break;
        }

        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }

    tracing::debug!(
        wallet,
        token = %token.symbol,
        pages,
        transactions = raw.len(),
        "history fetched"
    );
    Ok(normalize_transactions(wallet, token, &raw))
}

fn insert_rows_tx(tx: &rusqlite::Transaction<'_>, rows: &[TransferRow]) -> rusqlite::Result<u64> {
    let mut inserted = 0_u64;
    for r in rows {
        let changed = tx.execute(
            "INSERT OR IGNORE INTO transfers (
                wallet_address, transaction_hash, symbol, contract_address, fungible_id,
                direction, action_type, quantity, price_per_token,
                inherited_price_per_token, is_inherited_from_wallet,
                counterparty_address, timestamp, block_number
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            rusqlite::params![
                r.wallet_address,
                r.transaction_hash,
                r.symbol,
                r.contract_address,
                r.fungible_id,
                r.direction.as_str(),
                r.action_type.as_str(),
                r.quantity,
                r.price_per_token,
                r.inherited_price_per_token,
                r.is_inherited_from_wallet,
                r.counterparty_address,
                r.timestamp,
                r.block_number,
            ],
        )?;
        inserted += changed as u64;
    }
    Ok(inserted)
}

/// Insert new history rows, relying on the unique constraint for dedup.
pub async fn ingest_history(db: &AsyncDb, rows: Vec<TransferRow>) -> Result<u64> {
    if rows.is_empty() {
        return Ok(0);
    }
    db.call_named("ingestion.insert_history", move |conn| {
        let tx = conn.transaction()?;
        let inserted = insert_rows_tx(&tx, &rows)?;
        tx.commit()?;
        Ok(inserted)
    })
    .await
}

/// Drop and re-insert the history of one (wallet, token) atomically. Shifting
/// pagination boundaries cannot leave stale rows behind this way; the cost is
/// bounded by per-token volume.
pub async fn replace_history(
    db: &AsyncDb,
    wallet: &str,
    fungible_id: &str,
    rows: Vec<TransferRow>,
) -> Result<u64> {
    let wallet = wallet.to_string();
    let fungible_id = fungible_id.to_string();
    db.call_named("ingestion.replace_history", move |conn| {
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM transfers WHERE wallet_address = ?1 AND fungible_id = ?2",
            rusqlite::params![wallet, fungible_id],
        )?;
        let inserted = insert_rows_tx(&tx, &rows)?;
        tx.commit()?;
        Ok(inserted)
    })
    .await
}
