use anyhow::Result;
use chrono::{Duration, Utc};
use common::config::Config;
use common::db::AsyncDb;
use common::prices::PriceSource;
use common::types::{ChangeType, TokenBalance};
use std::collections::HashMap;
use std::sync::Arc;

use crate::fifo;
use crate::ingestion::{self, TokenRef, TransfersPager};
use crate::migration;
use crate::providers::{iso, BalancesFetcher, ContractChecker, SendsFetcher};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingOptions {
    pub balance_only: bool,
    pub transactions_only: bool,
    pub min_usd: Option<f64>,
    pub hours_lookback: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TrackingSummary {
    pub wallets: u64,
    pub changes: u64,
    pub rebuilt_tokens: u64,
    pub migrations: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrevPosition {
    pub symbol: String,
    pub contract_address: Option<String>,
    pub amount: f64,
    pub usd_value: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionDiff {
    pub change_type: ChangeType,
    pub fungible_id: String,
    pub symbol: String,
    pub contract_address: Option<String>,
    pub old_amount: f64,
    pub new_amount: f64,
    pub old_usd_value: f64,
    pub new_usd_value: f64,
}

/// Classify per-token movements between the stored portfolio and the freshly
/// fetched one. `delta_rel` is the relative amount change (fraction) below
/// which a move is ignored as noise.
pub fn diff_positions(
    previous: &HashMap<String, PrevPosition>,
    current: &[TokenBalance],
    delta_rel: f64,
) -> Vec<PositionDiff> {
    let mut diffs = Vec::new();
    let current_ids: std::collections::HashSet<&str> =
        current.iter().map(|b| b.fungible_id.as_str()).collect();

    for bal in current {
        match previous.get(&bal.fungible_id) {
            None => diffs.push(PositionDiff {
                change_type: ChangeType::New,
                fungible_id: bal.fungible_id.clone(),
                symbol: bal.symbol.clone(),
                contract_address: bal.contract_address.clone(),
                old_amount: 0.0,
                new_amount: bal.amount,
                old_usd_value: 0.0,
                new_usd_value: bal.usd_value,
            }),
            Some(prev) => {
                if prev.amount <= 0.0 {
                    continue;
                }
                let rel = (bal.amount - prev.amount) / prev.amount;
                if rel.abs() <= delta_rel {
                    continue;
                }
                let change_type = if rel > 0.0 {
                    ChangeType::Accumulation
                } else if bal.amount > prev.amount * 1e-6 {
                    ChangeType::Reduction
                } else {
                    ChangeType::Exit
                };
                diffs.push(PositionDiff {
                    change_type,
                    fungible_id: bal.fungible_id.clone(),
                    symbol: bal.symbol.clone(),
                    contract_address: bal.contract_address.clone(),
                    old_amount: prev.amount,
                    new_amount: bal.amount,
                    old_usd_value: prev.usd_value,
                    new_usd_value: bal.usd_value,
                });
            }
        }
    }

    for (fungible_id, prev) in previous {
        if !current_ids.contains(fungible_id.as_str()) {
            diffs.push(PositionDiff {
                change_type: ChangeType::Exit,
                fungible_id: fungible_id.clone(),
                symbol: prev.symbol.clone(),
                contract_address: prev.contract_address.clone(),
                old_amount: prev.amount,
                new_amount: 0.0,
                old_usd_value: prev.usd_value,
                new_usd_value: 0.0,
            });
        }
    }

    diffs
}

async fn load_previous_positions(
    db: &AsyncDb,
    wallet: &str,
) -> Result<HashMap<String, PrevPosition>> {
    let wallet = wallet.to_string();
    db.call_named("tracking.load_positions", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT fungible_id, symbol, contract_address, current_amount, current_usd_value
             FROM token_positions
             WHERE wallet_address = ?1 AND in_portfolio = 1",
        )?;
        let rows = stmt.query_map([&wallet], |row| {
            Ok((
                row.get::<_, String>(0)?,
                PrevPosition {
                    symbol: row.get(1)?,
                    contract_address: row.get(2)?,
                    amount: row.get(3)?,
                    usd_value: row.get(4)?,
                },
            ))
        })?;
        rows.collect()
    })
    .await
}

/// One transactional unit: log the diffs, refresh the position rows, update
/// the wallet's portfolio value.
async fn apply_wallet_update(
    db: &AsyncDb,
    wallet: &str,
    balances: Vec<TokenBalance>,
    diffs: Vec<PositionDiff>,
) -> Result<()> {
    let wallet = wallet.to_string();
    let now = iso(Utc::now());
    db.call_named("tracking.apply_update", move |conn| {
        let tx = conn.transaction()?;

        for d in &diffs {
            tx.execute(
                "INSERT INTO position_changes (
                    wallet_address, symbol, contract_address, fungible_id, change_type,
                    old_amount, new_amount, old_usd_value, new_usd_value, detected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                rusqlite::params![
                    wallet,
                    d.symbol,
                    d.contract_address,
                    d.fungible_id,
                    d.change_type.as_str(),
                    d.old_amount,
                    d.new_amount,
                    d.old_usd_value,
                    d.new_usd_value,
                    now,
                ],
            )?;
        }

        tx.execute(
            "UPDATE token_positions SET in_portfolio = 0, last_updated = ?2
             WHERE wallet_address = ?1 AND in_portfolio = 1",
            rusqlite::params![wallet, now],
        )?;
        for b in &balances {
            tx.execute(
                "INSERT INTO token_positions (
                    wallet_address, fungible_id, symbol, contract_address, chain,
                    current_amount, current_usd_value, current_price_per_token,
                    in_portfolio, last_updated
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9)
                ON CONFLICT(wallet_address, fungible_id) DO UPDATE SET
                    symbol = excluded.symbol,
                    contract_address = excluded.contract_address,
                    chain = excluded.chain,
                    current_amount = excluded.current_amount,
                    current_usd_value = excluded.current_usd_value,
                    current_price_per_token = excluded.current_price_per_token,
                    in_portfolio = 1,
                    last_updated = excluded.last_updated",
                rusqlite::params![
                    wallet,
                    b.fungible_id,
                    b.symbol,
                    b.contract_address,
                    b.chain,
                    b.amount,
                    b.usd_value,
                    b.price_per_token(),
                    now,
                ],
            )?;
        }

        let total: f64 = balances.iter().map(|b| b.usd_value).sum();
        let changed = tx.execute(
            "UPDATE wallets SET total_portfolio_value = ?2, token_count = ?3,
                 last_sync = ?4, updated_at = ?4
             WHERE wallet_address = ?1",
            rusqlite::params![wallet, total, balances.len() as i64, now],
        )?;
        if changed == 0 {
            tx.execute(
                "INSERT INTO wallets (wallet_address, total_portfolio_value, token_count,
                     last_sync, is_active)
                 VALUES (?1, ?2, ?3, ?4, 1)",
                rusqlite::params![wallet, total, balances.len() as i64, now],
            )?;
        }

        tx.commit()?;
        Ok(())
    })
    .await
}

/// Tokens touched recently and still worth enough to justify a full history
/// replace, from the position-change log.
async fn tokens_to_rebuild(
    db: &AsyncDb,
    wallet: &str,
    min_usd: f64,
    hours_lookback: i64,
) -> Result<Vec<TokenRef>> {
    let wallet = wallet.to_string();
    let cutoff = iso(Utc::now() - Duration::hours(hours_lookback));
    db.call_named("tracking.tokens_to_rebuild", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT fungible_id, symbol, contract_address
             FROM position_changes
             WHERE wallet_address = ?1 AND detected_at >= ?2 AND new_usd_value >= ?3
               AND fungible_id != ''",
        )?;
        let rows = stmt.query_map(
            rusqlite::params![wallet, cutoff, min_usd],
            |row| {
                Ok(TokenRef {
                    fungible_id: row.get(0)?,
                    symbol: row.get(1)?,
                    contract_address: row.get(2)?,
                })
            },
        )?;
        rows.collect()
    })
    .await
}

struct WalletOutcome {
    changes: u64,
    rebuilt: u64,
    migrated: bool,
}

async fn track_one_wallet<P, M>(
    db: &AsyncDb,
    provider: &P,
    prices: &M,
    cfg: &Config,
    opts: &TrackingOptions,
    wallet: &str,
) -> Result<WalletOutcome>
where
    P: BalancesFetcher + TransfersPager + SendsFetcher + ContractChecker + Sync,
    M: PriceSource + Sync,
{
    let mut outcome = WalletOutcome {
        changes: 0,
        rebuilt: 0,
        migrated: false,
    };

    let mut portfolio_value: Option<f64> = None;

    if !opts.transactions_only {
        let balances = provider.fetch_balances(wallet).await?;
        let previous = load_previous_positions(db, wallet).await?;
        let diffs = diff_positions(&previous, &balances, cfg.tracking.delta_rel_pct / 100.0);
        outcome.changes = diffs.len() as u64;
        portfolio_value = Some(balances.iter().map(|b| b.usd_value).sum());

        if !diffs.is_empty() {
            tracing::info!(
                wallet,
                new = diffs.iter().filter(|d| d.change_type == ChangeType::New).count(),
                accumulation = diffs.iter().filter(|d| d.change_type == ChangeType::Accumulation).count(),
                reduction = diffs.iter().filter(|d| d.change_type == ChangeType::Reduction).count(),
                exit = diffs.iter().filter(|d| d.change_type == ChangeType::Exit).count(),
                "position changes"
            );
            metrics::counter!("tracker_position_changes_total").increment(diffs.len() as u64);
        }
        apply_wallet_update(db, wallet, balances, diffs).await?;
    }

    if opts.balance_only {
        return Ok(outcome);
    }

    let min_usd = opts.min_usd.unwrap_or(cfg.tracking.min_token_value_usd);
    let hours_lookback = opts.hours_lookback.unwrap_or(cfg.tracking.hours_lookback);

    for token in tokens_to_rebuild(db, wallet, min_usd, hours_lookback).await? {
        let rows =
            ingestion::fetch_full_history(provider, wallet, &token, cfg.provider.max_pages).await?;
        ingestion::replace_history(db, wallet, &token.fungible_id, rows).await?;
        fifo::rebuild_token(db, prices, wallet, &token.fungible_id).await?;
        metrics::counter!("tracker_histories_replaced_total").increment(1);
        outcome.rebuilt += 1;
    }

    let portfolio_value = match portfolio_value {
        Some(v) => v,
        None => {
            let wallet_s = wallet.to_string();
            db.call_named("tracking.read_portfolio_value", move |conn| {
                conn.query_row(
                    "SELECT total_portfolio_value FROM wallets WHERE wallet_address = ?1",
                    [&wallet_s],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap_or(0.0)
        }
    };

    outcome.migrated = migration::detect_for_wallet(db, provider, wallet, portfolio_value, cfg)
        .await?
        .is_some();

    Ok(outcome)
}

async fn list_smart_wallets(db: &AsyncDb) -> Result<Vec<String>> {
    db.call_named("tracking.list_smart_wallets", |conn| {
        let mut stmt = conn.prepare(
            "SELECT wallet_address FROM smart_wallets
             WHERE optimal_threshold_tier > 0
             ORDER BY quality_score DESC",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect()
    })
    .await
}

/// One live-tracking pass over the smart wallet set, bounded-parallel over
/// wallets. A failing wallet is logged and left in its prior state; the pass
/// itself keeps going.
pub async fn run_tracking_once<P, M>(
    db: &AsyncDb,
    provider: Arc<P>,
    prices: Arc<M>,
    cfg: Arc<Config>,
    opts: TrackingOptions,
) -> Result<TrackingSummary>
where
    P: BalancesFetcher + TransfersPager + SendsFetcher + ContractChecker + Send + Sync + 'static,
    M: PriceSource + Send + Sync + 'static,
{
    let wallets = list_smart_wallets(db).await?;
    let semaphore = Arc::new(tokio::sync::Semaphore::new(cfg.tracking.worker_pool));
    let mut set = tokio::task::JoinSet::new();

    for wallet in wallets {
        let db = db.clone();
        let provider = provider.clone();
        let prices = prices.clone();
        let cfg = cfg.clone();
        let semaphore = semaphore.clone();
        set.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let res = track_one_wallet(&db, provider.as_ref(), prices.as_ref(), &cfg, &opts, &wallet)
                .await;
            (wallet, res)
        });
    }

    let mut summary = TrackingSummary::default();
    while let Some(joined) = set.join_next().await {
        let Ok((wallet, res)) = joined else {
            summary.failures += 1;
            continue;
        };
        summary.wallets += 1;
        match res {
            Ok(outcome) => {
                summary.changes += outcome.changes;
                summary.rebuilt_tokens += outcome.rebuilt;
                summary.migrations += u64::from(outcome.migrated);
            }
            Err(e) => {
                summary.failures += 1;
                let kind = common::provider::classify_api_error(&e).as_str();
                tracing::error!(wallet, error = %e, kind, "wallet tracking failed");
            }
        }
    }

    metrics::gauge!("tracker_wallets_tracked").set(summary.wallets as f64);
    tracing::info!(
        wallets = summary.wallets,
        changes = summary.changes,
        rebuilt = summary.rebuilt_tokens,
        migrations = summary.migrations,
        failures = summary.failures,
        "tracking pass done"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::types::{
        ApiFungibleInfo, ApiQuantity, ApiTransaction, ApiTransactionAttributes, ApiTransfer,
    };

    fn prev(symbol: &str, amount: f64, usd: f64) -> PrevPosition {
        PrevPosition {
            symbol: symbol.to_string(),
            contract_address: Some(format!("0x{symbol}")),
            amount,
            usd_value: usd,
        }
    }

    fn bal(fid: &str, symbol: &str, amount: f64, usd: f64) -> TokenBalance {
        TokenBalance {
            symbol: symbol.to_string(),
            contract_address: Some(format!("0x{symbol}")),
            chain: "ethereum".to_string(),
            fungible_id: fid.to_string(),
            amount,
            usd_value: usd,
        }
    }

    #[test]
    fn test_diff_classifies_all_change_types() {
        let mut previous = HashMap::new();
        previous.insert("tok-a".to_string(), prev("AAA", 100.0, 1000.0));
        previous.insert("tok-b".to_string(), prev("BBB", 200.0, 2000.0));
        previous.insert("tok-c".to_string(), prev("CCC", 300.0, 3000.0));
        previous.insert("tok-d".to_string(), prev("DDD", 400.0, 4000.0));

        let current = vec![
            bal("tok-a", "AAA", 150.0, 1500.0), // +50% accumulation
            bal("tok-b", "BBB", 100.0, 1000.0), // -50% reduction
            bal("tok-c", "CCC", 303.0, 3030.0), // +1%: noise
            bal("tok-e", "EEE", 50.0, 800.0),   // new
        ];

        let diffs = diff_positions(&previous, &current, 0.05);
        let by_type = |t: ChangeType| diffs.iter().filter(|d| d.change_type == t).count();
        assert_eq!(by_type(ChangeType::Accumulation), 1);
        assert_eq!(by_type(ChangeType::Reduction), 1);
        assert_eq!(by_type(ChangeType::New), 1);
        assert_eq!(by_type(ChangeType::Exit), 1); // tok-d vanished
        assert_eq!(diffs.len(), 4);

        let acc = diffs
            .iter()
            .find(|d| d.change_type == ChangeType::Accumulation)
            .unwrap();
        assert_eq!(acc.old_amount, 100.0);
        assert_eq!(acc.new_amount, 150.0);
        assert_eq!(acc.old_usd_value, 1000.0);
        assert_eq!(acc.new_usd_value, 1500.0);
    }

    #[test]
    fn test_small_moves_are_noise() {
        let mut previous = HashMap::new();
        previous.insert("tok-a".to_string(), prev("AAA", 100.0, 1000.0));
        let current = vec![bal("tok-a", "AAA", 104.0, 1040.0)];
        assert!(diff_positions(&previous, &current, 0.05).is_empty());
    }

    struct FakeProvider {
        balances: Vec<TokenBalance>,
        history: Vec<ApiTransaction>,
    }

    impl BalancesFetcher for FakeProvider {
        async fn fetch_balances(&self, _wallet: &str) -> Result<Vec<TokenBalance>> {
            Ok(self.balances.clone())
        }
    }

    impl TransfersPager for FakeProvider {
        fn transfers_url(&self, _w: &str, _f: &str, _c: Option<&str>) -> String {
            "fake://".to_string()
        }

        async fn fetch_transfers_page(
            &self,
            _wallet: &str,
            _fungible_id: &str,
            cursor: Option<&str>,
        ) -> Result<(Vec<ApiTransaction>, Option<String>)> {
            if cursor.is_none() {
                Ok((self.history.clone(), None))
            } else {
                Ok((vec![], None))
            }
        }
    }

    impl SendsFetcher for FakeProvider {
        async fn fetch_recent_sends(
            &self,
            _wallet: &str,
            _since_hours: i64,
        ) -> Result<Vec<ApiTransaction>> {
            Ok(vec![])
        }
    }

    impl ContractChecker for FakeProvider {
        async fn is_contract(&self, _address: &str) -> Result<Option<bool>> {
            Ok(Some(false))
        }
    }

    struct NoPrices;

    impl PriceSource for NoPrices {
        async fn price(
            &self,
            _contract: Option<&str>,
            _symbol: &str,
        ) -> Result<Option<common::prices::SpotPrice>> {
            Ok(None)
        }

        async fn token_info(&self, _contract: &str) -> Result<Option<common::prices::TokenInfo>> {
            Ok(None)
        }

        fn is_stablecoin(&self, _symbol: &str) -> bool {
            false
        }
    }

    fn buy_tx(hash: &str, fid: &str, qty: f64, value: f64) -> ApiTransaction {
        ApiTransaction {
            id: Some(hash.to_string()),
            attributes: ApiTransactionAttributes {
                hash: Some(hash.to_string()),
                mined_at: Some(iso(Utc::now() - Duration::hours(2))),
                mined_at_block: Some(10),
                operation_type: Some("trade".to_string()),
                transfers: vec![ApiTransfer {
                    direction: Some("in".to_string()),
                    value: Some(value),
                    quantity: Some(ApiQuantity {
                        numeric: Some(qty.to_string()),
                    }),
                    fungible_info: ApiFungibleInfo {
                        id: Some(fid.to_string()),
                        symbol: Some("AAA".to_string()),
                        implementations: vec![],
                    },
                    sender: Some("0xpool".to_string()),
                    recipient: None,
                }],
            },
        }
    }

    async fn seed_smart_wallet(db: &AsyncDb, wallet: &str) {
        let wallet = wallet.to_string();
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO wallets (wallet_address, period, total_portfolio_value) VALUES (?1, '30d', 1000.0)",
                [&wallet],
            )?;
            conn.execute(
                "INSERT INTO smart_wallets (wallet_address, optimal_threshold_tier, quality_score, threshold_status)
                 VALUES (?1, 3000, 0.8, 'GOOD')",
                [&wallet],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_accumulation_triggers_rebuild() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let cfg = Arc::new(
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap(),
        );
        seed_smart_wallet(&db, "0xw").await;

        // Stored position: 100 AAA. Provider now reports 150, worth $1500.
        db.call(|conn| {
            conn.execute(
                "INSERT INTO token_positions (wallet_address, fungible_id, symbol, contract_address,
                     current_amount, current_usd_value, in_portfolio)
                 VALUES ('0xw', 'tok-a', 'AAA', '0xAAA', 100.0, 1000.0, 1)",
                [],
            )?;
            Ok(())
        })
        .await
        .unwrap();

        let provider = Arc::new(FakeProvider {
            balances: vec![bal("tok-a", "AAA", 150.0, 1500.0)],
            history: vec![
                buy_tx("0xh1", "tok-a", 100.0, 100.0),
                buy_tx("0xh2", "tok-a", 50.0, 75.0),
            ],
        });

        let summary = run_tracking_once(
            &db,
            provider,
            Arc::new(NoPrices),
            cfg,
            TrackingOptions::default(),
        )
        .await
        .unwrap();

        assert_eq!(summary.wallets, 1);
        assert_eq!(summary.changes, 1);
        assert_eq!(summary.rebuilt_tokens, 1);
        assert_eq!(summary.failures, 0);

        // S6: the change row records the before/after amounts.
        let (ctype, old_a, new_a): (String, f64, f64) = db
            .call(|conn| {
                conn.query_row(
                    "SELECT change_type, old_amount, new_amount FROM position_changes
                     WHERE wallet_address = '0xw' AND fungible_id = 'tok-a'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(ctype, "ACCUMULATION");
        assert_eq!(old_a, 100.0);
        assert_eq!(new_a, 150.0);

        // Position row refreshed in place.
        let (amount, in_portfolio): (f64, i64) = db
            .call(|conn| {
                conn.query_row(
                    "SELECT current_amount, in_portfolio FROM token_positions
                     WHERE wallet_address = '0xw' AND fungible_id = 'tok-a'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(amount, 150.0);
        assert_eq!(in_portfolio, 1);

        // History replaced and analytics recomputed for the affected token.
        let transfers: i64 = db
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM transfers WHERE wallet_address = '0xw'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(transfers, 2);

        let invested: f64 = db
            .call(|conn| {
                conn.query_row(
                    "SELECT total_invested FROM token_analytics
                     WHERE wallet_address = '0xw' AND fungible_id = 'tok-a'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert!((invested - 175.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_balance_only_skips_history() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let cfg = Arc::new(
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap(),
        );
        seed_smart_wallet(&db, "0xw").await;

        let provider = Arc::new(FakeProvider {
            balances: vec![bal("tok-a", "AAA", 100.0, 5000.0)],
            history: vec![buy_tx("0xh1", "tok-a", 100.0, 100.0)],
        });

        let summary = run_tracking_once(
            &db,
            provider,
            Arc::new(NoPrices),
            cfg,
            TrackingOptions {
                balance_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(summary.changes, 1); // NEW position logged
        assert_eq!(summary.rebuilt_tokens, 0);
        let transfers: i64 = db
            .call(|conn| conn.query_row("SELECT COUNT(*) FROM transfers", [], |row| row.get(0)))
            .await
            .unwrap();
        assert_eq!(transfers, 0);
    }

    #[tokio::test]
    async fn test_portfolio_value_updated_on_wallet_row() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let cfg = Arc::new(
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap(),
        );
        seed_smart_wallet(&db, "0xw").await;

        let provider = Arc::new(FakeProvider {
            balances: vec![
                bal("tok-a", "AAA", 10.0, 700.0),
                bal("tok-b", "BBB", 5.0, 300.0),
            ],
            history: vec![],
        });

        run_tracking_once(
            &db,
            provider,
            Arc::new(NoPrices),
            cfg,
            TrackingOptions {
                balance_only: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let (total, count): (f64, i64) = db
            .call(|conn| {
                conn.query_row(
                    "SELECT total_portfolio_value, token_count FROM wallets WHERE wallet_address = '0xw'",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(total, 1000.0);
        assert_eq!(count, 2);
    }
}
