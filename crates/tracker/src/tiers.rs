use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;

use crate::scoring::{TradeRow, WIN_ROI_PCT};

#[derive(Debug, Clone, PartialEq)]
pub struct TierStats {
    pub tier_usd: u32,
    pub roi_percentage: f64,
    /// Percent.
    pub win_rate: f64,
    pub n_trades: u32,
    pub n_winners: u32,
    pub n_losers: u32,
    pub n_neutral: u32,
    pub total_invested: f64,
}

/// Performance over the subset of trades at or above each investment tier.
/// Empty tiers come back zeroed; they stay in the table but are never optimal.
pub fn compute_tiers(trades: &[TradeRow], grid: &[u32]) -> Vec<TierStats> {
    grid.iter()
        .map(|&tier| {
            let subset: Vec<&TradeRow> =
                trades.iter().filter(|t| t.0 >= f64::from(tier)).collect();
            if subset.is_empty() {
                return TierStats {
                    tier_usd: tier,
                    roi_percentage: 0.0,
                    win_rate: 0.0,
                    n_trades: 0,
                    n_winners: 0,
                    n_losers: 0,
                    n_neutral: 0,
                    total_invested: 0.0,
                };
            }

            let n_trades = subset.len() as u32;
            let total_invested: f64 = subset.iter().map(|t| t.0).sum();
            let roi_percentage = if total_invested > 0.0 {
                subset.iter().map(|t| t.0 * t.1).sum::<f64>() / total_invested
            } else {
                0.0
            };
            let n_winners = subset.iter().filter(|t| t.1 >= WIN_ROI_PCT).count() as u32;
            let n_losers = subset.iter().filter(|t| t.1 < 0.0).count() as u32;
            let n_neutral = n_trades - n_winners - n_losers;

            TierStats {
                tier_usd: tier,
                roi_percentage,
                win_rate: f64::from(n_winners) / f64::from(n_trades) * 100.0,
                n_trades,
                n_winners,
                n_losers,
                n_neutral,
                total_invested,
            }
        })
        .collect()
}

/// Recompute tier rows for every qualified wallet.
pub async fn run_tier_analysis_once(db: &AsyncDb, cfg: &Config) -> Result<u64> {
    let trades = crate::scoring::load_scorable_trades(db, &cfg.scoring.excluded_tokens).await?;
    let qualified: Vec<String> = db
        .call_named("tiers.list_qualified", |conn| {
            let mut stmt = conn
                .prepare("SELECT wallet_address FROM qualified_wallets ORDER BY score DESC")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            rows.collect()
        })
        .await?;

    let by_wallet: std::collections::HashMap<String, Vec<TradeRow>> = trades.into_iter().collect();
    let grid = cfg.tiers.grid.clone();

    let mut wallets_done = 0_u64;
    for wallet in qualified {
        let Some(rows) = by_wallet.get(&wallet) else {
            continue;
        };
        let stats = compute_tiers(rows, &grid);
        let wallet_c = wallet.clone();
        db.call_named("tiers.upsert", move |conn| {
            let tx = conn.transaction()?;
            for s in &stats {
                tx.execute(
                    "INSERT INTO tier_performance (
                        wallet_address, tier_usd, roi_percentage, win_rate,
                        n_trades, n_winners, n_losers, n_neutral, total_invested, is_optimal_tier
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0)
                    ON CONFLICT(wallet_address, tier_usd) DO UPDATE SET
                        roi_percentage = excluded.roi_percentage,
                        win_rate = excluded.win_rate,
                        n_trades = excluded.n_trades,
                        n_winners = excluded.n_winners,
                        n_losers = excluded.n_losers,
                        n_neutral = excluded.n_neutral,
                        total_invested = excluded.total_invested,
                        is_optimal_tier = 0",
                    rusqlite::params![
                        wallet_c,
                        s.tier_usd,
                        s.roi_percentage,
                        s.win_rate,
                        s.n_trades,
                        s.n_winners,
                        s.n_losers,
                        s.n_neutral,
                        s.total_invested,
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await?;
        wallets_done += 1;
    }

    tracing::info!(wallets = wallets_done, "tier analysis done");
    Ok(wallets_done)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tiers_filter_by_invested() {
        let trades: Vec<TradeRow> = vec![
            (3500.0, 100.0),
            (5000.0, -10.0),
            (9000.0, 200.0),
            (1000.0, 500.0), // below every tier in the grid
        ];
        let grid = vec![3000, 6000, 9000, 12000];
        let stats = compute_tiers(&trades, &grid);

        assert_eq!(stats.len(), 4);
        assert_eq!(stats[0].n_trades, 3);
        assert_eq!(stats[1].n_trades, 1); // only the 9k trade
        assert_eq!(stats[2].n_trades, 1);
        assert_eq!(stats[3].n_trades, 0);
        assert_eq!(stats[3].total_invested, 0.0);
    }

    #[test]
    fn test_tier_weighted_roi_and_counts() {
        let trades: Vec<TradeRow> = vec![(4000.0, 100.0), (6000.0, -50.0), (10000.0, 40.0)];
        let stats = compute_tiers(&trades, &[3000]);
        let t = &stats[0];
        assert_eq!(t.n_trades, 3);
        assert_eq!(t.n_winners, 1);
        assert_eq!(t.n_losers, 1);
        assert_eq!(t.n_neutral, 1);
        let expected = (4000.0 * 100.0 + 6000.0 * -50.0 + 10000.0 * 40.0) / 20000.0;
        assert!((t.roi_percentage - expected).abs() < 1e-9);
        assert!((t.win_rate - 100.0 / 3.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_run_tier_analysis_upserts_full_grid() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let config =
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap();

        db.call(|conn| {
            conn.execute(
                "INSERT INTO qualified_wallets (wallet_address, score, classification, weighted_roi,
                     win_rate, trade_count, total_invested, winners, losers, neutral,
                     roi_score, activity_score, success_score)
                 VALUES ('0xw', 50.0, 'BON', 120.0, 60.0, 5, 20000.0, 3, 1, 1, 15.0, 50.0, 60.0)",
                [],
            )?;
            for (i, invested) in [4000.0, 5500.0, 9000.0].iter().enumerate() {
                conn.execute(
                    "INSERT INTO token_analytics (wallet_address, fungible_id, symbol, total_invested, roi_percentage)
                     VALUES ('0xw', 'tok-' || ?1, 'T' || ?1, ?2, 150.0)",
                    rusqlite::params![i as i64, invested],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(run_tier_analysis_once(&db, &config).await.unwrap(), 1);

        let rows: i64 = db
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM tier_performance WHERE wallet_address = '0xw'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(rows, 10); // one row per grid tier, empty ones included

        // Re-run keeps the row count stable.
        run_tier_analysis_once(&db, &config).await.unwrap();
        let rows2: i64 = db
            .call(|conn| {
                conn.query_row("SELECT COUNT(*) FROM tier_performance", [], |row| row.get(0))
            })
            .await
            .unwrap();
        assert_eq!(rows2, 10);
    }
}
