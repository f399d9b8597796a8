use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::types::Classification;

/// A trade counts as a win at or above this ROI.
pub const WIN_ROI_PCT: f64 = 80.0;

/// One scored trade: (invested USD, ROI percent).
pub type TradeRow = (f64, f64);

#[derive(Debug, Clone, PartialEq)]
pub struct WalletScore {
    pub score: f64,
    pub classification: Classification,
    pub weighted_roi: f64,
    /// Percent.
    pub win_rate: f64,
    pub trade_count: u32,
    pub total_invested: f64,
    pub winners: u32,
    pub losers: u32,
    pub neutral: u32,
    pub roi_score: f64,
    pub activity_score: f64,
    pub success_score: f64,
}

fn clamp100(x: f64) -> f64 {
    x.clamp(0.0, 100.0)
}

/// Composite score over a wallet's trades. Returns `None` when any
/// qualification gate fails (weighted ROI, trade count, or score floor).
pub fn compute_wallet_score(trades: &[TradeRow], cfg: &common::config::Scoring) -> Option<WalletScore> {
    let trade_count = trades.len() as u32;
    if trade_count < cfg.min_trades {
        return None;
    }

    let total_invested: f64 = trades.iter().map(|t| t.0).sum();
    if total_invested <= 0.0 {
        return None;
    }
    let weighted_roi = trades.iter().map(|t| t.0 * t.1).sum::<f64>() / total_invested;
    if weighted_roi < cfg.min_weighted_roi {
        return None;
    }

    let winners = trades.iter().filter(|t| t.1 >= WIN_ROI_PCT).count() as u32;
    let losers = trades.iter().filter(|t| t.1 < 0.0).count() as u32;
    let neutral = trade_count - winners - losers;
    let win_rate = f64::from(winners) / f64::from(trade_count) * 100.0;

    // Monotone normalizations keeping every component in [0, 100]:
    // 50% weighted ROI maps to 0, 500% to 100; 20 trades saturate activity.
    let roi_score = clamp100((weighted_roi - 50.0) / 4.5);
    let activity_score = clamp100(f64::from(trade_count).ln() / 20.0_f64.ln() * 100.0);
    let success_score = win_rate;

    let score = 0.6 * roi_score + 0.3 * success_score + 0.1 * activity_score;
    if score < cfg.min_score {
        return None;
    }

    Some(WalletScore {
        score,
        classification: Classification::from_score(score),
        weighted_roi,
        win_rate,
        trade_count,
        total_invested,
        winners,
        losers,
        neutral,
        roi_score,
        activity_score,
        success_score,
    })
}

/// Trades per wallet from token analytics, with the excluded symbols
/// (stables and majors) filtered out.
pub async fn load_scorable_trades(
    db: &AsyncDb,
    excluded: &[String],
) -> Result<Vec<(String, Vec<TradeRow>)>> {
    let excluded: std::collections::HashSet<String> =
        excluded.iter().map(|s| s.to_uppercase()).collect();
    db.call_named("scoring.load_trades", move |conn| {
        let mut stmt = conn.prepare(
            "SELECT wallet_address, symbol, total_invested, roi_percentage
             FROM token_analytics
             ORDER BY wallet_address, total_invested DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
            ))
        })?;

        let mut grouped: Vec<(String, Vec<TradeRow>)> = Vec::new();
        for row in rows {
            let (wallet, symbol, invested, roi) = row?;
            if excluded.contains(&symbol.to_uppercase()) {
                continue;
            }
            match grouped.last_mut() {
                Some((w, trades)) if *w == wallet => trades.push((invested, roi)),
                _ => grouped.push((wallet, vec![(invested, roi)])),
            }
        }
        Ok(grouped)
    })
    .await
}

/// Score every wallet with analytics and rewrite the qualified set.
pub async fn run_scoring_once(db: &AsyncDb, cfg: &Config) -> Result<u64> {
    let wallets = load_scorable_trades(db, &cfg.scoring.excluded_tokens).await?;
    let candidates = wallets.len();

    let mut qualified: Vec<(String, WalletScore)> = Vec::new();
    for (wallet, trades) in wallets {
        if let Some(score) = compute_wallet_score(&trades, &cfg.scoring) {
            qualified.push((wallet, score));
        }
    }
    qualified.sort_by(|a, b| b.1.score.total_cmp(&a.1.score));

    let inserted = qualified.len() as u64;
    db.call_named("scoring.rewrite_qualified", move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM qualified_wallets", [])?;
        for (wallet, s) in &qualified {
            tx.execute(
                "INSERT INTO qualified_wallets (
                    wallet_address, score, classification, weighted_roi, win_rate,
                    trade_count, total_invested, winners, losers, neutral,
                    roi_score, activity_score, success_score, scored_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, datetime('now'))",
                rusqlite::params![
                    wallet,
                    s.score,
                    s.classification.as_str(),
                    s.weighted_roi,
                    s.win_rate,
                    s.trade_count,
                    s.total_invested,
                    s.winners,
                    s.losers,
                    s.neutral,
                    s.roi_score,
                    s.activity_score,
                    s.success_score,
                ],
            )?;
            tx.execute(
                "UPDATE wallets SET is_scored = 1, updated_at = datetime('now')
                 WHERE wallet_address = ?1",
                [wallet],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
    .await?;

    metrics::counter!("tracker_wallets_scored_total").increment(candidates as u64);
    tracing::info!(candidates, qualified = inserted, "wallet scoring done");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> common::config::Scoring {
        common::config::Scoring {
            min_score: 20.0,
            min_weighted_roi: 50.0,
            min_trades: 3,
            excluded_tokens: vec!["USDC".to_string(), "ETH".to_string()],
        }
    }

    #[test]
    fn test_gates_reject_low_roi_and_few_trades() {
        // Two trades: below the trade floor.
        assert!(compute_wallet_score(&[(1000.0, 200.0), (1000.0, 90.0)], &cfg()).is_none());
        // Weighted ROI below 50%.
        assert!(compute_wallet_score(
            &[(1000.0, 10.0), (1000.0, 20.0), (1000.0, 40.0)],
            &cfg()
        )
        .is_none());
    }

    #[test]
    fn test_strong_wallet_scores_high() {
        let trades: Vec<TradeRow> = (0..10).map(|_| (5000.0, 300.0)).collect();
        let s = compute_wallet_score(&trades, &cfg()).unwrap();
        assert!(s.score >= 60.0, "score was {}", s.score);
        assert_eq!(s.winners, 10);
        assert_eq!(s.win_rate, 100.0);
        assert!(matches!(
            s.classification,
            Classification::Elite | Classification::Excellent
        ));
    }

    #[test]
    fn test_score_monotone_in_roi() {
        let base: Vec<TradeRow> = vec![(1000.0, 120.0), (1000.0, 120.0), (1000.0, 120.0)];
        let better: Vec<TradeRow> = vec![(1000.0, 250.0), (1000.0, 250.0), (1000.0, 250.0)];
        let a = compute_wallet_score(&base, &cfg()).unwrap();
        let b = compute_wallet_score(&better, &cfg()).unwrap();
        assert!(b.score > a.score);
    }

    #[test]
    fn test_win_loss_neutral_split() {
        let trades: Vec<TradeRow> = vec![
            (2000.0, 150.0), // win
            (2000.0, 85.0),  // win
            (2000.0, 30.0),  // neutral
            (2000.0, -40.0), // loss
        ];
        let s = compute_wallet_score(&trades, &cfg()).unwrap();
        assert_eq!((s.winners, s.losers, s.neutral), (2, 1, 1));
        assert_eq!(s.win_rate, 50.0);
    }

    async fn seed_analytics(db: &AsyncDb, wallet: &str, symbol: &str, invested: f64, roi: f64) {
        let (wallet, symbol) = (wallet.to_string(), symbol.to_string());
        db.call(move |conn| {
            conn.execute(
                "INSERT INTO token_analytics (wallet_address, fungible_id, symbol, total_invested, roi_percentage)
                 VALUES (?1, ?2 || '-' || ?1, ?2, ?3, ?4)",
                rusqlite::params![wallet, symbol, invested, roi],
            )?;
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_run_scoring_rewrites_qualified_table() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let config = common::config::Config::from_str(include_str!(
            "../../../config/default.toml"
        ))
        .unwrap();

        // Strong wallet with an excluded stable position that must not count.
        for (sym, roi) in [("AAA", 300.0), ("BBB", 120.0), ("CCC", 90.0), ("USDC", 0.0)] {
            seed_analytics(&db, "0xgood", sym, 4000.0, roi).await;
        }
        // Weak wallet: negative weighted ROI.
        for (sym, roi) in [("AAA", -50.0), ("BBB", -20.0), ("CCC", 10.0)] {
            seed_analytics(&db, "0xbad", sym, 4000.0, roi).await;
        }

        let n = run_scoring_once(&db, &config).await.unwrap();
        assert_eq!(n, 1);

        let (wallet, trade_count): (String, i64) = db
            .call(|conn| {
                conn.query_row(
                    "SELECT wallet_address, trade_count FROM qualified_wallets",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(wallet, "0xgood");
        assert_eq!(trade_count, 3); // USDC excluded
    }
}
