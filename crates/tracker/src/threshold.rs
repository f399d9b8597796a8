use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::types::{DiscoveryPeriod, ThresholdStatus};

/// Sigmoid steepness and midpoint for the quality score. The midpoint sits
/// between a floor-reliability wallet (J ≈ 0.13) and a saturated one (J ≈ 1),
/// so quality spreads usefully across the 0.1/0.3/0.5/0.7/0.9 status bands.
const QUALITY_SLOPE: f64 = 6.0;
const QUALITY_MIDPOINT: f64 = 0.45;
/// Trade-count term saturates around 50 trades.
const TRADES_LOG_SCALE: f64 = 50.0;

#[derive(Debug, Clone, PartialEq)]
pub struct TierInput {
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

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub optimal_tier: u32,
    pub plateau: Vec<u32>,
    pub quality: f64,
    pub status: ThresholdStatus,
    pub j_scores: Vec<(u32, f64)>,
    pub j_max: f64,
    pub j_avg: f64,
}

/// Tiers trustworthy enough to pick a threshold from.
pub fn reliable_tiers(tiers: &[TierInput], cfg: &common::config::Threshold) -> Vec<TierInput> {
    tiers
        .iter()
        .filter(|t| {
            t.n_trades >= cfg.min_trades && t.win_rate >= cfg.min_winrate && t.roi_percentage > 0.0
        })
        .cloned()
        .collect()
}

pub fn j_score(t: &TierInput, roi_cap: f64) -> f64 {
    let roi_norm = (t.roi_percentage / roi_cap).min(1.0);
    let win_rate = t.win_rate / 100.0;
    let trades_term = (1.0 + f64::from(t.n_trades)).ln() / (1.0 + TRADES_LOG_SCALE).ln();
    0.6 * roi_norm + 0.4 * win_rate + 0.1 * trades_term
}

/// Nearest-rank percentile (1-based floor). `values` need not be sorted.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    assert!(!values.is_empty());
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let k = ((p / 100.0 * sorted.len() as f64).floor() as usize).max(1);
    sorted[k.min(sorted.len()) - 1]
}

/// The stable plateau over (tier, J) pairs: tiers whose J clears the 60th
/// percentile and sits within 10% of the maximum, walked down from the
/// largest such tier while that holds. The optimal threshold is the smallest
/// tier of the walk (the largest sustainable bet).
pub fn select_plateau(js: &[(u32, f64)]) -> Option<(u32, Vec<u32>)> {
    if js.is_empty() {
        return None;
    }
    let mut sorted = js.to_vec();
    sorted.sort_by_key(|(tier, _)| *tier);

    let values: Vec<f64> = sorted.iter().map(|(_, j)| *j).collect();
    let p60 = percentile(&values, 60.0);
    let j_max = values.iter().fold(f64::MIN, |a, &b| a.max(b));
    let qualifies = |j: f64| j >= p60 && j >= 0.9 * j_max;

    let top = sorted.iter().rposition(|&(_, j)| qualifies(j))?;
    let mut low = top;
    while low > 0 && qualifies(sorted[low - 1].1) {
        low -= 1;
    }

    let plateau: Vec<u32> = sorted[low..=top].iter().map(|(tier, _)| *tier).collect();
    Some((sorted[low].0, plateau))
}

fn sigmoid(x: f64) -> f64 {
    1.0 / (1.0 + (-x).exp())
}

/// Full selection over a wallet's reliable tiers. `None` when the set is
/// empty (NO_RELIABLE_TIERS, not a smart wallet).
pub fn select_threshold(reliable: &[TierInput], cfg: &common::config::Threshold) -> Option<Selection> {
    if reliable.is_empty() {
        return None;
    }

    let js: Vec<(u32, f64)> = reliable
        .iter()
        .map(|t| (t.tier_usd, j_score(t, cfg.roi_cap)))
        .collect();

    let (optimal_tier, plateau) = select_plateau(&js)?;

    let plateau_js: Vec<f64> = js
        .iter()
        .filter(|(tier, _)| plateau.contains(tier))
        .map(|(_, j)| *j)
        .collect();
    let mean_j = plateau_js.iter().sum::<f64>() / plateau_js.len() as f64;
    let quality = sigmoid(QUALITY_SLOPE * (mean_j - QUALITY_MIDPOINT)).clamp(0.0, 1.0);

    let j_values: Vec<f64> = js.iter().map(|(_, j)| *j).collect();
    let j_max = j_values.iter().fold(f64::MIN, |a, &b| a.max(b));
    let j_avg = j_values.iter().sum::<f64>() / j_values.len() as f64;

    Some(Selection {
        optimal_tier,
        plateau,
        quality,
        status: ThresholdStatus::from_quality(quality),
        j_scores: js,
        j_max,
        j_avg,
    })
}

/// Elect smart wallets from the qualified set and rewrite `smart_wallets`.
pub async fn run_threshold_selection_once(db: &AsyncDb, cfg: &Config) -> Result<u64> {
    struct Candidate {
        wallet: String,
        period: Option<String>,
        tiers: Vec<TierInput>,
    }

    let candidates: Vec<Candidate> = db
        .call_named("threshold.load_candidates", |conn| {
            let mut stmt = conn.prepare(
                "SELECT q.wallet_address, w.period,
                        tp.tier_usd, tp.roi_percentage, tp.win_rate, tp.n_trades,
                        tp.n_winners, tp.n_losers, tp.n_neutral, tp.total_invested
                 FROM qualified_wallets q
                 LEFT JOIN wallets w ON w.wallet_address = q.wallet_address
                 JOIN tier_performance tp ON tp.wallet_address = q.wallet_address
                 ORDER BY q.wallet_address, tp.tier_usd",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, Option<String>>(1)?,
                    TierInput {
                        tier_usd: row.get::<_, i64>(2)? as u32,
                        roi_percentage: row.get(3)?,
                        win_rate: row.get(4)?,
                        n_trades: row.get::<_, i64>(5)? as u32,
                        n_winners: row.get::<_, i64>(6)? as u32,
                        n_losers: row.get::<_, i64>(7)? as u32,
                        n_neutral: row.get::<_, i64>(8)? as u32,
                        total_invested: row.get(9)?,
                    },
                ))
            })?;

            let mut out: Vec<Candidate> = Vec::new();
            for row in rows {
                let (wallet, period, tier) = row?;
                match out.last_mut() {
                    Some(c) if c.wallet == wallet => c.tiers.push(tier),
                    _ => out.push(Candidate {
                        wallet,
                        period,
                        tiers: vec![tier],
                    }),
                }
            }
            Ok(out)
        })
        .await?;

    struct Election {
        wallet: String,
        status: ThresholdStatus,
        sel: Selection,
        optimal: TierInput,
        global_roi: f64,
        global_win_rate: f64,
        global_trades: u32,
        reliable_count: u32,
    }

    let mut elected: Vec<Election> = Vec::new();
    let mut no_reliable = 0_u64;
    for c in candidates {
        let reliable = reliable_tiers(&c.tiers, &cfg.threshold);
        let Some(sel) = select_threshold(&reliable, &cfg.threshold) else {
            no_reliable += 1;
            tracing::debug!(wallet = %c.wallet, "no reliable tiers");
            continue;
        };
        if sel.status == ThresholdStatus::Neutral {
            continue;
        }

        // Elections of manually-seeded or migrated wallets keep their origin
        // visible in the status.
        let status = match c.period.as_deref().and_then(DiscoveryPeriod::parse) {
            Some(DiscoveryPeriod::Migration) => ThresholdStatus::Migration,
            Some(DiscoveryPeriod::Manual) => ThresholdStatus::Manual,
            _ => sel.status,
        };

        let optimal = reliable
            .iter()
            .find(|t| t.tier_usd == sel.optimal_tier)
            .cloned()
            .expect("optimal tier comes from the reliable set");

        let global_trades: u32 = reliable.iter().map(|t| t.n_trades).sum();
        let global_winners: u32 = reliable.iter().map(|t| t.n_winners).sum();
        let global_win_rate = if global_trades > 0 {
            f64::from(global_winners) / f64::from(global_trades) * 100.0
        } else {
            0.0
        };
        let global_roi =
            reliable.iter().map(|t| t.roi_percentage).sum::<f64>() / reliable.len() as f64;

        elected.push(Election {
            wallet: c.wallet,
            status,
            reliable_count: reliable.len() as u32,
            sel,
            optimal,
            global_roi,
            global_win_rate,
            global_trades,
        });
    }

    let inserted = elected.len() as u64;
    db.call_named("threshold.rewrite_smart_wallets", move |conn| {
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM smart_wallets", [])?;
        tx.execute("UPDATE tier_performance SET is_optimal_tier = 0", [])?;
        for e in &elected {
            tx.execute(
                "INSERT INTO smart_wallets (
                    wallet_address, optimal_threshold_tier, quality_score, threshold_status,
                    optimal_roi, optimal_win_rate, optimal_trades,
                    optimal_winners, optimal_losers, optimal_neutral,
                    global_roi, global_win_rate, global_trades,
                    j_score_max, j_score_avg, reliable_tiers_count, elected_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, datetime('now'))",
                rusqlite::params![
                    e.wallet,
                    e.sel.optimal_tier,
                    e.sel.quality,
                    e.status.as_str(),
                    e.optimal.roi_percentage,
                    e.optimal.win_rate,
                    e.optimal.n_trades,
                    e.optimal.n_winners,
                    e.optimal.n_losers,
                    e.optimal.n_neutral,
                    e.global_roi,
                    e.global_win_rate,
                    e.global_trades,
                    e.sel.j_max,
                    e.sel.j_avg,
                    e.reliable_count,
                ],
            )?;
            tx.execute(
                "UPDATE tier_performance SET is_optimal_tier = 1
                 WHERE wallet_address = ?1 AND tier_usd = ?2",
                rusqlite::params![e.wallet, e.sel.optimal_tier],
            )?;
        }
        tx.commit()?;
        Ok(())
    })
    .await?;

    metrics::gauge!("tracker_smart_wallets").set(inserted as f64);
    tracing::info!(elected = inserted, no_reliable, "threshold selection done");
    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> common::config::Threshold {
        common::config::Threshold {
            min_trades: 5,
            min_winrate: 20.0,
            roi_cap: 500.0,
        }
    }

    fn tier(tier_usd: u32, roi: f64, win_rate: f64, n: u32) -> TierInput {
        TierInput {
            tier_usd,
            roi_percentage: roi,
            win_rate,
            n_trades: n,
            n_winners: (f64::from(n) * win_rate / 100.0).round() as u32,
            n_losers: 0,
            n_neutral: 0,
            total_invested: f64::from(tier_usd) * f64::from(n),
        }
    }

    #[test]
    fn test_reliable_filter() {
        let tiers = vec![
            tier(3000, 150.0, 40.0, 8),  // reliable
            tier(4000, 150.0, 10.0, 8),  // win rate too low
            tier(5000, -5.0, 40.0, 8),   // roi not positive
            tier(6000, 150.0, 40.0, 4),  // too few trades
        ];
        let r = reliable_tiers(&tiers, &cfg());
        assert_eq!(r.len(), 1);
        assert_eq!(r[0].tier_usd, 3000);
    }

    #[test]
    fn test_plateau_scenario_walkdown() {
        // J profile rising to a stable band then collapsing:
        // plateau must be 4k..7k and the optimal threshold its smallest tier.
        let js = vec![
            (3000, 0.40),
            (4000, 0.55),
            (5000, 0.58),
            (6000, 0.60),
            (7000, 0.58),
            (8000, 0.32),
        ];
        let values: Vec<f64> = js.iter().map(|(_, j)| *j).collect();
        assert!((percentile(&values, 60.0) - 0.55).abs() < 1e-12);

        let (tau, plateau) = select_plateau(&js).unwrap();
        assert_eq!(tau, 4000);
        assert_eq!(plateau, vec![4000, 5000, 6000, 7000]);
    }

    #[test]
    fn test_quality_bands_for_plateau_scenario() {
        // Reconstruct the same mean plateau J via the quality path.
        let mean_j = (0.55 + 0.58 + 0.60 + 0.58) / 4.0;
        let q = sigmoid(QUALITY_SLOPE * (mean_j - QUALITY_MIDPOINT));
        let status = ThresholdStatus::from_quality(q);
        assert!(
            matches!(status, ThresholdStatus::Good | ThresholdStatus::Excellent),
            "got {status:?} for q={q}"
        );
    }

    #[test]
    fn test_single_tier_is_its_own_plateau() {
        let js = vec![(5000, 0.5)];
        let (tau, plateau) = select_plateau(&js).unwrap();
        assert_eq!(tau, 5000);
        assert_eq!(plateau, vec![5000]);
    }

    #[test]
    fn test_empty_reliable_set_is_none() {
        assert!(select_threshold(&[], &cfg()).is_none());
    }

    #[test]
    fn test_floor_wallet_quality_is_low() {
        // Barely-reliable wallet: tiny roi, 20% win rate, 5 trades.
        let t = tier(3000, 1.0, 20.0, 5);
        let sel = select_threshold(&[t], &cfg()).unwrap();
        assert!(sel.quality < 0.3, "quality was {}", sel.quality);
    }

    #[test]
    fn test_j_score_caps_roi() {
        let capped = j_score(&tier(3000, 5000.0, 50.0, 10), 500.0);
        let at_cap = j_score(&tier(3000, 500.0, 50.0, 10), 500.0);
        assert!((capped - at_cap).abs() < 1e-12);
    }

    async fn seed_candidate(db: &AsyncDb, wallet: &str, period: Option<&str>, tiers: &[TierInput]) {
        let wallet_s = wallet.to_string();
        let period_s = period.map(|p| p.to_string());
        let tiers = tiers.to_vec();
        db.call(move |conn| {
            if let Some(p) = &period_s {
                conn.execute(
                    "INSERT INTO wallets (wallet_address, period) VALUES (?1, ?2)",
                    rusqlite::params![wallet_s, p],
                )?;
            }
            conn.execute(
                "INSERT INTO qualified_wallets (wallet_address, score, classification, weighted_roi,
                     win_rate, trade_count, total_invested, winners, losers, neutral,
                     roi_score, activity_score, success_score)
                 VALUES (?1, 55.0, 'BON', 150.0, 50.0, 10, 50000.0, 5, 2, 3, 20.0, 70.0, 50.0)",
                [&wallet_s],
            )?;
            for t in &tiers {
                conn.execute(
                    "INSERT INTO tier_performance (wallet_address, tier_usd, roi_percentage, win_rate,
                         n_trades, n_winners, n_losers, n_neutral, total_invested)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                    rusqlite::params![
                        wallet_s,
                        t.tier_usd,
                        t.roi_percentage,
                        t.win_rate,
                        t.n_trades,
                        t.n_winners,
                        t.n_losers,
                        t.n_neutral,
                        t.total_invested
                    ],
                )?;
            }
            Ok(())
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_election_writes_smart_wallet_and_optimal_flag() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let config =
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap();

        let tiers = vec![
            tier(3000, 300.0, 60.0, 20),
            tier(4000, 320.0, 62.0, 15),
            tier(5000, 310.0, 58.0, 10),
        ];
        seed_candidate(&db, "0xstrong", None, &tiers).await;
        // A wallet with nothing reliable must not be elected.
        seed_candidate(&db, "0xflat", None, &[tier(3000, -10.0, 10.0, 2)]).await;

        let n = run_threshold_selection_once(&db, &config).await.unwrap();
        assert_eq!(n, 1);

        let (wallet, tier_usd, status): (String, i64, String) = db
            .call(|conn| {
                conn.query_row(
                    "SELECT wallet_address, optimal_threshold_tier, threshold_status FROM smart_wallets",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
            })
            .await
            .unwrap();
        assert_eq!(wallet, "0xstrong");
        assert!(tier_usd >= 3000);
        assert_ne!(status, "NEUTRAL");

        let flagged: i64 = db
            .call(|conn| {
                conn.query_row(
                    "SELECT COUNT(*) FROM tier_performance WHERE is_optimal_tier = 1",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(flagged, 1);
    }

    #[tokio::test]
    async fn test_migrated_wallet_election_tagged_migration() {
        let db = AsyncDb::open(":memory:").await.unwrap();
        let config =
            common::config::Config::from_str(include_str!("../../../config/default.toml")).unwrap();

        let tiers = vec![tier(3000, 300.0, 60.0, 20), tier(4000, 310.0, 61.0, 12)];
        seed_candidate(&db, "0xchild", Some("migration"), &tiers).await;

        run_threshold_selection_once(&db, &config).await.unwrap();
        let status: String = db
            .call(|conn| {
                conn.query_row(
                    "SELECT threshold_status FROM smart_wallets WHERE wallet_address = '0xchild'",
                    [],
                    |row| row.get(0),
                )
            })
            .await
            .unwrap();
        assert_eq!(status, "MIGRATION");
    }
}
