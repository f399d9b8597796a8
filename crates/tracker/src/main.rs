use anyhow::Result;
use common::config::Config;
use common::db::AsyncDb;
use common::prices::MarketDataClient;
use common::provider::ZerionClient;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

mod cli;
mod consensus;
mod discovery;
mod fifo;
mod ingestion;
mod metrics;
mod migration;
mod notify;
mod providers;
mod scheduler;
mod scoring;
mod threshold;
mod tiers;
mod tracking;

use notify::{NoopNotifier, TelegramNotifier};

#[tokio::main]
async fn main() -> ExitCode {
    let cmd = match cli::parse_args(std::env::args()) {
        Ok(c) => c,
        Err(msg) => {
            eprintln!("{msg}");
            return ExitCode::from(2);
        }
    };

    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let (dispatch, _otel_guard) =
        common::observability::build_dispatch("wallet_tracker", &config.general);
    if tracing::dispatcher::set_global_default(dispatch).is_err() {
        eprintln!("tracing dispatcher already installed");
        return ExitCode::from(2);
    }

    if let Some(parent) = std::path::Path::new(&config.database.path).parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!("cannot create database directory: {e}");
            return ExitCode::from(2);
        }
    }

    match run(cmd, config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            ExitCode::FAILURE
        }
    }
}

/// Provider credentials come from the environment, never from the TOML:
/// ZERION_API_KEYS (comma-separated) or ZERION_API_KEY / ZERION_API_KEY_2.
fn provider_keys() -> Vec<String> {
    if let Ok(raw) = std::env::var("ZERION_API_KEYS") {
        return raw
            .split(',')
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .collect();
    }
    ["ZERION_API_KEY", "ZERION_API_KEY_2"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .filter(|k| !k.is_empty())
        .collect()
}

fn build_provider(cfg: &Config) -> Result<ZerionClient> {
    ZerionClient::new_with_settings(
        &cfg.provider.api_url,
        &cfg.provider.contract_api_url,
        provider_keys(),
        Duration::from_secs(cfg.provider.timeout_secs),
        Duration::from_millis(cfg.provider.key_min_interval_ms),
        cfg.provider.page_size,
        cfg.provider.max_retries,
        Duration::from_millis(cfg.provider.backoff_base_ms),
    )
}

fn build_prices(cfg: &Config) -> Result<MarketDataClient> {
    MarketDataClient::new(
        &cfg.prices.primary_url,
        &cfg.prices.fallback_url,
        &cfg.prices.stablecoins,
        cfg.prices.max_price_usd,
    )
}

async fn run(cmd: cli::Command, config: Config) -> Result<ExitCode> {
    // Migrate synchronously before any job touches the file; AsyncDb re-runs
    // the same idempotent batch on open.
    common::db::Database::open(&config.database.path)?.run_migrations()?;
    let db = AsyncDb::open(&config.database.path).await?;

    match cmd {
        cli::Command::Discovery => {
            let provider = match build_provider(&config) {
                Ok(p) => p,
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    return Ok(ExitCode::from(2));
                }
            };
            let prices = build_prices(&config)?;
            let seeds = discovery::JsonSeedFile::new(&config.discovery.seed_file);
            let n = discovery::run_discovery_once(&db, &seeds, &provider, &prices, &config).await?;
            tracing::info!(inserted = n, "discovery done");
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::Scoring => {
            let prices = build_prices(&config)?;
            let analyzed = fifo::run_fifo_all(&db, &prices).await?;
            let qualified = scoring::run_scoring_once(&db, &config).await?;
            tracing::info!(analyzed, qualified, "scoring done");
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::Smartwallets => {
            let wallets = tiers::run_tier_analysis_once(&db, &config).await?;
            let elected = threshold::run_threshold_selection_once(&db, &config).await?;
            tracing::info!(wallets, elected, "smart wallet election done");
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::Consensus => {
            let prices = build_prices(&config)?;
            let emitted = match TelegramNotifier::from_env()? {
                Some(telegram) => {
                    consensus::run_consensus_once(&db, &prices, &telegram, &config).await?
                }
                None => consensus::run_consensus_once(&db, &prices, &NoopNotifier, &config).await?,
            };
            tracing::info!(emitted, "consensus detection done");
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::TrackingLive {
            balance_only,
            transactions_only,
            min_usd,
            hours_lookback,
        } => {
            let provider = match build_provider(&config) {
                Ok(p) => Arc::new(p),
                Err(e) => {
                    eprintln!("configuration error: {e}");
                    return Ok(ExitCode::from(2));
                }
            };
            let prices = Arc::new(build_prices(&config)?);
            let opts = tracking::TrackingOptions {
                balance_only,
                transactions_only,
                min_usd,
                hours_lookback,
            };
            let summary =
                tracking::run_tracking_once(&db, provider, prices, Arc::new(config), opts).await?;
            if summary.failures > 0 {
                Ok(ExitCode::FAILURE)
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }

        cli::Command::Backtest => {
            let prices = build_prices(&config)?;
            let rows = consensus::signal_performance(&db, &prices).await?;
            if rows.is_empty() {
                println!("no consensus signals recorded");
                return Ok(ExitCode::SUCCESS);
            }
            println!("Signal performance (entry vs. now):");
            for r in rows {
                let perf = r
                    .performance_pct
                    .map_or("   n/a".to_string(), |p| format!("{p:+6.1}%"));
                println!(
                    "{perf}  {}  whales={}  entry=${:.6}  detected={}",
                    r.symbol, r.whale_count, r.avg_entry_price, r.detection_date
                );
            }
            Ok(ExitCode::SUCCESS)
        }

        cli::Command::Scheduler => run_scheduler(db, config).await,
    }
}

/// Long-running mode: every stage on its own interval, each in its own job
/// loop fed by scheduler ticks.
async fn run_scheduler(db: AsyncDb, config: Config) -> Result<ExitCode> {
    metrics::install_prometheus(config.observability.prometheus_port)?;
    metrics::describe();

    let cfg = Arc::new(config);
    let provider = match build_provider(&cfg) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("configuration error: {e}");
            return Ok(ExitCode::from(2));
        }
    };
    let prices = Arc::new(build_prices(&cfg)?);
    let telegram = Arc::new(TelegramNotifier::from_env()?);

    tracing::info!("wallet tracker scheduler starting");

    let (tracking_tx, mut tracking_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (scoring_tx, mut scoring_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (consensus_tx, mut consensus_rx) = tokio::sync::mpsc::channel::<()>(8);
    let (discovery_tx, mut discovery_rx) = tokio::sync::mpsc::channel::<()>(8);

    let _handles = scheduler::start(vec![
        scheduler::JobSpec {
            name: "tracking_live".to_string(),
            interval: Duration::from_secs(cfg.tracking.interval_hours * 3600),
            tick: tracking_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "scoring_pipeline".to_string(),
            interval: Duration::from_secs(86400),
            tick: scoring_tx,
            run_immediately: true,
        },
        scheduler::JobSpec {
            name: "consensus".to_string(),
            interval: Duration::from_secs(cfg.consensus.interval_hours * 3600),
            tick: consensus_tx,
            run_immediately: false,
        },
        scheduler::JobSpec {
            name: "discovery".to_string(),
            interval: Duration::from_secs(7 * 86400),
            tick: discovery_tx,
            run_immediately: false,
        },
    ]);

    tokio::spawn({
        let db = db.clone();
        let provider = provider.clone();
        let prices = prices.clone();
        let cfg = cfg.clone();
        async move {
            while tracking_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "tracking_live");
                let _g = span.enter();
                match tracking::run_tracking_once(
                    &db,
                    provider.clone(),
                    prices.clone(),
                    cfg.clone(),
                    tracking::TrackingOptions::default(),
                )
                .await
                {
                    Ok(s) => tracing::info!(
                        wallets = s.wallets,
                        changes = s.changes,
                        failures = s.failures,
                        "tracking_live done"
                    ),
                    Err(e) => tracing::error!(error = %e, "tracking_live failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let prices = prices.clone();
        let cfg = cfg.clone();
        async move {
            while scoring_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "scoring_pipeline");
                let _g = span.enter();
                let res = async {
                    let analyzed = fifo::run_fifo_all(&db, prices.as_ref()).await?;
                    let qualified = scoring::run_scoring_once(&db, &cfg).await?;
                    let tiered = tiers::run_tier_analysis_once(&db, &cfg).await?;
                    let elected = threshold::run_threshold_selection_once(&db, &cfg).await?;
                    Ok::<_, anyhow::Error>((analyzed, qualified, tiered, elected))
                }
                .await;
                match res {
                    Ok((analyzed, qualified, tiered, elected)) => tracing::info!(
                        analyzed,
                        qualified,
                        tiered,
                        elected,
                        "scoring_pipeline done"
                    ),
                    Err(e) => tracing::error!(error = %e, "scoring_pipeline failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let prices = prices.clone();
        let cfg = cfg.clone();
        let telegram = telegram.clone();
        async move {
            while consensus_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "consensus");
                let _g = span.enter();
                let res = match telegram.as_ref() {
                    Some(t) => consensus::run_consensus_once(&db, prices.as_ref(), t, &cfg).await,
                    None => {
                        consensus::run_consensus_once(&db, prices.as_ref(), &NoopNotifier, &cfg)
                            .await
                    }
                };
                match res {
                    Ok(n) => tracing::info!(signals = n, "consensus done"),
                    Err(e) => tracing::error!(error = %e, "consensus failed"),
                }
            }
        }
    });

    tokio::spawn({
        let db = db.clone();
        let provider = provider.clone();
        let prices = prices.clone();
        let cfg = cfg.clone();
        async move {
            while discovery_rx.recv().await.is_some() {
                let span = tracing::info_span!("job_run", job = "discovery");
                let _g = span.enter();
                let seeds = discovery::JsonSeedFile::new(&cfg.discovery.seed_file);
                match discovery::run_discovery_once(
                    &db,
                    &seeds,
                    provider.as_ref(),
                    prices.as_ref(),
                    &cfg,
                )
                .await
                {
                    Ok(n) => tracing::info!(inserted = n, "discovery done"),
                    Err(e) => tracing::error!(error = %e, "discovery failed"),
                }
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(ExitCode::SUCCESS)
}
