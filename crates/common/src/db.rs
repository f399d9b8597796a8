use anyhow::{Context, Result};
use rusqlite::Connection;
use std::time::Instant;

pub struct Database {
    pub conn: Connection,
}

impl Database {
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        // Retry for up to 30s when another connection holds the write lock
        // (scheduler jobs and CLI queries share one file).
        conn.busy_timeout(std::time::Duration::from_secs(30))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Ok(Self { conn })
    }

    pub fn run_migrations(&self) -> Result<()> {
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }
}

/// Async handle over the pipeline's SQLite connection. `tokio-rusqlite` owns
/// the connection on its own thread; all reads and writes go through `call`,
/// which ships a closure there and awaits its result.
#[derive(Clone)]
pub struct AsyncDb {
    conn: tokio_rusqlite::Connection,
}

impl AsyncDb {
    pub async fn open(path: &str) -> Result<Self> {
        let conn = tokio_rusqlite::Connection::open(path)
            .await
            .with_context(|| format!("failed to open database {path}"))?;

        conn.call(|conn| {
            conn.busy_timeout(std::time::Duration::from_secs(30))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to prepare database {path}: {e}"))?;

        Ok(Self { conn })
    }

    /// Execute a closure on the database connection.
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        self.conn
            .call(move |conn| f(conn).map_err(tokio_rusqlite::Error::from))
            .await
            .map_err(|e| anyhow::anyhow!("DB call failed: {e}"))
    }

    /// Same as `call` but records latency and errors under an operation label.
    pub async fn call_named<F, R>(&self, op: &'static str, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> std::result::Result<R, rusqlite::Error> + Send + 'static,
        R: Send + 'static,
    {
        let start = Instant::now();
        let res = self.call(f).await;
        let ms = start.elapsed().as_secs_f64() * 1000.0;
        metrics::histogram!("tracker_db_query_latency_ms", "op" => op).record(ms);
        if res.is_err() {
            metrics::counter!("tracker_db_query_errors_total", "op" => op).increment(1);
        }
        res
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS wallets (
    wallet_address TEXT PRIMARY KEY,
    period TEXT NOT NULL DEFAULT 'manual',     -- 14d, 30d, 200d, 360d, manual, migration
    total_portfolio_value REAL NOT NULL DEFAULT 0,
    token_count INTEGER NOT NULL DEFAULT 0,
    is_active INTEGER NOT NULL DEFAULT 1,
    is_scored INTEGER NOT NULL DEFAULT 0,
    transactions_extracted INTEGER NOT NULL DEFAULT 0,
    last_sync TEXT,
    created_at TEXT NOT NULL DEFAULT (datetime('now')),
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS token_positions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    fungible_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    contract_address TEXT,
    chain TEXT,
    current_amount REAL NOT NULL DEFAULT 0,
    current_usd_value REAL NOT NULL DEFAULT 0,
    current_price_per_token REAL NOT NULL DEFAULT 0,
    in_portfolio INTEGER NOT NULL DEFAULT 1,
    last_updated TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet_address, fungible_id)
);

CREATE TABLE IF NOT EXISTS transfers (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    transaction_hash TEXT NOT NULL,
    symbol TEXT NOT NULL,
    contract_address TEXT,
    fungible_id TEXT NOT NULL,
    direction TEXT NOT NULL,                   -- in, out
    action_type TEXT NOT NULL,                 -- buy, sell, airdrop, transfer_in, transfer_out
    quantity REAL NOT NULL,                    -- always positive
    price_per_token REAL NOT NULL DEFAULT 0,   -- provider-observed, never rewritten
    inherited_price_per_token REAL,            -- written only by the migration handler
    is_inherited_from_wallet TEXT,
    counterparty_address TEXT,
    timestamp TEXT NOT NULL,
    block_number INTEGER NOT NULL DEFAULT 0,
    ingested_at TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet_address, transaction_hash, fungible_id)
);

CREATE TABLE IF NOT EXISTS token_analytics (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    fungible_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    contract_address TEXT,
    total_invested REAL NOT NULL DEFAULT 0,
    total_realized REAL NOT NULL DEFAULT 0,
    gains_airdrops REAL NOT NULL DEFAULT 0,
    current_value REAL NOT NULL DEFAULT 0,
    profit_loss REAL NOT NULL DEFAULT 0,
    roi_percentage REAL NOT NULL DEFAULT 0,
    remaining_quantity REAL NOT NULL DEFAULT 0,
    remaining_cost_basis REAL NOT NULL DEFAULT 0,
    weighted_avg_buy_price REAL NOT NULL DEFAULT 0,
    weighted_avg_sell_price REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'NEUTRE',     -- GAGNANT, PERDANT, NEUTRE, AIRDROP_GAGNANT
    first_transaction_date TEXT,
    last_transaction_date TEXT,
    analysis_date TEXT NOT NULL DEFAULT (datetime('now')),
    UNIQUE(wallet_address, fungible_id)
);

CREATE TABLE IF NOT EXISTS qualified_wallets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL UNIQUE,
    score REAL NOT NULL,
    classification TEXT NOT NULL,              -- ELITE, EXCELLENT, BON, MOYEN, FAIBLE
    weighted_roi REAL NOT NULL,
    win_rate REAL NOT NULL,                    -- percent
    trade_count INTEGER NOT NULL,
    total_invested REAL NOT NULL,
    winners INTEGER NOT NULL,
    losers INTEGER NOT NULL,
    neutral INTEGER NOT NULL,
    roi_score REAL NOT NULL,
    activity_score REAL NOT NULL,
    success_score REAL NOT NULL,
    scored_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS tier_performance (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    tier_usd INTEGER NOT NULL,
    roi_percentage REAL NOT NULL DEFAULT 0,
    win_rate REAL NOT NULL DEFAULT 0,          -- percent
    n_trades INTEGER NOT NULL DEFAULT 0,
    n_winners INTEGER NOT NULL DEFAULT 0,
    n_losers INTEGER NOT NULL DEFAULT 0,
    n_neutral INTEGER NOT NULL DEFAULT 0,
    total_invested REAL NOT NULL DEFAULT 0,
    is_optimal_tier INTEGER NOT NULL DEFAULT 0,
    UNIQUE(wallet_address, tier_usd)
);

CREATE TABLE IF NOT EXISTS smart_wallets (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL UNIQUE,
    optimal_threshold_tier INTEGER NOT NULL,
    quality_score REAL NOT NULL,               -- [0, 1]
    threshold_status TEXT NOT NULL,
    optimal_roi REAL NOT NULL DEFAULT 0,
    optimal_win_rate REAL NOT NULL DEFAULT 0,
    optimal_trades INTEGER NOT NULL DEFAULT 0,
    optimal_winners INTEGER NOT NULL DEFAULT 0,
    optimal_losers INTEGER NOT NULL DEFAULT 0,
    optimal_neutral INTEGER NOT NULL DEFAULT 0,
    global_roi REAL NOT NULL DEFAULT 0,
    global_win_rate REAL NOT NULL DEFAULT 0,
    global_trades INTEGER NOT NULL DEFAULT 0,
    j_score_max REAL NOT NULL DEFAULT 0,
    j_score_avg REAL NOT NULL DEFAULT 0,
    reliable_tiers_count INTEGER NOT NULL DEFAULT 0,
    elected_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS position_changes (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    wallet_address TEXT NOT NULL,
    symbol TEXT NOT NULL,
    contract_address TEXT,
    fungible_id TEXT NOT NULL,
    change_type TEXT NOT NULL,                 -- NEW, ACCUMULATION, REDUCTION, EXIT
    old_amount REAL NOT NULL DEFAULT 0,
    new_amount REAL NOT NULL DEFAULT 0,
    old_usd_value REAL NOT NULL DEFAULT 0,
    new_usd_value REAL NOT NULL DEFAULT 0,
    detected_at TEXT NOT NULL DEFAULT (datetime('now'))
);

CREATE TABLE IF NOT EXISTS wallet_migrations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    old_wallet TEXT NOT NULL,
    new_wallet TEXT NOT NULL,
    migration_date TEXT NOT NULL,
    tokens_transferred TEXT,                   -- JSON: [{symbol, fungible_id, quantity, value_usd}]
    total_value_transferred REAL NOT NULL DEFAULT 0,
    transfer_percentage REAL NOT NULL DEFAULT 0,
    is_validated INTEGER NOT NULL DEFAULT 1,
    UNIQUE(old_wallet, new_wallet, migration_date)
);

CREATE TABLE IF NOT EXISTS consensus_signals (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    symbol TEXT NOT NULL,
    contract_address TEXT NOT NULL,
    detection_date TEXT NOT NULL,
    whale_count INTEGER NOT NULL,
    total_investment REAL NOT NULL DEFAULT 0,
    first_buy TEXT,
    last_buy TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    period_start TEXT NOT NULL,
    period_end TEXT NOT NULL,
    market_cap REAL NOT NULL DEFAULT 0,
    liquidity_usd REAL NOT NULL DEFAULT 0,
    avg_entry_price REAL NOT NULL DEFAULT 0,
    wallet_addresses TEXT,                     -- JSON array
    UNIQUE(contract_address, period_start)
);

CREATE INDEX IF NOT EXISTS idx_transfers_wallet_symbol ON transfers(wallet_address, symbol);
CREATE INDEX IF NOT EXISTS idx_transfers_wallet_fungible ON transfers(wallet_address, fungible_id);
CREATE INDEX IF NOT EXISTS idx_transfers_timestamp ON transfers(timestamp);
CREATE INDEX IF NOT EXISTS idx_positions_wallet ON token_positions(wallet_address);
CREATE INDEX IF NOT EXISTS idx_analytics_wallet ON token_analytics(wallet_address);
CREATE INDEX IF NOT EXISTS idx_changes_wallet_detected ON position_changes(wallet_address, detected_at);
CREATE INDEX IF NOT EXISTS idx_signals_detection ON consensus_signals(detection_date);
"#;
