use anyhow::Result;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub general: General,
    pub database: Database,
    pub observability: Observability,
    pub provider: Provider,
    pub prices: Prices,
    pub discovery: Discovery,
    pub tracking: Tracking,
    pub scoring: Scoring,
    pub tiers: Tiers,
    pub threshold: Threshold,
    pub consensus: Consensus,
    pub migration: Migration,
}

#[derive(Debug, Clone, Deserialize)]
pub struct General {
    pub log_level: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Database {
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Observability {
    pub prometheus_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Provider {
    pub api_url: String,
    pub contract_api_url: String,
    pub page_size: u32,
    pub max_pages: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub key_min_interval_ms: u64,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Prices {
    pub primary_url: String,
    pub fallback_url: String,
    pub max_price_usd: f64,
    pub stablecoins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Discovery {
    pub seed_file: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tracking {
    pub hours_lookback: i64,
    pub min_token_value_usd: f64,
    /// Relative amount change (percent) below which a position move is noise.
    pub delta_rel_pct: f64,
    pub interval_hours: u64,
    pub worker_pool: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Scoring {
    pub min_score: f64,
    pub min_weighted_roi: f64,
    pub min_trades: u32,
    pub excluded_tokens: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Tiers {
    pub grid: Vec<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Threshold {
    pub min_trades: u32,
    pub min_winrate: f64,
    pub roi_cap: f64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Consensus {
    pub min_whales: u32,
    pub window_hours: i64,
    pub mcap_min: f64,
    pub mcap_max: f64,
    pub interval_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Migration {
    pub portfolio_fraction: f64,
    pub window_hours: i64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let path =
            std::env::var("TRACKER_CONFIG").unwrap_or_else(|_| "config/default.toml".to_string());
        let content = std::fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("cannot read config {path}: {e}"))?;
        Self::from_str(&content)
    }

    pub fn from_str(s: &str) -> Result<Self> {
        let cfg: Config = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.tiers.grid.is_empty() {
            anyhow::bail!("tiers.grid must not be empty");
        }
        if self.tiers.grid.windows(2).any(|w| w[0] >= w[1]) {
            anyhow::bail!("tiers.grid must be strictly increasing");
        }
        if !(0.0..=1.0).contains(&self.migration.portfolio_fraction) {
            anyhow::bail!("migration.portfolio_fraction must be within [0, 1]");
        }
        if self.tracking.worker_pool == 0 {
            anyhow::bail!("tracking.worker_pool must be at least 1");
        }
        Ok(())
    }
}
