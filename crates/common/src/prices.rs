use anyhow::Result;
use reqwest::Client;
use std::collections::HashSet;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriceTag {
    Stable,
    Primary,
    Fallback,
    None,
}

impl PriceTag {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stable => "stable",
            Self::Primary => "primary",
            Self::Fallback => "fallback",
            Self::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpotPrice {
    pub usd: f64,
    pub source: PriceTag,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenInfo {
    pub price_usd: f64,
    pub market_cap: f64,
    pub liquidity_usd: f64,
    pub volume_24h: f64,
}

/// Canonical USD price per (contract, now). Swappable so tests can pin prices.
pub trait PriceSource {
    fn price(
        &self,
        contract: Option<&str>,
        symbol: &str,
    ) -> impl std::future::Future<Output = Result<Option<SpotPrice>>> + Send;

    fn token_info(
        &self,
        contract: &str,
    ) -> impl std::future::Future<Output = Result<Option<TokenInfo>>> + Send;

    fn is_stablecoin(&self, symbol: &str) -> bool;
}

pub struct MarketDataClient {
    client: Client,
    primary_url: String,
    fallback_url: String,
    stablecoins: HashSet<String>,
    max_price_usd: f64,
}

const ETH_SYMBOLS: &[&str] = &["ETH", "WETH", "ETHEREUM"];

impl MarketDataClient {
    pub fn new(
        primary_url: &str,
        fallback_url: &str,
        stablecoins: &[String],
        max_price_usd: f64,
    ) -> Result<Self> {
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            primary_url: primary_url.trim_end_matches('/').to_string(),
            fallback_url: fallback_url.trim_end_matches('/').to_string(),
            stablecoins: stablecoins.iter().map(|s| s.to_uppercase()).collect(),
            max_price_usd,
        })
    }

    async fn fetch_primary(&self, contract: &str) -> Result<Option<TokenInfo>> {
        let url = format!("{}/{}", self.primary_url, contract);
        let resp = self.client.get(&url).send().await?;
        if resp.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(None);
        }
        if !resp.status().is_success() {
            anyhow::bail!("price oracle returned HTTP {} for {url}", resp.status());
        }
        let v: serde_json::Value = resp.json().await?;
        let Some(pair) = v.get("pairs").and_then(|p| p.as_array()).and_then(|a| a.first())
        else {
            return Ok(None);
        };
        let price_usd = pair
            .get("priceUsd")
            .and_then(|p| p.as_str())
            .and_then(|p| p.parse::<f64>().ok())
            .unwrap_or(0.0);
        if price_usd <= 0.0 {
            return Ok(None);
        }
        let num = |v: &serde_json::Value| v.as_f64().unwrap_or(0.0);
        Ok(Some(TokenInfo {
            price_usd,
            market_cap: pair
                .get("marketCap")
                .map(&num)
                .filter(|m| *m > 0.0)
                .or_else(|| pair.get("fdv").map(&num))
                .unwrap_or(0.0),
            liquidity_usd: pair
                .get("liquidity")
                .and_then(|l| l.get("usd"))
                .map(&num)
                .unwrap_or(0.0),
            volume_24h: pair
                .get("volume")
                .and_then(|v| v.get("h24"))
                .map(&num)
                .unwrap_or(0.0),
        }))
    }

    async fn fetch_eth_fallback(&self) -> Result<Option<f64>> {
        let url = format!("{}?ids=ethereum&vs_currencies=usd", self.fallback_url);
        let resp = self.client.get(&url).send().await?;
        if !resp.status().is_success() {
            return Ok(None);
        }
        let v: serde_json::Value = resp.json().await?;
        Ok(v.get("ethereum").and_then(|e| e.get("usd")).and_then(|p| p.as_f64()))
    }

    /// Spot prices above the aberration cap are worthless oracle glitches.
    fn sane(&self, usd: f64) -> bool {
        usd > 0.0 && usd <= self.max_price_usd
    }
}

impl PriceSource for MarketDataClient {
    fn is_stablecoin(&self, symbol: &str) -> bool {
        let up = symbol.to_uppercase();
        self.stablecoins.contains(&up) || up.starts_with("USD")
    }

    async fn price(&self, contract: Option<&str>, symbol: &str) -> Result<Option<SpotPrice>> {
        if self.is_stablecoin(symbol) {
            return Ok(Some(SpotPrice {
                usd: 1.0,
                source: PriceTag::Stable,
            }));
        }

        if ETH_SYMBOLS.contains(&symbol.to_uppercase().as_str()) {
            if let Some(usd) = self.fetch_eth_fallback().await? {
                if self.sane(usd) {
                    return Ok(Some(SpotPrice {
                        usd,
                        source: PriceTag::Fallback,
                    }));
                }
            }
            return Ok(None);
        }

        let Some(contract) = contract.filter(|c| !c.is_empty()) else {
            return Ok(None);
        };

        match self.fetch_primary(contract).await {
            Ok(Some(info)) if self.sane(info.price_usd) => Ok(Some(SpotPrice {
                usd: info.price_usd,
                source: PriceTag::Primary,
            })),
            Ok(Some(info)) => {
                tracing::warn!(contract, price = info.price_usd, "discarding aberrant spot price");
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(e) => {
                tracing::warn!(contract, error = %e, "primary price oracle failed");
                Ok(None)
            }
        }
    }

    async fn token_info(&self, contract: &str) -> Result<Option<TokenInfo>> {
        match self.fetch_primary(contract).await {
            Ok(info) => Ok(info),
            Err(e) => {
                tracing::warn!(contract, error = %e, "token info lookup failed");
                Ok(None)
            }
        }
    }
}
