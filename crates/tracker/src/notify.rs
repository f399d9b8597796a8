use anyhow::Result;
use std::time::Duration;

/// Payload handed to the notification sink when a consensus forms. Delivery is
/// at-least-once; receivers dedupe on (contract_address, period_start).
#[derive(Debug, Clone, PartialEq)]
pub struct ConsensusAlert {
    pub symbol: String,
    pub contract_address: String,
    pub chain: String,
    pub whale_count: u32,
    pub total_investment_usd: f64,
    pub first_buy: String,
    pub last_buy: String,
    pub market_cap: f64,
    pub liquidity_usd: f64,
    pub wallet_addresses: Vec<String>,
    pub period_start: String,
    pub period_end: String,
}

pub trait Notifier {
    fn emit(&self, alert: &ConsensusAlert) -> impl std::future::Future<Output = Result<()>> + Send;
}

/// Sink that drops alerts; used when no credentials are configured and in tests.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    async fn emit(&self, alert: &ConsensusAlert) -> Result<()> {
        tracing::info!(
            symbol = %alert.symbol,
            whales = alert.whale_count,
            "consensus alert (no sink configured)"
        );
        Ok(())
    }
}

pub struct TelegramNotifier {
    client: reqwest::Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    /// Built from TELEGRAM_BOT_TOKEN / TELEGRAM_CHAT_ID; absent means no sink.
    pub fn from_env() -> Result<Option<Self>> {
        let (Ok(bot_token), Ok(chat_id)) = (
            std::env::var("TELEGRAM_BOT_TOKEN"),
            std::env::var("TELEGRAM_CHAT_ID"),
        ) else {
            return Ok(None);
        };
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()?;
        Ok(Some(Self {
            client,
            bot_token,
            chat_id,
        }))
    }

    fn format_message(alert: &ConsensusAlert) -> String {
        let mcap_m = alert.market_cap / 1_000_000.0;
        let mut msg = format!(
            "🐋 CONSENSUS {} — {} smart wallets\n\
             Contract: {}\n\
             Chain: {}\n\
             Invested: ${:.0}\n\
             Market cap: ${mcap_m:.2}M | Liquidity: ${:.0}\n\
             Window: {} → {}\n",
            alert.symbol,
            alert.whale_count,
            alert.contract_address,
            alert.chain,
            alert.total_investment_usd,
            alert.liquidity_usd,
            alert.first_buy,
            alert.last_buy,
        );
        for w in &alert.wallet_addresses {
            msg.push_str(&format!("  • {w}\n"));
        }
        msg
    }
}

impl Notifier for TelegramNotifier {
    async fn emit(&self, alert: &ConsensusAlert) -> Result<()> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let body = serde_json::json!({
            "chat_id": self.chat_id,
            "text": Self::format_message(alert),
            "disable_web_page_preview": true,
        });
        let resp = self.client.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            anyhow::bail!("telegram sendMessage returned HTTP {}", resp.status());
        }
        metrics::counter!("tracker_notifications_sent_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert() -> ConsensusAlert {
        ConsensusAlert {
            symbol: "PEPE".to_string(),
            contract_address: "0xpepe".to_string(),
            chain: "ethereum".to_string(),
            whale_count: 3,
            total_investment_usd: 42_000.0,
            first_buy: "2025-11-01T08:00:00Z".to_string(),
            last_buy: "2025-11-02T09:30:00Z".to_string(),
            market_cap: 5_000_000.0,
            liquidity_usd: 250_000.0,
            wallet_addresses: vec!["0xw1".to_string(), "0xw2".to_string(), "0xw3".to_string()],
            period_start: "2025-11-01T08:00:00Z".to_string(),
            period_end: "2025-11-03T08:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_message_carries_key_fields() {
        let msg = TelegramNotifier::format_message(&alert());
        assert!(msg.contains("PEPE"));
        assert!(msg.contains("3 smart wallets"));
        assert!(msg.contains("0xpepe"));
        assert!(msg.contains("$5.00M"));
        assert!(msg.contains("0xw2"));
    }

    #[tokio::test]
    async fn test_noop_sink_accepts_alerts() {
        NoopNotifier.emit(&alert()).await.unwrap();
    }
}
