use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use common::provider::{classify_api_error, ZerionClient};
use common::types::{ApiTransaction, TokenBalance};
use std::time::Instant;

use crate::ingestion::TransfersPager;

pub trait BalancesFetcher {
    fn fetch_balances(
        &self,
        wallet: &str,
    ) -> impl std::future::Future<Output = Result<Vec<TokenBalance>>> + Send;
}

pub trait SendsFetcher {
    /// Outgoing transactions of a wallet within the window, newest first.
    fn fetch_recent_sends(
        &self,
        wallet: &str,
        since_hours: i64,
    ) -> impl std::future::Future<Output = Result<Vec<ApiTransaction>>> + Send;
}

pub trait ContractChecker {
    /// `Some(true)` = contract, `Some(false)` = EOA, `None` = ambiguous.
    fn is_contract(
        &self,
        address: &str,
    ) -> impl std::future::Future<Output = Result<Option<bool>>> + Send;
}

fn record_api_call<T>(endpoint: &'static str, start: Instant, res: Result<T>) -> Result<T> {
    let ms = start.elapsed().as_secs_f64() * 1000.0;
    metrics::histogram!("tracker_api_latency_ms", "endpoint" => endpoint).record(ms);
    match res {
        Ok(v) => {
            metrics::counter!("tracker_api_requests_total", "endpoint" => endpoint, "status" => "ok")
                .increment(1);
            Ok(v)
        }
        Err(e) => {
            metrics::counter!("tracker_api_requests_total", "endpoint" => endpoint, "status" => "error")
                .increment(1);
            metrics::counter!(
                "tracker_api_errors_total",
                "endpoint" => endpoint,
                "kind" => classify_api_error(&e).as_str()
            )
            .increment(1);
            Err(e)
        }
    }
}

impl BalancesFetcher for ZerionClient {
    async fn fetch_balances(&self, wallet: &str) -> Result<Vec<TokenBalance>> {
        let start = Instant::now();
        let res = self.fetch_positions(wallet).await;
        record_api_call("positions", start, res)
    }
}

impl TransfersPager for ZerionClient {
    fn transfers_url(&self, wallet: &str, fungible_id: &str, cursor: Option<&str>) -> String {
        self.transactions_url(wallet, Some(fungible_id), None, cursor)
    }

    async fn fetch_transfers_page(
        &self,
        wallet: &str,
        fungible_id: &str,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransaction>, Option<String>)> {
        let start = Instant::now();
        let res = self
            .fetch_transactions_page(wallet, Some(fungible_id), None, cursor)
            .await;
        record_api_call("transactions", start, res)
    }
}

impl SendsFetcher for ZerionClient {
    async fn fetch_recent_sends(
        &self,
        wallet: &str,
        since_hours: i64,
    ) -> Result<Vec<ApiTransaction>> {
        let start = Instant::now();
        let res = fetch_sends_inner(self, wallet, since_hours).await;
        record_api_call("sends", start, res)
    }
}

async fn fetch_sends_inner(
    client: &ZerionClient,
    wallet: &str,
    since_hours: i64,
) -> Result<Vec<ApiTransaction>> {
    let cutoff = Utc::now() - Duration::hours(since_hours);
    let mut all = Vec::new();
    let mut cursor: Option<String> = None;
    // The provider sorts newest first; ten pages cover any realistic week.
    for _ in 0..10 {
        let (txs, next) = client
            .fetch_transactions_page(wallet, None, Some("send"), cursor.as_deref())
            .await?;
        if txs.is_empty() {
            break;
        }

        let oldest = txs
            .last()
            .and_then(|t| t.attributes.mined_at.as_deref())
            .and_then(parse_iso);
        all.extend(txs);

        match oldest {
            Some(ts) if ts < cutoff => break,
            _ => {}
        }
        match next {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    Ok(all)
}

impl ContractChecker for ZerionClient {
    async fn is_contract(&self, address: &str) -> Result<Option<bool>> {
        let start = Instant::now();
        let res = self.check_contract(address).await;
        record_api_call("contract_check", start, res)
    }
}

pub fn parse_iso(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Zulu-suffixed ISO-8601, the format the provider uses, so stored timestamps
/// stay lexicographically comparable.
pub fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_iso_handles_zulu_and_offset() {
        assert!(parse_iso("2025-11-02T10:00:00Z").is_some());
        assert!(parse_iso("2025-11-02T10:00:00+02:00").is_some());
        assert!(parse_iso("yesterday").is_none());
    }

    #[test]
    fn test_transfers_url_delegates_to_client() {
        let client = ZerionClient::new(
            "https://api.zerion.io/v1",
            "https://api.etherscan.io/v2/api",
            vec!["k".to_string()],
        )
        .unwrap();
        let url = TransfersPager::transfers_url(&client, "0xw", "tok-1", None);
        assert!(url.contains("/wallets/0xw/transactions/"));
        assert!(url.contains("fungible_ids%5D=tok-1"));
    }
}
