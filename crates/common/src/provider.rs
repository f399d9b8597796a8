use crate::types::{ApiPage, ApiPosition, ApiTransaction, TokenBalance};
use anyhow::Result;
use reqwest::{Client, StatusCode, Url};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct HttpStatusError {
    pub status: StatusCode,
    pub url: Url,
}

impl std::fmt::Display for HttpStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HTTP {} for {}", self.status, self.url)
    }
}

impl StdError for HttpStatusError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    RateLimited,
    Timeout,
    Upstream5xx,
    BadRequest,
    Decode,
    Connect,
    Other,
}

impl ApiErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::Timeout => "timeout",
            Self::Upstream5xx => "upstream_5xx",
            Self::BadRequest => "bad_request",
            Self::Decode => "decode",
            Self::Connect => "connect",
            Self::Other => "other",
        }
    }

    /// Transient kinds are worth another scheduled pass; the rest fail the unit.
    pub fn is_transient(self) -> bool {
        matches!(self, Self::RateLimited | Self::Timeout | Self::Upstream5xx | Self::Connect)
    }
}

/// Classify an API failure into a small set of alertable buckets.
///
/// IMPORTANT: keep the returned `kind` set small to avoid Prometheus cardinality blowups.
pub fn classify_api_error(err: &anyhow::Error) -> ApiErrorKind {
    for cause in err.chain() {
        if let Some(h) = cause.downcast_ref::<HttpStatusError>() {
            if h.status == StatusCode::TOO_MANY_REQUESTS {
                return ApiErrorKind::RateLimited;
            }
            if h.status.is_server_error() {
                return ApiErrorKind::Upstream5xx;
            }
            if h.status == StatusCode::REQUEST_TIMEOUT {
                return ApiErrorKind::Timeout;
            }
            if h.status == StatusCode::BAD_REQUEST {
                return ApiErrorKind::BadRequest;
            }
        }

        if let Some(r) = cause.downcast_ref::<reqwest::Error>() {
            if r.is_timeout() {
                return ApiErrorKind::Timeout;
            }
            if r.is_connect() {
                return ApiErrorKind::Connect;
            }
        }

        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return ApiErrorKind::Decode;
        }
    }

    ApiErrorKind::Other
}

/// Credential pool for the data provider. Each key is a one-token bucket that
/// refills after `min_interval`; `acquire` waits for the active key's bucket
/// and `rotate` switches keys after an HTTP 429.
pub struct KeyPool {
    keys: Vec<String>,
    index: AtomicUsize,
    last_use: tokio::sync::Mutex<Vec<Option<Instant>>>,
    min_interval: Duration,
}

impl KeyPool {
    pub fn new(keys: Vec<String>, min_interval: Duration) -> Result<Self> {
        if keys.is_empty() {
            anyhow::bail!("provider credential pool is empty");
        }
        let n = keys.len();
        Ok(Self {
            keys,
            index: AtomicUsize::new(0),
            last_use: tokio::sync::Mutex::new(vec![None; n]),
            min_interval,
        })
    }

    pub async fn acquire(&self) -> String {
        let idx = self.index.load(Ordering::Relaxed) % self.keys.len();
        let wait = {
            let mut last = self.last_use.lock().await;
            let now = Instant::now();
            let wait = match last[idx] {
                Some(prev) => self.min_interval.saturating_sub(now - prev),
                None => Duration::ZERO,
            };
            last[idx] = Some(now + wait);
            wait
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
        self.keys[idx].clone()
    }

    pub fn rotate(&self) {
        let next = (self.index.load(Ordering::Relaxed) + 1) % self.keys.len();
        self.index.store(next, Ordering::Relaxed);
        tracing::info!(key_index = next, "rotated provider API key");
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Zerion-style wallet data provider: balances, paginated transfer history,
/// and an EOA/contract check. All requests retry transient failures with
/// exponential backoff and rotate credentials on rate limits.
pub struct ZerionClient {
    api_url: String,
    contract_api_url: String,
    client: Client,
    keys: KeyPool,
    page_size: u32,
    max_retries: u32,
    backoff_base: Duration,
}

impl ZerionClient {
    pub fn new(api_url: &str, contract_api_url: &str, keys: Vec<String>) -> Result<Self> {
        Self::new_with_settings(
            api_url,
            contract_api_url,
            keys,
            Duration::from_secs(30),
            Duration::from_millis(300),
            100,
            5,
            Duration::from_millis(1000),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_settings(
        api_url: &str,
        contract_api_url: &str,
        keys: Vec<String>,
        timeout: Duration,
        key_min_interval: Duration,
        page_size: u32,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            contract_api_url: contract_api_url.trim_end_matches('/').to_string(),
            client,
            keys: KeyPool::new(keys, key_min_interval)?,
            page_size,
            max_retries,
            backoff_base,
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn positions_url(&self, wallet: &str) -> String {
        let mut url = Url::parse(&format!("{}/wallets/{wallet}/positions/", self.api_url))
            .expect("provider api_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("filter[positions]", "only_simple");
            qp.append_pair("filter[trash]", "only_non_trash");
            qp.append_pair("currency", "usd");
            qp.append_pair("sort", "value");
        }
        url.to_string()
    }

    pub fn transactions_url(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        operation: Option<&str>,
        cursor: Option<&str>,
    ) -> String {
        let mut url = Url::parse(&format!("{}/wallets/{wallet}/transactions/", self.api_url))
            .expect("provider api_url must be a valid absolute URL");
        {
            let mut qp = url.query_pairs_mut();
            if let Some(fid) = fungible_id {
                qp.append_pair("filter[fungible_ids]", fid);
            }
            if let Some(op) = operation {
                qp.append_pair("filter[operation_types]", op);
            }
            qp.append_pair("currency", "usd");
            qp.append_pair("page[size]", &self.page_size.to_string());
            if let Some(c) = cursor {
                qp.append_pair("page[after]", c);
            }
        }
        url.to_string()
    }

    /// Current balances for a wallet, normalized. Positions without a fungible
    /// id or with dust quantities are dropped.
    pub async fn fetch_positions(&self, wallet: &str) -> Result<Vec<TokenBalance>> {
        let body = self.get_with_retry(self.positions_url(wallet)).await?;
        let page: ApiPage<ApiPosition> = serde_json::from_slice(&body)?;

        let mut balances = Vec::new();
        for pos in page.data {
            let attrs = pos.attributes;
            let Some(fungible_id) = attrs.fungible_info.id.clone() else {
                continue;
            };
            let amount = attrs.quantity.as_ref().map_or(0.0, |q| q.as_f64());
            if amount <= 0.0 {
                continue;
            }
            let impls = &attrs.fungible_info.implementations;
            balances.push(TokenBalance {
                symbol: attrs
                    .fungible_info
                    .symbol
                    .clone()
                    .unwrap_or_else(|| "UNKNOWN".to_string())
                    .trim()
                    .to_uppercase(),
                contract_address: impls.first().and_then(|i| i.address.clone()),
                chain: impls
                    .first()
                    .and_then(|i| i.chain_id.clone())
                    .unwrap_or_default(),
                fungible_id,
                amount,
                usd_value: attrs.value.unwrap_or(0.0),
            });
        }
        Ok(balances)
    }

    /// One page of transaction history. Returns the parsed page and the cursor
    /// for the next one, if any.
    pub async fn fetch_transactions_page(
        &self,
        wallet: &str,
        fungible_id: Option<&str>,
        operation: Option<&str>,
        cursor: Option<&str>,
    ) -> Result<(Vec<ApiTransaction>, Option<String>)> {
        let url = self.transactions_url(wallet, fungible_id, operation, cursor);
        let body = self.get_with_retry(url).await?;
        let page: ApiPage<ApiTransaction> = serde_json::from_slice(&body)?;
        let next = page.links.next.as_deref().and_then(extract_cursor);
        Ok((page.data, next))
    }

    /// EOA check. `Ok(Some(true))` = contract, `Ok(Some(false))` = EOA,
    /// `Ok(None)` = ambiguous (callers must treat as "not an EOA").
    pub async fn check_contract(&self, address: &str) -> Result<Option<bool>> {
        let mut url = Url::parse(&self.contract_api_url)?;
        {
            let mut qp = url.query_pairs_mut();
            qp.append_pair("chainid", "1");
            qp.append_pair("module", "proxy");
            qp.append_pair("action", "eth_getCode");
            qp.append_pair("address", address);
        }
        let body = match self.get_with_retry(url.to_string()).await {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!(address, error = %e, "contract check failed");
                return Ok(None);
            }
        };
        let v: serde_json::Value = match serde_json::from_slice(&body) {
            Ok(v) => v,
            Err(_) => return Ok(None),
        };
        match v.get("result").and_then(|r| r.as_str()) {
            Some(code) => Ok(Some(!code.is_empty() && code != "0x")),
            None => Ok(None),
        }
    }

    async fn get_with_retry(&self, url: String) -> Result<Vec<u8>> {
        let url = Url::parse(&url)?;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let key = self.keys.acquire().await;

            let req = self
                .client
                .get(url.clone())
                .header("accept", "application/json")
                .header("authorization", format!("Basic {key}"));

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let b = resp.bytes().await?;
                        return Ok(b.to_vec());
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS {
                        self.keys.rotate();
                    }

                    if attempt <= self.max_retries
                        && (status == StatusCode::TOO_MANY_REQUESTS
                            || status.is_server_error()
                            || status == StatusCode::REQUEST_TIMEOUT)
                    {
                        let backoff = self.backoff_base.mul_f64(2_f64.powi((attempt - 1) as i32));
                        tokio::time::sleep(backoff).await;
                        continue;
                    }

                    return Err(anyhow::Error::new(HttpStatusError { status, url }));
                }
                Err(e) => {
                    if attempt <= self.max_retries {
                        let backoff = self.backoff_base.mul_f64(2_f64.powi((attempt - 1) as i32));
                        tokio::time::sleep(backoff).await;
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }
    }
}

/// The provider hands back a fully-qualified `links.next` URL; pagination only
/// needs the `page[after]` cursor out of it.
fn extract_cursor(next_url: &str) -> Option<String> {
    for marker in ["page%5Bafter%5D=", "page[after]="] {
        if let Some(rest) = next_url.split(marker).nth(1) {
            let cursor = rest.split('&').next().unwrap_or("");
            if !cursor.is_empty() {
                return Some(cursor.to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_client() -> ZerionClient {
        ZerionClient::new(
            "https://api.zerion.io/v1",
            "https://api.etherscan.io/v2/api",
            vec!["key-a".to_string(), "key-b".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_positions_url() {
        let url = test_client().positions_url("0xabc");
        assert!(url.contains("/wallets/0xabc/positions/"));
        assert!(url.contains("currency=usd"));
        assert!(url.contains("only_non_trash"));
    }

    #[test]
    fn test_transactions_url_with_filters() {
        let url = test_client().transactions_url("0xabc", Some("tok-1"), None, Some("cur123"));
        assert!(url.contains("/wallets/0xabc/transactions/"));
        assert!(url.contains("fungible_ids%5D=tok-1"));
        assert!(url.contains("after%5D=cur123"));

        let url = test_client().transactions_url("0xabc", None, Some("send"), None);
        assert!(url.contains("operation_types%5D=send"));
        assert!(!url.contains("fungible_ids"));
    }

    #[test]
    fn test_extract_cursor_both_encodings() {
        assert_eq!(
            extract_cursor("https://x/y?page%5Bafter%5D=abc&z=1"),
            Some("abc".to_string())
        );
        assert_eq!(
            extract_cursor("https://x/y?page[after]=def"),
            Some("def".to_string())
        );
        assert_eq!(extract_cursor("https://x/y?limit=10"), None);
    }

    #[test]
    fn test_classify_http_429_as_rate_limited() {
        let url = Url::parse("https://api.zerion.io/v1/wallets/0xabc/positions/").unwrap();
        let err = anyhow::Error::new(HttpStatusError {
            status: StatusCode::TOO_MANY_REQUESTS,
            url,
        });
        assert_eq!(classify_api_error(&err), ApiErrorKind::RateLimited);
        assert!(ApiErrorKind::RateLimited.is_transient());
    }

    #[test]
    fn test_classify_decode_error() {
        let err = serde_json::from_slice::<Vec<ApiTransaction>>(b"{nope}").unwrap_err();
        let err = anyhow::Error::from(err);
        assert_eq!(classify_api_error(&err), ApiErrorKind::Decode);
        assert!(!ApiErrorKind::Decode.is_transient());
    }

    #[test]
    fn test_key_pool_requires_a_key() {
        assert!(KeyPool::new(vec![], Duration::from_millis(1)).is_err());
    }

    #[tokio::test]
    async fn test_key_pool_rotation_cycles() {
        let pool = KeyPool::new(
            vec!["a".to_string(), "b".to_string()],
            Duration::from_millis(0),
        )
        .unwrap();
        assert_eq!(pool.acquire().await, "a");
        pool.rotate();
        assert_eq!(pool.acquire().await, "b");
        pool.rotate();
        assert_eq!(pool.acquire().await, "a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_pool_enforces_min_interval() {
        let pool = KeyPool::new(vec!["a".to_string()], Duration::from_millis(500)).unwrap();
        let t0 = tokio::time::Instant::now();
        pool.acquire().await;
        pool.acquire().await;
        assert!(t0.elapsed() >= Duration::from_millis(500));
    }
}
