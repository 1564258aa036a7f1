//! DexScreener market data client
//!
//! Batch quotes come from `GET {base}/tokens/v1/{chain}/{addr,addr,...}` and
//! chain resolution from `GET {base}/latest/dex/search?q={address}`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::MarketSettings;
use crate::domain::{ChainInfo, MarketQuote};
use crate::error::{Result, SpikeError};

/// Source of market quotes
#[async_trait]
pub trait MarketDataSource: Send + Sync {
    /// Quotes for up to one chunk of addresses on a single chain.
    ///
    /// An `Err` means the chunk was given up on after retries.
    async fn fetch_chunk(&self, chain: &str, addresses: &[String]) -> Result<Vec<MarketQuote>>;

    /// Resolve an address to its chain; `None` when the market has no pair for it
    async fn lookup_chain_info(&self, address: &str) -> Result<Option<ChainInfo>>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Pair {
    #[serde(default)]
    chain_id: Option<String>,
    base_token: BaseToken,
    #[serde(default)]
    price_change: Option<Window>,
    #[serde(default)]
    volume: Option<Window>,
    #[serde(default)]
    market_cap: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct BaseToken {
    address: String,
    #[serde(default)]
    symbol: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Window {
    #[serde(default)]
    m5: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pairs: Option<Vec<Pair>>,
}

/// Group `(chain, address)` pairs by chain and split each group into
/// chunks of at most `chunk_size`. Chains come out sorted.
pub fn chunk_by_chain<'a, I>(tokens: I, chunk_size: usize) -> Vec<(String, Vec<String>)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut by_chain: BTreeMap<&str, Vec<String>> = BTreeMap::new();
    for (chain, address) in tokens {
        let list = by_chain.entry(chain).or_default();
        if !list.iter().any(|a| a == address) {
            list.push(address.to_string());
        }
    }

    let chunk_size = chunk_size.max(1);
    by_chain
        .into_iter()
        .flat_map(|(chain, addresses)| {
            addresses
                .chunks(chunk_size)
                .map(|c| (chain.to_string(), c.to_vec()))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Keep the first pair per requested address and stamp the chain on each.
///
/// The market returns pairs ranked by liquidity, possibly several per token
/// and with the address in a different case than requested.
fn quotes_from_pairs(chain: &str, requested: &[String], pairs: Vec<Pair>) -> Vec<MarketQuote> {
    let mut seen = HashSet::new();
    let mut quotes = Vec::new();

    for pair in pairs {
        let returned = pair.base_token.address;
        let address = requested
            .iter()
            .find(|a| a.eq_ignore_ascii_case(&returned))
            .cloned()
            .unwrap_or(returned);
        if !seen.insert(address.to_ascii_lowercase()) {
            continue;
        }

        quotes.push(MarketQuote {
            chain_id: chain.to_string(),
            address,
            symbol: pair.base_token.symbol,
            price_change_m5: pair.price_change.and_then(|w| w.m5),
            volume_m5: pair.volume.and_then(|w| w.m5),
            market_cap: pair.market_cap,
        });
    }
    quotes
}

/// HTTP client for the DexScreener API
#[derive(Clone)]
pub struct DexScreenerClient {
    client: Client,
    base_url: String,
    max_attempts: u32,
    base_delay: Duration,
}

impl DexScreenerClient {
    pub fn new(settings: &MarketSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent("spikewatch/0.1")
            .build()
            .map_err(|e| SpikeError::Internal(format!("failed to build market HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            max_attempts: settings.max_retries.max(1),
            base_delay: Duration::from_millis(settings.retry_base_delay_ms),
        })
    }

    /// Delay after failed attempt `attempt` (1-based)
    fn backoff(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SpikeError::MarketFetch(format!("HTTP {}: {}", status, body)));
        }
        Ok(resp.json::<T>().await?)
    }

    /// GET with retries on network errors, timeouts and non-2xx answers
    async fn get_with_retry<T: serde::de::DeserializeOwned>(&self, url: &str) -> Result<T> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.get_json::<T>(url).await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.max_attempts && e.is_retryable() => {
                    let delay = self.backoff(attempt);
                    warn!(
                        "Market request failed (attempt {}/{}), retrying in {:?}: {}",
                        attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(SpikeError::MarketFetch(format!(
                        "{} after {} attempt(s): {}",
                        url, attempt, e
                    )))
                }
            }
        }
    }
}

#[async_trait]
impl MarketDataSource for DexScreenerClient {
    async fn fetch_chunk(&self, chain: &str, addresses: &[String]) -> Result<Vec<MarketQuote>> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/tokens/v1/{}/{}", self.base_url, chain, addresses.join(","));
        let pairs: Vec<Pair> = self.get_with_retry(&url).await?;
        debug!("Fetched {} pairs for {} {} tokens", pairs.len(), addresses.len(), chain);

        Ok(quotes_from_pairs(chain, addresses, pairs))
    }

    async fn lookup_chain_info(&self, address: &str) -> Result<Option<ChainInfo>> {
        let url = format!("{}/latest/dex/search?q={}", self.base_url, address);
        let resp: SearchResponse = self.get_with_retry(&url).await?;

        let Some(pair) = resp.pairs.and_then(|p| p.into_iter().next()) else {
            return Ok(None);
        };
        let Some(chain_id) = pair.chain_id else {
            return Ok(None);
        };

        Ok(Some(ChainInfo {
            chain_id,
            symbol: pair.base_token.symbol.unwrap_or_default(),
            name: pair.base_token.name.unwrap_or_default(),
        }))
    }
}
