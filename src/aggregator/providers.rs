//! Market-data and web-search providers
//!
//! Every provider normalizes its wire format into `SearchCandidate`,
//! `TokenDetail` and `WebSearchResult`. HTTP 429 surfaces as `RateLimit`;
//! any other non-2xx status is a `Provider` error so the aggregator can
//! fall through to the next provider.

use crate::config::ProviderConfig;
use crate::error::OrchestrationError;
use crate::models::{SearchCandidate, SearchFocus, TokenDetail, WebSearchQuery, WebSearchResult};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Source of token prices, market cap, volume and supply
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Search by symbol or name
    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>>;

    /// Fetch details for a provider-specific id
    async fn token_details(&self, id: &str) -> Result<TokenDetail>;
}

/// Source of news, regulatory and security coverage
#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn search(&self, query: &WebSearchQuery) -> Result<Vec<WebSearchResult>>;
}

/// Pick the candidate for `query`: exact symbol, then exact name, then the
/// best (lowest) market-cap rank. Unranked candidates sort last.
pub fn select_best_match<'a>(
    query: &str,
    candidates: &'a [SearchCandidate],
) -> Option<&'a SearchCandidate> {
    let query = query.trim().to_lowercase();

    candidates
        .iter()
        .find(|c| c.symbol.to_lowercase() == query)
        .or_else(|| candidates.iter().find(|c| c.name.to_lowercase() == query))
        .or_else(|| {
            candidates
                .iter()
                .min_by_key(|c| c.market_cap_rank.unwrap_or(u32::MAX))
        })
}

fn http_client(timeout: Duration) -> Result<Client> {
    Ok(Client::builder()
        .pool_idle_timeout(Duration::from_secs(60))
        .pool_max_idle_per_host(8)
        .timeout(timeout)
        .build()?)
}

/// Send a request and decode a JSON body, mapping status codes into the
/// error taxonomy
async fn send_json<T: DeserializeOwned>(source: &str, request: RequestBuilder) -> Result<T> {
    let response = request.send().await?;
    let status = response.status();

    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(OrchestrationError::from_status(source, status, &body));
    }

    response
        .json::<T>()
        .await
        .map_err(|e| OrchestrationError::Provider {
            provider: source.to_string(),
            status: Some(status.as_u16()),
            message: format!("invalid JSON body: {}", e),
        })
}

// ===== CoinGecko =====

#[derive(Debug, Deserialize)]
struct GeckoSearchResponse {
    #[serde(default)]
    coins: Vec<GeckoCoin>,
}

#[derive(Debug, Deserialize)]
struct GeckoCoin {
    id: String,
    symbol: String,
    name: String,
    market_cap_rank: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GeckoCoinDetail {
    id: String,
    symbol: String,
    name: String,
    market_cap_rank: Option<u32>,
    market_data: Option<GeckoMarketData>,
}

#[derive(Debug, Default, Deserialize)]
struct GeckoMarketData {
    #[serde(default)]
    current_price: UsdQuote,
    #[serde(default)]
    market_cap: UsdQuote,
    #[serde(default)]
    total_volume: UsdQuote,
    price_change_percentage_24h: Option<f64>,
    circulating_supply: Option<f64>,
    max_supply: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct UsdQuote {
    usd: Option<f64>,
}

pub struct CoinGeckoProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinGeckoProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(15))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.header("x-cg-demo-api-key", key),
            None => request,
        }
    }
}

#[async_trait]
impl MarketDataProvider for CoinGeckoProvider {
    fn name(&self) -> &str {
        "coingecko"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>> {
        debug!(provider = "coingecko", query, "Searching tokens");

        let response: GeckoSearchResponse =
            send_json("coingecko", self.get("/search").query(&[("query", query)])).await?;

        Ok(response
            .coins
            .into_iter()
            .map(|c| SearchCandidate {
                id: c.id,
                symbol: c.symbol,
                name: c.name,
                market_cap_rank: c.market_cap_rank,
            })
            .collect())
    }

    async fn token_details(&self, id: &str) -> Result<TokenDetail> {
        let request = self.get(&format!("/coins/{}", id)).query(&[
            ("localization", "false"),
            ("tickers", "false"),
            ("community_data", "false"),
            ("developer_data", "false"),
        ]);
        let coin: GeckoCoinDetail = send_json("coingecko", request).await?;
        let market = coin.market_data.unwrap_or_default();

        Ok(TokenDetail {
            id: coin.id,
            symbol: coin.symbol.to_uppercase(),
            name: coin.name,
            price_usd: market.current_price.usd,
            market_cap_usd: market.market_cap.usd,
            volume_24h_usd: market.total_volume.usd,
            change_24h_pct: market.price_change_percentage_24h,
            circulating_supply: market.circulating_supply,
            max_supply: market.max_supply,
            market_cap_rank: coin.market_cap_rank,
            source: "coingecko".to_string(),
            fetched_at: Utc::now(),
        })
    }
}

// ===== CoinCap =====

#[derive(Debug, Deserialize)]
struct CapEnvelope<T> {
    data: T,
}

/// CoinCap serializes every number as a string
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapAsset {
    id: String,
    symbol: String,
    name: String,
    rank: Option<String>,
    supply: Option<String>,
    max_supply: Option<String>,
    market_cap_usd: Option<String>,
    volume_usd24_hr: Option<String>,
    price_usd: Option<String>,
    change_percent24_hr: Option<String>,
}

fn parse_number(raw: &Option<String>) -> Option<f64> {
    raw.as_deref().and_then(|v| v.trim().parse().ok())
}

pub struct CoinCapProvider {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl CoinCapProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        Ok(Self {
            client: http_client(Duration::from_secs(15))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl MarketDataProvider for CoinCapProvider {
    fn name(&self) -> &str {
        "coincap"
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>> {
        debug!(provider = "coincap", query, "Searching tokens");

        let response: CapEnvelope<Vec<CapAsset>> = send_json(
            "coincap",
            self.get("/assets").query(&[("search", query), ("limit", "10")]),
        )
        .await?;

        Ok(response
            .data
            .into_iter()
            .map(|a| SearchCandidate {
                market_cap_rank: a.rank.as_deref().and_then(|r| r.parse().ok()),
                id: a.id,
                symbol: a.symbol,
                name: a.name,
            })
            .collect())
    }

    async fn token_details(&self, id: &str) -> Result<TokenDetail> {
        let response: CapEnvelope<CapAsset> =
            send_json("coincap", self.get(&format!("/assets/{}", id))).await?;
        let asset = response.data;

        Ok(TokenDetail {
            price_usd: parse_number(&asset.price_usd),
            market_cap_usd: parse_number(&asset.market_cap_usd),
            volume_24h_usd: parse_number(&asset.volume_usd24_hr),
            change_24h_pct: parse_number(&asset.change_percent24_hr),
            circulating_supply: parse_number(&asset.supply),
            max_supply: parse_number(&asset.max_supply),
            market_cap_rank: asset.rank.as_deref().and_then(|r| r.parse().ok()),
            id: asset.id,
            symbol: asset.symbol.to_uppercase(),
            name: asset.name,
            source: "coincap".to_string(),
            fetched_at: Utc::now(),
        })
    }
}

// ===== Tavily web search =====

#[derive(Debug, Serialize)]
struct TavilyRequest<'a> {
    api_key: &'a str,
    query: &'a str,
    max_results: u32,
    topic: &'a str,
}

#[derive(Debug, Deserialize)]
struct TavilyResponse {
    #[serde(default)]
    results: Vec<TavilyHit>,
}

#[derive(Debug, Deserialize)]
struct TavilyHit {
    title: String,
    url: String,
    #[serde(default)]
    content: String,
    published_date: Option<String>,
}

pub struct TavilySearchProvider {
    client: Client,
    base_url: String,
    api_key: String,
    max_results: u32,
}

impl TavilySearchProvider {
    /// `None` when no key is configured; web search is then disabled
    pub fn from_config(config: &ProviderConfig) -> Result<Option<Self>> {
        let Some(api_key) = config.api_key.clone() else {
            return Ok(None);
        };

        Ok(Some(Self {
            client: http_client(Duration::from_secs(20))?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            max_results: 5,
        }))
    }
}

#[async_trait]
impl WebSearchProvider for TavilySearchProvider {
    fn name(&self) -> &str {
        "tavily"
    }

    async fn search(&self, query: &WebSearchQuery) -> Result<Vec<WebSearchResult>> {
        let topic = match query.focus {
            SearchFocus::News => "news",
            _ => "general",
        };
        let body = TavilyRequest {
            api_key: &self.api_key,
            query: &query.query,
            max_results: self.max_results,
            topic,
        };

        debug!(provider = "tavily", query = %query.query, topic, "Running web search");

        let response: TavilyResponse = send_json(
            "tavily",
            self.client
                .post(format!("{}/search", self.base_url))
                .json(&body),
        )
        .await?;

        Ok(response
            .results
            .into_iter()
            .map(|hit| WebSearchResult {
                title: hit.title,
                url: hit.url,
                snippet: hit.content,
                published: hit.published_date,
                source: "tavily".to_string(),
            })
            .collect())
    }
}
