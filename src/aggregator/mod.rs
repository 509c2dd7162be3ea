//! Data Aggregator
//!
//! `plan` turns an `Analysis` into an `AggregatorSpec` without any I/O;
//! `execute` walks each token through the market-data fallback chain and
//! runs the optional web search. Missing tokens are simply absent from the
//! result: a partial result is a success.

pub mod providers;
pub mod rate_limit;

pub use providers::{
    select_best_match, CoinCapProvider, CoinGeckoProvider, MarketDataProvider,
    TavilySearchProvider, WebSearchProvider,
};
pub use rate_limit::RateBudget;

use crate::classifier::MAX_TOKENS;
use crate::config::{ProviderConfig, ProvidersConfig};
use crate::error::OrchestrationError;
use crate::models::{
    AggregatorResult, AggregatorSpec, Analysis, Intent, ProviderFailure, SearchFocus,
    TokenDetail, WebSearchQuery,
};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info, warn};

struct MarketSlot {
    provider: Arc<dyn MarketDataProvider>,
    budget: RateBudget,
}

struct WebSlot {
    provider: Arc<dyn WebSearchProvider>,
    budget: RateBudget,
}

/// Collects failures while a plan executes and remembers whether every
/// one of them was transient
#[derive(Default)]
struct FailureLog {
    failures: Vec<ProviderFailure>,
    last_transient: Option<OrchestrationError>,
    saw_permanent: bool,
}

impl FailureLog {
    fn record(&mut self, provider: &str, token: Option<&str>, error: OrchestrationError) {
        warn!(
            provider,
            token = token.unwrap_or("-"),
            error = %error,
            "Provider attempt failed"
        );

        self.failures.push(ProviderFailure {
            provider: provider.to_string(),
            token: token.map(str::to_string),
            reason: error.to_string(),
        });

        if error.is_transient() {
            self.last_transient = Some(error);
        } else {
            self.saw_permanent = true;
        }
    }
}

fn budget_exhausted(provider: &str) -> OrchestrationError {
    OrchestrationError::RateLimit(format!("{} call budget exhausted for this window", provider))
}

pub struct DataAggregator {
    market: Vec<MarketSlot>,
    web: Option<WebSlot>,
}

impl DataAggregator {
    pub fn new() -> Self {
        Self {
            market: Vec::new(),
            web: None,
        }
    }

    /// Append a market-data provider; registration order is fallback order
    pub fn with_market_provider(
        mut self,
        provider: Arc<dyn MarketDataProvider>,
        budget: RateBudget,
    ) -> Self {
        self.market.push(MarketSlot { provider, budget });
        self
    }

    pub fn with_web_search(mut self, provider: Arc<dyn WebSearchProvider>, budget: RateBudget) -> Self {
        self.web = Some(WebSlot { provider, budget });
        self
    }

    /// CoinGecko first, CoinCap as fallback, Tavily when a key is present
    pub fn from_config(config: &ProvidersConfig) -> Result<Self> {
        let mut aggregator = Self::new()
            .with_market_provider(
                Arc::new(CoinGeckoProvider::new(&config.coingecko)?),
                budget_for(&config.coingecko),
            )
            .with_market_provider(
                Arc::new(CoinCapProvider::new(&config.coincap)?),
                budget_for(&config.coincap),
            );

        if let Some(search) = TavilySearchProvider::from_config(&config.web_search)? {
            aggregator = aggregator.with_web_search(Arc::new(search), budget_for(&config.web_search));
        }

        Ok(aggregator)
    }

    pub fn market_provider_names(&self) -> Vec<String> {
        self.market
            .iter()
            .map(|slot| slot.provider.name().to_string())
            .collect()
    }

    pub fn has_web_search(&self) -> bool {
        self.web.is_some()
    }

    // ===== Planning =====

    /// Decide what to fetch for a query. Pure: no provider is contacted.
    pub fn plan(&self, analysis: &Analysis) -> AggregatorSpec {
        if !analysis.needs_api_call && !analysis.requires_web_search {
            return AggregatorSpec::default();
        }

        let intent = analysis.primary_intent;
        let mut spec = AggregatorSpec::default();

        if analysis.needs_api_call || intent.wants_market_data() {
            for token in analysis
                .detected_tokens
                .iter()
                .chain(analysis.comparison.tokens.iter())
            {
                if !spec.tokens.contains(token) {
                    spec.tokens.push(token.clone());
                }
            }
            spec.tokens.truncate(MAX_TOKENS);

            if !spec.tokens.is_empty() {
                spec.market_providers = self.market_provider_names();
            }
        }

        if (analysis.requires_web_search || intent.wants_web_search()) && self.web.is_some() {
            spec.web_search = Some(web_query(analysis));
        }

        debug!(
            tokens = ?spec.tokens,
            providers = ?spec.market_providers,
            web_search = spec.web_search.is_some(),
            "Aggregation planned"
        );

        spec
    }

    // ===== Execution =====

    /// Run a plan.
    ///
    /// Returns `Ok` whenever anything usable came back, or when at least
    /// one failure was permanent. Fails with the last transient error only
    /// if nothing usable came back and every failure was transient, so the
    /// caller's retry can try again.
    pub async fn execute(&self, spec: &AggregatorSpec) -> Result<AggregatorResult> {
        let mut result = AggregatorResult::default();
        let mut log = FailureLog::default();

        let chain: Vec<&MarketSlot> = spec
            .market_providers
            .iter()
            .filter_map(|name| self.market.iter().find(|s| s.provider.name() == name))
            .collect();

        for token in &spec.tokens {
            match self.fetch_token(token, &chain, &mut log).await {
                Some((0, detail)) => {
                    result.primary.insert(token.clone(), detail);
                }
                Some((_, detail)) => {
                    result.fallback.insert(token.clone(), detail);
                }
                None => debug!(token = %token, "Token absent from result"),
            }
        }

        if let (Some(query), Some(web)) = (&spec.web_search, &self.web) {
            let name = web.provider.name();
            if !web.budget.try_acquire() {
                log.record(name, None, budget_exhausted(name));
            } else {
                match web.provider.search(query).await {
                    Ok(hits) => result.web_results = hits,
                    Err(e) => log.record(name, None, e),
                }
            }
        }

        result.failures = log.failures;

        info!(
            primary = result.primary.len(),
            fallback = result.fallback.len(),
            web_results = result.web_results.len(),
            failures = result.failures.len(),
            "Aggregation finished"
        );

        if !result.has_usable_data() && !log.saw_permanent {
            if let Some(error) = log.last_transient {
                return Err(error);
            }
        }

        Ok(result)
    }

    /// Walk the chain for one token; returns the serving provider's
    /// position and the detail
    async fn fetch_token(
        &self,
        token: &str,
        chain: &[&MarketSlot],
        log: &mut FailureLog,
    ) -> Option<(usize, TokenDetail)> {
        for (position, slot) in chain.iter().enumerate() {
            let name = slot.provider.name();

            match fetch_from(slot, token).await {
                Ok(detail) => {
                    if position > 0 {
                        info!(provider = name, token, "Served by fallback provider");
                    }
                    return Some((position, detail));
                }
                Err(e) => log.record(name, Some(token), e),
            }
        }
        None
    }
}

impl Default for DataAggregator {
    fn default() -> Self {
        Self::new()
    }
}

/// Search-then-fetch against a single provider
async fn fetch_from(slot: &MarketSlot, token: &str) -> Result<TokenDetail> {
    let name = slot.provider.name();

    if !slot.budget.try_acquire() {
        return Err(budget_exhausted(name));
    }
    let candidates = slot.provider.search(token).await?;

    let best = select_best_match(token, &candidates).ok_or_else(|| OrchestrationError::Provider {
        provider: name.to_string(),
        status: None,
        message: format!("no match for '{}'", token),
    })?;

    if !slot.budget.try_acquire() {
        return Err(budget_exhausted(name));
    }
    let detail = slot.provider.token_details(&best.id).await?;

    if !detail.has_figures() {
        return Err(OrchestrationError::Provider {
            provider: name.to_string(),
            status: None,
            message: format!("no market figures for '{}'", best.id),
        });
    }
    Ok(detail)
}

fn budget_for(config: &ProviderConfig) -> RateBudget {
    RateBudget::new(config.calls_per_window, config.window)
}

fn web_query(analysis: &Analysis) -> WebSearchQuery {
    let context = &analysis.web_search_context;

    let focus = if context.needs_security || analysis.primary_intent == Intent::Security {
        SearchFocus::Security
    } else if context.needs_regulatory || analysis.primary_intent == Intent::Regulatory {
        SearchFocus::Regulatory
    } else if context.needs_news || analysis.primary_intent == Intent::News {
        SearchFocus::News
    } else {
        SearchFocus::General
    };

    let query = if context.search_terms.is_empty() {
        analysis.sanitized_query.clone()
    } else {
        context.search_terms.join(" ")
    };

    WebSearchQuery { query, focus }
}
