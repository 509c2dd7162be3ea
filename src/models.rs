//! Core data models for the crypto chat orchestrator

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

//
// ================= Enums =================
//

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Intent {
    MarketData,
    Comparison,
    Technical,
    Educational,
    News,
    Regulatory,
    Security,
    Defi,
    General,
}

impl Intent {
    pub const ALL: [Intent; 9] = [
        Intent::MarketData,
        Intent::Comparison,
        Intent::Technical,
        Intent::Educational,
        Intent::News,
        Intent::Regulatory,
        Intent::Security,
        Intent::Defi,
        Intent::General,
    ];

    /// Wire name, e.g. `MARKET_DATA`
    pub fn as_str(self) -> &'static str {
        match self {
            Intent::MarketData => "MARKET_DATA",
            Intent::Comparison => "COMPARISON",
            Intent::Technical => "TECHNICAL",
            Intent::Educational => "EDUCATIONAL",
            Intent::News => "NEWS",
            Intent::Regulatory => "REGULATORY",
            Intent::Security => "SECURITY",
            Intent::Defi => "DEFI",
            Intent::General => "GENERAL",
        }
    }

    /// Lenient parse: accepts `market_data`, `Market Data`, `market-data`
    pub fn parse(raw: &str) -> Option<Intent> {
        let normalized = raw.trim().to_uppercase().replace(['-', ' '], "_");
        Intent::ALL
            .iter()
            .copied()
            .find(|intent| intent.as_str() == normalized)
    }

    /// Intents answered from price providers
    pub fn wants_market_data(self) -> bool {
        matches!(
            self,
            Intent::MarketData | Intent::Comparison | Intent::Technical
        )
    }

    /// Intents answered from web search
    pub fn wants_web_search(self) -> bool {
        matches!(self, Intent::News | Intent::Regulatory | Intent::Security)
    }
}

impl fmt::Display for Intent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Intent::MarketData => "market data",
            Intent::Comparison => "comparison",
            Intent::Technical => "technical analysis",
            Intent::Educational => "crypto education",
            Intent::News => "news",
            Intent::Regulatory => "regulation",
            Intent::Security => "security",
            Intent::Defi => "DeFi",
            Intent::General => "general questions",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AmbiguityLevel {
    Low,
    Medium,
    High,
}

impl AmbiguityLevel {
    pub fn parse(raw: &str) -> Option<AmbiguityLevel> {
        match raw.trim().to_lowercase().as_str() {
            "low" => Some(AmbiguityLevel::Low),
            "medium" => Some(AmbiguityLevel::Medium),
            "high" => Some(AmbiguityLevel::High),
            _ => None,
        }
    }
}

//
// ================= Analysis =================
//

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComparisonRequest {
    pub is_comparison: bool,
    pub tokens: Vec<String>,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TimeContext {
    pub timeframe: Option<String>,
    pub is_historical: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarketIndicators {
    pub price: bool,
    pub volume: bool,
    pub market_cap: bool,
    pub trend: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WebSearchContext {
    pub needs_news: bool,
    pub needs_regulatory: bool,
    pub needs_security: bool,
    pub search_terms: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct MarketDataRequirement {
    pub required: bool,
    pub metrics: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ConceptualDataRequirement {
    pub required: bool,
    pub topics: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DataRequirements {
    pub market_data: MarketDataRequirement,
    pub conceptual_data: ConceptualDataRequirement,
}

/// Validated classification of one query.
///
/// Only built by the schema validator; fields are never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Analysis {
    pub primary_intent: Intent,
    pub confidence: f64,
    pub needs_api_call: bool,
    pub ambiguity_level: AmbiguityLevel,
    pub requires_web_search: bool,
    pub sanitized_query: String,
    pub detected_tokens: Vec<String>,
    pub comparison: ComparisonRequest,
    pub detected_intents: Vec<Intent>,
    pub time_context: TimeContext,
    pub market_indicators: MarketIndicators,
    pub conceptual_indicators: Vec<String>,
    pub web_search_context: WebSearchContext,
    pub data_requirements: DataRequirements,
}

//
// ================= Market Data =================
//

/// One hit from a provider's search endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchCandidate {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub market_cap_rank: Option<u32>,
}

/// Canonical token detail, regardless of which provider produced it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TokenDetail {
    pub id: String,
    pub symbol: String,
    pub name: String,
    pub price_usd: Option<f64>,
    pub market_cap_usd: Option<f64>,
    pub volume_24h_usd: Option<f64>,
    pub change_24h_pct: Option<f64>,
    pub circulating_supply: Option<f64>,
    pub max_supply: Option<f64>,
    pub market_cap_rank: Option<u32>,
    pub source: String,
    pub fetched_at: DateTime<Utc>,
}

impl TokenDetail {
    /// False when the provider matched the token but reported no price,
    /// market cap or volume
    pub fn has_figures(&self) -> bool {
        self.price_usd.is_some() || self.market_cap_usd.is_some() || self.volume_24h_usd.is_some()
    }
}

/// One web search hit (news, regulatory or security coverage)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchResult {
    pub title: String,
    pub url: String,
    pub snippet: String,
    pub published: Option<String>,
    pub source: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SearchFocus {
    General,
    News,
    Regulatory,
    Security,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WebSearchQuery {
    pub query: String,
    pub focus: SearchFocus,
}

/// Fetch plan for one query
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorSpec {
    /// Canonical token identifiers to resolve, in request order
    pub tokens: Vec<String>,
    /// Market-data providers in fallback order
    pub market_providers: Vec<String>,
    pub web_search: Option<WebSearchQuery>,
}

impl AggregatorSpec {
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.web_search.is_none()
    }
}

/// Provider attempt that did not yield data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderFailure {
    pub provider: String,
    pub token: Option<String>,
    pub reason: String,
}

/// Outcome of one fetch plan; missing tokens are simply absent
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregatorResult {
    /// Details served by the first provider in the chain, keyed by token
    pub primary: BTreeMap<String, TokenDetail>,
    /// Details served by a fallback provider, keyed by token
    pub fallback: BTreeMap<String, TokenDetail>,
    pub web_results: Vec<WebSearchResult>,
    pub failures: Vec<ProviderFailure>,
}

impl AggregatorResult {
    pub fn has_usable_data(&self) -> bool {
        !self.primary.is_empty() || !self.fallback.is_empty() || !self.web_results.is_empty()
    }

    /// All token details, primary first
    pub fn token_details(&self) -> impl Iterator<Item = &TokenDetail> {
        self.primary.values().chain(self.fallback.values())
    }

    pub fn detail_for(&self, token: &str) -> Option<&TokenDetail> {
        self.primary.get(token).or_else(|| self.fallback.get(token))
    }
}

//
// ================= Final Result =================
//

/// Continuity view returned alongside each answer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContextAnalysis {
    pub is_coherent: bool,
    pub confidence: f64,
    pub suggested_follow_up: Option<String>,
    pub continuity_score: f64,
    pub related_topics: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessQueryResult {
    pub session_id: String,
    pub analysis: Analysis,
    pub aggregator_data: Option<AggregatorResult>,
    pub response: String,
    pub suggestions: Vec<String>,
    pub context_analysis: ContextAnalysis,
}
