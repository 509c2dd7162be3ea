//! Scripted collaborators for unit tests
//!
//! Keeps the pipeline testable without network access.

use crate::aggregator::{MarketDataProvider, WebSearchProvider};
use crate::error::{ErrorKind, OrchestrationError, ValidationErrorKind};
use crate::llm::{LlmClient, LlmRequest};
use crate::models::{SearchCandidate, TokenDetail, WebSearchQuery, WebSearchResult};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Build an error of the given kind
pub fn error_of(kind: ErrorKind) -> OrchestrationError {
    match kind {
        ErrorKind::Preprocessing => OrchestrationError::Preprocessing("scripted".into()),
        ErrorKind::Validation => {
            OrchestrationError::Validation(ValidationErrorKind::Schema("scripted".into()))
        }
        ErrorKind::Llm => OrchestrationError::Llm("scripted".into()),
        ErrorKind::Provider => OrchestrationError::Provider {
            provider: "scripted".into(),
            status: Some(500),
            message: "scripted".into(),
        },
        ErrorKind::RateLimit => OrchestrationError::RateLimit("scripted".into()),
        ErrorKind::Timeout => OrchestrationError::Timeout("scripted".into()),
        ErrorKind::Connection => OrchestrationError::Connection("scripted".into()),
        ErrorKind::Configuration => OrchestrationError::Configuration("scripted".into()),
        ErrorKind::Internal => OrchestrationError::Http("scripted".into()),
    }
}

#[derive(Debug, Clone)]
pub enum Script {
    Text(String),
    Fail(ErrorKind),
}

/// LLM double with separate queues for JSON (classification) and free-text
/// (summary) requests. The last entry of a queue repeats forever.
#[derive(Default)]
pub struct ScriptedLlm {
    classify: Mutex<VecDeque<Script>>,
    summarize: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn classify(self, script: Script) -> Self {
        self.classify.lock().unwrap().push_back(script);
        self
    }

    pub fn summarize(self, script: Script) -> Self {
        self.summarize.lock().unwrap().push_back(script);
        self
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn summary_requests(&self) -> Vec<LlmRequest> {
        self.requests()
            .into_iter()
            .filter(|r| !r.json_output)
            .collect()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: &LlmRequest) -> Result<String> {
        self.requests.lock().unwrap().push(request.clone());

        let queue = if request.json_output {
            &self.classify
        } else {
            &self.summarize
        };

        let script = {
            let mut queue = queue.lock().unwrap();
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        };

        match script {
            Some(Script::Text(text)) => Ok(text),
            Some(Script::Fail(kind)) => Err(error_of(kind)),
            None => Err(OrchestrationError::Llm("no scripted response".into())),
        }
    }
}

pub fn classification_payload(
    intent: &str,
    confidence: f64,
    tokens: &[&str],
    needs_api_call: bool,
    requires_web_search: bool,
) -> Value {
    json!({
        "classification": {
            "primaryIntent": intent,
            "confidence": confidence,
            "needsApiCall": needs_api_call,
            "ambiguityLevel": "low",
            "requiresWebSearch": requires_web_search
        },
        "queryAnalysis": {
            "sanitizedQuery": "scripted query",
            "detectedTokens": tokens,
            "comparisonRequest": {"isComparison": false, "tokens": [], "metrics": []},
            "detectedIntents": [intent],
            "timeContext": {"timeframe": null, "isHistorical": false},
            "marketIndicators": {"price": needs_api_call, "volume": false, "marketCap": false, "trend": false},
            "conceptualIndicators": [],
            "webSearchContext": {"needsNews": requires_web_search, "needsRegulatory": false, "needsSecurity": false, "searchTerms": []}
        },
        "dataRequirements": {
            "marketData": {"required": needs_api_call, "metrics": ["price"]},
            "conceptualData": {"required": false, "topics": []}
        }
    })
}

pub fn classification_json(
    intent: &str,
    confidence: f64,
    tokens: &[&str],
    needs_api_call: bool,
    requires_web_search: bool,
) -> String {
    classification_payload(intent, confidence, tokens, needs_api_call, requires_web_search)
        .to_string()
}

pub fn token_detail(id: &str, symbol: &str, name: &str, price: f64, source: &str) -> TokenDetail {
    TokenDetail {
        id: id.to_string(),
        symbol: symbol.to_string(),
        name: name.to_string(),
        price_usd: Some(price),
        market_cap_usd: Some(price * 19_000_000.0),
        volume_24h_usd: Some(25_000_000_000.0),
        change_24h_pct: Some(1.5),
        circulating_supply: Some(19_000_000.0),
        max_supply: Some(21_000_000.0),
        market_cap_rank: Some(1),
        source: source.to_string(),
        fetched_at: Utc::now(),
    }
}

/// In-memory market provider; `failure` makes every call fail
pub struct StaticMarketProvider {
    name: String,
    details: HashMap<String, TokenDetail>,
    failure: Option<ErrorKind>,
    calls: AtomicU32,
}

impl StaticMarketProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            details: HashMap::new(),
            failure: None,
            calls: AtomicU32::new(0),
        }
    }

    pub fn failing(name: &str, kind: ErrorKind) -> Self {
        Self {
            failure: Some(kind),
            ..Self::new(name)
        }
    }

    pub fn with_token(mut self, id: &str, symbol: &str, name: &str, price: f64) -> Self {
        let detail = token_detail(id, symbol, name, price, &self.name);
        self.details.insert(id.to_string(), detail);
        self
    }

    /// Serve a prepared detail as-is
    pub fn with_detail(mut self, detail: TokenDetail) -> Self {
        self.details.insert(detail.id.clone(), detail);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MarketDataProvider for StaticMarketProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str) -> Result<Vec<SearchCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.failure {
            return Err(error_of(kind));
        }

        let query = query.to_lowercase();
        Ok(self
            .details
            .values()
            .filter(|d| {
                d.id == query || d.symbol.to_lowercase() == query || d.name.to_lowercase() == query
            })
            .map(|d| SearchCandidate {
                id: d.id.clone(),
                symbol: d.symbol.clone(),
                name: d.name.clone(),
                market_cap_rank: d.market_cap_rank,
            })
            .collect())
    }

    async fn token_details(&self, id: &str) -> Result<TokenDetail> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(kind) = self.failure {
            return Err(error_of(kind));
        }

        self.details.get(id).cloned().ok_or_else(|| OrchestrationError::Provider {
            provider: self.name.clone(),
            status: Some(404),
            message: format!("{} not found", id),
        })
    }
}

/// In-memory web search returning a fixed result list
pub struct StaticWebSearch {
    results: Vec<WebSearchResult>,
    queries: Mutex<Vec<WebSearchQuery>>,
}

impl StaticWebSearch {
    pub fn new(titles: &[&str]) -> Self {
        Self {
            results: titles
                .iter()
                .map(|title| WebSearchResult {
                    title: title.to_string(),
                    url: format!("https://news.example/{}", title.len()),
                    snippet: format!("{} (snippet)", title),
                    published: None,
                    source: "static-search".to_string(),
                })
                .collect(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn queries(&self) -> Vec<WebSearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WebSearchProvider for StaticWebSearch {
    fn name(&self) -> &str {
        "static-search"
    }

    async fn search(&self, query: &WebSearchQuery) -> Result<Vec<WebSearchResult>> {
        self.queries.lock().unwrap().push(query.clone());
        Ok(self.results.clone())
    }
}
