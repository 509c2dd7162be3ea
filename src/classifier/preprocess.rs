//! Query preprocessing
//!
//! Runs before any network call: sanitizes the raw query, rewrites ticker
//! abbreviations to canonical identifiers, pulls candidate tokens and
//! derives keyword hints for the classifier prompt.

use crate::error::OrchestrationError;
use crate::Result;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Maximum detected tokens carried by any analysis
pub const MAX_TOKENS: usize = 5;

/// Queries longer than this are cut before classification
pub const MAX_QUERY_CHARS: usize = 500;

/// Static ticker table: abbreviation to canonical identifier
const TICKERS: &[(&str, &str)] = &[
    ("btc", "bitcoin"),
    ("xbt", "bitcoin"),
    ("eth", "ethereum"),
    ("sol", "solana"),
    ("ada", "cardano"),
    ("dot", "polkadot"),
    ("doge", "dogecoin"),
    ("xrp", "ripple"),
    ("bnb", "binancecoin"),
    ("ltc", "litecoin"),
    ("matic", "polygon"),
    ("avax", "avalanche-2"),
    ("shib", "shiba-inu"),
    ("usdt", "tether"),
    ("usdc", "usd-coin"),
    ("trx", "tron"),
    ("xlm", "stellar"),
    ("xmr", "monero"),
    ("bch", "bitcoin-cash"),
    ("arb", "arbitrum"),
    ("apt", "aptos"),
    ("sui", "sui"),
    ("pepe", "pepe"),
];

/// Identifiers recognised even without a ticker in front of them
const EXTRA_IDENTIFIERS: &[&str] = &[
    "chainlink", "uniswap", "cosmos", "near", "aave", "maker", "toncoin", "filecoin",
    "hedera", "algorand", "tezos", "dai",
];

const STOP_WORDS: &[&str] = &[
    // Question scaffolding
    "what", "whats", "s", "is", "are", "was", "were", "be", "been", "the", "a", "an", "of",
    "to", "for", "in", "on", "at", "by", "and", "or", "with", "about", "how", "why", "when",
    "where", "who", "which", "does", "do", "did", "can", "could", "should", "would", "will",
    "i", "me", "my", "you", "your", "it", "its", "this", "that", "these", "those", "there",
    "tell", "show", "give", "get", "explain", "much", "many", "any", "some", "please", "now",
    "today", "right", "currently", "current", "latest", "recent", "than", "then", "vs",
    "versus", "between", "doing", "going", "up", "down", "if", "so", "not", "no", "yes",
    "ll", "ve", "re", "t", "d", "m",
    // Market vocabulary that is never a token
    "price", "prices", "cost", "value", "worth", "market", "cap", "marketcap", "volume",
    "trend", "trends", "chart", "compare", "comparison", "news", "buy", "sell", "invest",
    "investing", "performance", "performing", "crypto", "cryptocurrency", "coin", "coins",
    "token", "tokens", "usd", "dollar", "dollars", "week", "month", "year", "day", "hour",
    "last", "past", "next", "good", "bad", "better", "best",
];

lazy_static! {
    static ref TICKER_MAP: HashMap<&'static str, &'static str> = TICKERS.iter().copied().collect();

    static ref TICKER_PATTERN: Regex = {
        let alternation = TICKERS
            .iter()
            .map(|(ticker, _)| regex::escape(ticker))
            .collect::<Vec<_>>()
            .join("|");
        Regex::new(&format!(r"\b(?:{})\b", alternation)).expect("ticker pattern is valid")
    };

    static ref KNOWN_IDENTIFIERS: HashSet<&'static str> = TICKERS
        .iter()
        .map(|(_, id)| *id)
        .chain(EXTRA_IDENTIFIERS.iter().copied())
        .collect();

    static ref STOP_WORD_SET: HashSet<&'static str> = STOP_WORDS.iter().copied().collect();
}

/// Keyword hints taken from the query as the user typed it.
///
/// Matching is case-sensitive against the original text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextHints {
    pub price: bool,
    pub compare: bool,
    pub trend: bool,
    pub education: bool,
    pub news: bool,
    pub regulatory: bool,
    pub security: bool,
    pub defi: bool,
}

const PRICE_KEYWORDS: &[&str] = &["price", "cost", "worth", "value", "$"];
const COMPARE_KEYWORDS: &[&str] = &["compare", " vs ", "versus", "better than", "difference between"];
const TREND_KEYWORDS: &[&str] = &["trend", "going up", "going down", "pump", "dump", "chart", "history", "last week", "last month"];
const EDUCATION_KEYWORDS: &[&str] = &["what is", "what are", "how does", "how do", "explain", "learn", "beginner"];
const NEWS_KEYWORDS: &[&str] = &["news", "latest", "announcement", "headline", "update"];
const REGULATORY_KEYWORDS: &[&str] = &["regulation", "regulatory", "SEC", "legal", "ban", "tax", "law", "compliance"];
const SECURITY_KEYWORDS: &[&str] = &["hack", "scam", "exploit", "security", "rug", "phishing", "safe"];
const DEFI_KEYWORDS: &[&str] = &["defi", "DeFi", "yield", "staking", "liquidity", "lending", "swap", "farm"];

impl ContextHints {
    pub fn from_original(text: &str) -> Self {
        let has_any = |keywords: &[&str]| keywords.iter().any(|k| text.contains(k));

        Self {
            price: has_any(PRICE_KEYWORDS),
            compare: has_any(COMPARE_KEYWORDS),
            trend: has_any(TREND_KEYWORDS),
            education: has_any(EDUCATION_KEYWORDS),
            news: has_any(NEWS_KEYWORDS),
            regulatory: has_any(REGULATORY_KEYWORDS),
            security: has_any(SECURITY_KEYWORDS),
            defi: has_any(DEFI_KEYWORDS),
        }
    }

    /// Names of the hints that fired, in a fixed order
    pub fn active(&self) -> Vec<&'static str> {
        [
            (self.price, "price"),
            (self.compare, "compare"),
            (self.trend, "trend"),
            (self.education, "education"),
            (self.news, "news"),
            (self.regulatory, "regulatory"),
            (self.security, "security"),
            (self.defi, "defi"),
        ]
        .iter()
        .filter(|(on, _)| *on)
        .map(|(_, name)| *name)
        .collect()
    }
}

/// Output of preprocessing, fed to the classifier prompt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessedQuery {
    pub original: String,
    /// Lowercased, ticker-normalized query
    pub sanitized: String,
    /// Up to five candidate tokens, in encounter order
    pub candidate_tokens: Vec<String>,
    pub hints: ContextHints,
}

pub fn preprocess(raw: &str) -> Result<PreprocessedQuery> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(OrchestrationError::Preprocessing(
            "query is empty".to_string(),
        ));
    }

    let cleaned = clean(trimmed);
    if !cleaned.chars().any(char::is_alphanumeric) {
        return Err(OrchestrationError::Preprocessing(
            "query contains no readable text".to_string(),
        ));
    }

    let sanitized = normalize_tickers(&cleaned.to_lowercase());
    let candidate_tokens = extract_tokens(&sanitized);

    Ok(PreprocessedQuery {
        original: trimmed.to_string(),
        sanitized,
        candidate_tokens,
        hints: ContextHints::from_original(trimmed),
    })
}

/// Drop control and markup characters, collapse whitespace, cap length
fn clean(text: &str) -> String {
    let kept: String = text
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || "?!.,'$%-/&+:()#".contains(*c))
        .take(MAX_QUERY_CHARS)
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Whole-word replacement of ticker abbreviations; expects lowercase input
pub fn normalize_tickers(text: &str) -> String {
    TICKER_PATTERN
        .replace_all(text, |caps: &regex::Captures| {
            TICKER_MAP
                .get(&caps[0])
                .copied()
                .unwrap_or(&caps[0])
                .to_string()
        })
        .into_owned()
}

/// Lowercase a token and map a ticker to its canonical identifier
pub fn canonical_token(raw: &str) -> String {
    let lowered = raw.trim().trim_start_matches('$').to_lowercase();
    TICKER_MAP
        .get(lowered.as_str())
        .map(|id| id.to_string())
        .unwrap_or(lowered)
}

pub fn is_known_identifier(token: &str) -> bool {
    KNOWN_IDENTIFIERS.contains(token)
}

/// Candidate tokens from a normalized query, deduplicated, at most five
pub fn extract_tokens(normalized: &str) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::with_capacity(MAX_TOKENS);

    for word in normalized.split(|c: char| !(c.is_alphanumeric() || c == '-')) {
        let word = word.trim_matches('-');
        if word.is_empty() || STOP_WORD_SET.contains(word) {
            continue;
        }

        let keep = is_known_identifier(word)
            || (word.len() >= 2
                && word.chars().all(char::is_alphanumeric)
                && !word.chars().all(|c| c.is_ascii_digit()));

        if keep && !tokens.iter().any(|t| t == word) {
            tokens.push(word.to_string());
            if tokens.len() == MAX_TOKENS {
                break;
            }
        }
    }

    tokens
}
