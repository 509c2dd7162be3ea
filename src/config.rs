//! Environment-driven configuration
//!
//! Values come from the process environment, optionally seeded from a
//! `.env` file by the binary. Missing provider keys degrade functionality;
//! a missing LLM key is only fatal once a query is processed.

use crate::error::OrchestrationError;
use crate::Result;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

const PLACEHOLDER_KEY: &str = "your_gemini_api_key_here";

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Calls allowed per `window`
    pub calls_per_window: u32,
    pub window: Duration,
}

#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub coingecko: ProviderConfig,
    pub coincap: ProviderConfig,
    pub web_search: ProviderConfig,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub max_messages: usize,
    pub expiry: Duration,
    pub sweep_interval: Duration,
    /// Idle time after which a topic's ranking is discounted
    pub topic_decay_window: Duration,
    /// Topics mentioned within this window count as related
    pub recency_window: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_messages: 50,
            expiry: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(5 * 60),
            topic_decay_window: Duration::from_secs(30 * 60),
            recency_window: Duration::from_secs(5 * 60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub step_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            step_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub llm: LlmConfig,
    pub providers: ProvidersConfig,
    pub session: SessionConfig,
    pub retry: RetryConfig,
    /// Fixed seed for suggestion ordering; entropy when unset
    pub suggestion_seed: Option<u64>,
}

impl Config {
    pub fn from_env() -> Self {
        let minute = Duration::from_secs(60);

        Self {
            llm: LlmConfig {
                api_key: env_key("GEMINI_API_KEY"),
                model: env_or("GEMINI_MODEL", "gemini-2.0-flash".to_string()),
                base_url: env_or(
                    "GEMINI_BASE_URL",
                    "https://generativelanguage.googleapis.com/v1beta".to_string(),
                ),
                request_timeout: Duration::from_secs(env_or("LLM_TIMEOUT_SECS", 30)),
            },
            providers: ProvidersConfig {
                coingecko: ProviderConfig {
                    base_url: env_or(
                        "COINGECKO_BASE_URL",
                        "https://api.coingecko.com/api/v3".to_string(),
                    ),
                    api_key: env_key("COINGECKO_API_KEY"),
                    calls_per_window: env_or("COINGECKO_CALLS_PER_MINUTE", 30),
                    window: minute,
                },
                coincap: ProviderConfig {
                    base_url: env_or(
                        "COINCAP_BASE_URL",
                        "https://api.coincap.io/v2".to_string(),
                    ),
                    api_key: env_key("COINCAP_API_KEY"),
                    calls_per_window: env_or("COINCAP_CALLS_PER_MINUTE", 200),
                    window: minute,
                },
                web_search: ProviderConfig {
                    base_url: env_or(
                        "WEB_SEARCH_BASE_URL",
                        "https://api.tavily.com".to_string(),
                    ),
                    api_key: env_key("WEB_SEARCH_API_KEY"),
                    calls_per_window: env_or("WEB_SEARCH_CALLS_PER_MINUTE", 20),
                    window: minute,
                },
            },
            session: SessionConfig {
                max_messages: env_or("SESSION_MAX_MESSAGES", 50),
                expiry: Duration::from_secs(env_or("SESSION_EXPIRY_SECS", 3600)),
                sweep_interval: Duration::from_secs(env_or("SESSION_SWEEP_INTERVAL_SECS", 300)),
                topic_decay_window: Duration::from_secs(env_or("TOPIC_DECAY_WINDOW_SECS", 1800)),
                recency_window: Duration::from_secs(env_or("TOPIC_RECENCY_WINDOW_SECS", 300)),
            },
            retry: RetryConfig {
                max_attempts: env_or("RETRY_MAX_ATTEMPTS", 3u32).max(1),
                base_delay: Duration::from_millis(env_or("RETRY_BASE_DELAY_MS", 1000)),
                step_timeout: Duration::from_secs(env_or("STEP_TIMEOUT_SECS", 30)),
            },
            suggestion_seed: env::var("SUGGESTION_SEED")
                .ok()
                .and_then(|v| v.trim().parse().ok()),
        }
    }

    /// The LLM key is the only credential a query cannot proceed without
    pub fn require_llm(&self) -> Result<&str> {
        self.llm.api_key.as_deref().ok_or_else(|| {
            OrchestrationError::Configuration(
                "GEMINI_API_KEY is not configured".to_string(),
            )
        })
    }

    /// Human-readable notes about features running degraded
    pub fn warnings(&self) -> Vec<String> {
        let mut notes = Vec::new();

        if self.llm.api_key.is_none() {
            notes.push("GEMINI_API_KEY not set; every query will fail until it is configured".to_string());
        }
        if self.providers.coingecko.api_key.is_none() {
            notes.push("COINGECKO_API_KEY not set; using the public CoinGecko tier".to_string());
        }
        if self.providers.coincap.api_key.is_none() {
            notes.push("COINCAP_API_KEY not set; using the public CoinCap tier".to_string());
        }
        if self.providers.web_search.api_key.is_none() {
            notes.push("WEB_SEARCH_API_KEY not set; news, regulatory and security lookups are disabled".to_string());
        }

        notes
    }

    pub fn log_warnings(&self) {
        for note in self.warnings() {
            warn!("{}", note);
        }
    }
}

/// Read a credential, treating blanks and the sample placeholder as unset
fn env_key(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && v != PLACEHOLDER_KEY)
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => match raw.trim().parse() {
            Ok(value) => value,
            Err(_) => {
                warn!("Ignoring unparsable value for {}: {:?}", name, raw);
                default
            }
        },
        Err(_) => default,
    }
}
