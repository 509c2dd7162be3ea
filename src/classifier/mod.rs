//! Intent Classifier
//!
//! Turns a raw user query into a validated `Analysis`:
//! preprocess → LLM classification (JSON) → schema validation.
//! Rate-limited LLM calls are retried with exponential backoff; every
//! other failure propagates on the first attempt.

pub mod preprocess;
pub mod schema;

pub use preprocess::{preprocess, ContextHints, PreprocessedQuery, MAX_TOKENS};
pub use schema::SchemaValidator;

use crate::error::ErrorKind;
use crate::llm::{LlmClient, LlmRequest};
use crate::models::Analysis;
use crate::retry::{retry_with, RetryPolicy};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

const CLASSIFICATION_INSTRUCTION: &str = r#"You classify cryptocurrency questions for a market assistant.

Intents:
- MARKET_DATA: prices, market cap, volume, supply of specific tokens
- COMPARISON: two or more tokens weighed against each other
- TECHNICAL: chart patterns, indicators, support/resistance
- EDUCATIONAL: how a technology or concept works
- NEWS: recent events and announcements
- REGULATORY: laws, regulators, tax, legal status
- SECURITY: hacks, scams, wallet safety, exploits
- DEFI: lending, staking, liquidity, yield
- GENERAL: anything else

Respond with ONE JSON object and nothing else, using exactly this shape:
{
  "classification": {"primaryIntent": string, "confidence": number 0..1, "needsApiCall": bool, "ambiguityLevel": "low"|"medium"|"high", "requiresWebSearch": bool},
  "queryAnalysis": {
    "sanitizedQuery": string,
    "detectedTokens": [string] (at most 5, canonical ids such as "bitcoin"),
    "comparisonRequest": {"isComparison": bool, "tokens": [string], "metrics": [string]},
    "detectedIntents": [string],
    "timeContext": {"timeframe": string|null, "isHistorical": bool},
    "marketIndicators": {"price": bool, "volume": bool, "marketCap": bool, "trend": bool},
    "conceptualIndicators": [string],
    "webSearchContext": {"needsNews": bool, "needsRegulatory": bool, "needsSecurity": bool, "searchTerms": [string]}
  },
  "dataRequirements": {
    "marketData": {"required": bool, "metrics": [string]},
    "conceptualData": {"required": bool, "topics": [string]}
  }
}
Set needsApiCall when live market figures are needed and requiresWebSearch when recent news, regulatory or security coverage is needed."#;

/// LLM-backed intent classifier
pub struct IntentClassifier {
    llm: Arc<dyn LlmClient>,
    retry: RetryPolicy,
}

impl IntentClassifier {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Classify a raw query.
    ///
    /// Preprocessing failures return before the LLM is contacted.
    pub async fn classify(&self, raw_query: &str) -> Result<Analysis> {
        let pre = preprocess(raw_query)?;

        debug!(
            sanitized = %pre.sanitized,
            candidates = ?pre.candidate_tokens,
            hints = ?pre.hints.active(),
            "Query preprocessed"
        );

        let request = LlmRequest::new(CLASSIFICATION_INSTRUCTION, build_user_message(&pre)).json();

        let content = retry_with(
            "classify",
            &self.retry,
            |e| e.kind() == ErrorKind::RateLimit,
            || self.llm.complete(&request),
        )
        .await?;

        let analysis = finalize(SchemaValidator::validate_content(&content)?, &pre);

        info!(
            intent = analysis.primary_intent.as_str(),
            confidence = analysis.confidence,
            tokens = ?analysis.detected_tokens,
            "Query classified"
        );

        Ok(analysis)
    }
}

fn build_user_message(pre: &PreprocessedQuery) -> String {
    let mut message = format!("Query: {}", pre.sanitized);

    if !pre.candidate_tokens.is_empty() {
        message.push_str(&format!("\nCandidate tokens: {}", pre.candidate_tokens.join(", ")));
    }

    let hints = pre.hints.active();
    if !hints.is_empty() {
        message.push_str(&format!("\nKeyword hints: {}", hints.join(", ")));
    }

    message
}

/// Merge the model's tokens with known-identifier candidates. Tokens found
/// in the query keep their encounter order; tokens only the model reported
/// follow. Also pins the sanitized query to the locally computed one.
fn finalize(mut analysis: Analysis, pre: &PreprocessedQuery) -> Analysis {
    let model_tokens = std::mem::take(&mut analysis.detected_tokens);

    let mut merged: Vec<String> = pre
        .candidate_tokens
        .iter()
        .filter(|t| preprocess::is_known_identifier(t) || model_tokens.contains(t))
        .cloned()
        .collect();
    for token in model_tokens {
        if !merged.contains(&token) {
            merged.push(token);
        }
    }
    merged.truncate(MAX_TOKENS);

    analysis.detected_tokens = merged;
    analysis.sanitized_query = pre.sanitized.clone();
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;
    use crate::models::Intent;
    use crate::test_support::{classification_json, Script, ScriptedLlm};
    use std::time::Duration;

    fn classifier(llm: Arc<ScriptedLlm>) -> IntentClassifier {
        IntentClassifier::new(llm).with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    #[tokio::test]
    async fn test_btc_price_scenario() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Text(classification_json(
            "MARKET_DATA",
            0.95,
            &["BTC"],
            true,
            false,
        ))));

        let analysis = classifier(llm.clone())
            .classify("What's BTC price?")
            .await
            .unwrap();

        assert_eq!(analysis.primary_intent, Intent::MarketData);
        assert_eq!(analysis.detected_tokens, vec!["bitcoin"]);
        assert!(analysis.needs_api_call);
        assert_eq!(analysis.sanitized_query, "what's bitcoin price?");

        let requests = llm.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].json_output);
        assert!(requests[0].user.contains("what's bitcoin price?"));
        assert!(requests[0].user.contains("Keyword hints: price"));
    }

    #[tokio::test]
    async fn test_empty_query_never_reaches_llm() {
        let llm = Arc::new(ScriptedLlm::new());
        let err = classifier(llm.clone()).classify("   ").await.unwrap_err();

        assert!(matches!(err, OrchestrationError::Preprocessing(_)));
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_rate_limit_retried_up_to_max_attempts() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Fail(ErrorKind::RateLimit)));
        let err = classifier(llm.clone())
            .classify("price of eth")
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_attempted_once() {
        for kind in [ErrorKind::Llm, ErrorKind::Connection, ErrorKind::Configuration] {
            let llm = Arc::new(ScriptedLlm::new().classify(Script::Fail(kind)));
            let err = classifier(llm.clone())
                .classify("price of eth")
                .await
                .unwrap_err();

            assert_eq!(err.kind(), kind);
            assert_eq!(llm.calls(), 1, "{:?} must not be retried here", kind);
        }
    }

    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(Script::Fail(ErrorKind::RateLimit))
                .classify(Script::Text(classification_json(
                    "NEWS",
                    0.8,
                    &[],
                    false,
                    true,
                ))),
        );

        let analysis = classifier(llm.clone())
            .classify("latest ethereum news")
            .await
            .unwrap();
        assert_eq!(analysis.primary_intent, Intent::News);
        assert_eq!(analysis.detected_tokens, vec!["ethereum"]);
        assert_eq!(llm.calls(), 2);
    }

    #[tokio::test]
    async fn test_malformed_json_is_llm_error() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Text("Bitcoin is great".into())));
        let err = classifier(llm).classify("btc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Llm);
    }

    #[tokio::test]
    async fn test_schema_failure_is_validation_error() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Text(classification_json(
            "MARKET_DATA",
            1.5,
            &["btc"],
            true,
            false,
        ))));
        let err = classifier(llm).classify("btc").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[tokio::test]
    async fn test_merged_tokens_capped_at_five() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Text(classification_json(
            "COMPARISON",
            0.9,
            &["xrp", "bnb", "ltc"],
            true,
            false,
        ))));

        let analysis = classifier(llm)
            .classify("btc eth sol vs xrp")
            .await
            .unwrap();
        assert_eq!(
            analysis.detected_tokens,
            vec!["bitcoin", "ethereum", "solana", "ripple", "binancecoin"]
        );
    }

    #[tokio::test]
    async fn test_tokens_keep_query_order() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Text(classification_json(
            "COMPARISON",
            0.9,
            &["SOL", "BTC"],
            true,
            false,
        ))));

        let analysis = classifier(llm)
            .classify("btc eth sol ada doge xrp")
            .await
            .unwrap();
        assert_eq!(
            analysis.detected_tokens,
            vec!["bitcoin", "ethereum", "solana", "cardano", "dogecoin"]
        );
    }
}
