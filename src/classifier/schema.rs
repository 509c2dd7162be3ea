//! Classification schema validation
//!
//! The model's JSON is never trusted directly: it is deserialized into a
//! strict wire shape (unknown fields rejected), range-checked, and coerced
//! into an `Analysis`.

use crate::classifier::preprocess::{canonical_token, MAX_TOKENS};
use crate::error::{OrchestrationError, ValidationErrorKind};
use crate::models::{
    AmbiguityLevel, Analysis, ComparisonRequest, DataRequirements, Intent, MarketIndicators,
    TimeContext, WebSearchContext,
};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ClassificationPayload {
    classification: RawClassification,
    query_analysis: RawQueryAnalysis,
    data_requirements: DataRequirements,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawClassification {
    primary_intent: String,
    confidence: f64,
    needs_api_call: bool,
    ambiguity_level: String,
    requires_web_search: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawQueryAnalysis {
    sanitized_query: String,
    detected_tokens: Vec<String>,
    comparison_request: ComparisonRequest,
    detected_intents: Vec<String>,
    time_context: TimeContext,
    market_indicators: MarketIndicators,
    conceptual_indicators: Vec<String>,
    web_search_context: WebSearchContext,
}

/// Validates and coerces classification payloads
pub struct SchemaValidator;

impl SchemaValidator {
    /// Validate an already-parsed payload
    pub fn validate(payload: &Value) -> Result<Analysis, ValidationErrorKind> {
        if !payload.is_object() {
            return Err(ValidationErrorKind::Schema(
                "expected a JSON object".to_string(),
            ));
        }

        let raw = ClassificationPayload::deserialize(payload)
            .map_err(|e| ValidationErrorKind::Schema(e.to_string()))?;

        let RawClassification {
            primary_intent,
            confidence,
            needs_api_call,
            ambiguity_level,
            requires_web_search,
        } = raw.classification;
        let query = raw.query_analysis;

        if !confidence.is_finite() || !(0.0..=1.0).contains(&confidence) {
            return Err(ValidationErrorKind::ConfidenceOutOfRange(confidence));
        }

        if query.detected_tokens.len() > MAX_TOKENS {
            return Err(ValidationErrorKind::TooManyTokens(query.detected_tokens.len()));
        }

        let primary_intent = Intent::parse(&primary_intent)
            .ok_or(ValidationErrorKind::UnknownIntent(primary_intent))?;

        let ambiguity_level = AmbiguityLevel::parse(&ambiguity_level)
            .ok_or(ValidationErrorKind::UnknownAmbiguity(ambiguity_level))?;

        let sanitized_query = query.sanitized_query.trim().to_string();
        if sanitized_query.is_empty() {
            return Err(ValidationErrorKind::EmptyField("sanitizedQuery"));
        }

        let mut detected_intents = vec![primary_intent];
        for name in query.detected_intents {
            let intent = Intent::parse(&name).ok_or(ValidationErrorKind::UnknownIntent(name))?;
            if !detected_intents.contains(&intent) {
                detected_intents.push(intent);
            }
        }

        let comparison = ComparisonRequest {
            is_comparison: query.comparison_request.is_comparison,
            tokens: canonical_tokens(&query.comparison_request.tokens),
            metrics: trimmed(query.comparison_request.metrics),
        };

        let time_context = TimeContext {
            timeframe: query
                .time_context
                .timeframe
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty()),
            is_historical: query.time_context.is_historical,
        };

        let web_search_context = WebSearchContext {
            search_terms: trimmed(query.web_search_context.search_terms),
            ..query.web_search_context
        };

        Ok(Analysis {
            primary_intent,
            confidence,
            needs_api_call,
            ambiguity_level,
            requires_web_search,
            sanitized_query,
            detected_tokens: canonical_tokens(&query.detected_tokens),
            comparison,
            detected_intents,
            time_context,
            market_indicators: query.market_indicators,
            conceptual_indicators: trimmed(query.conceptual_indicators),
            web_search_context,
            data_requirements: raw.data_requirements,
        })
    }

    /// Validate raw model output.
    ///
    /// Empty or non-JSON content is an `Llm` error; JSON that breaks the
    /// schema is a `Validation` error.
    pub fn validate_content(content: &str) -> crate::Result<Analysis> {
        let body = strip_code_fence(content.trim());
        if body.is_empty() {
            return Err(OrchestrationError::Llm(
                "classification response was empty".to_string(),
            ));
        }

        let payload: Value = serde_json::from_str(body).map_err(|e| {
            OrchestrationError::Llm(format!("classification response is not valid JSON: {}", e))
        })?;

        Ok(Self::validate(&payload)?)
    }
}

/// Unwrap a ```json fenced block when the model adds one anyway
fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.rfind("```")
        .map(|end| &rest[..end])
        .unwrap_or(rest)
        .trim()
}

fn canonical_tokens(raw: &[String]) -> Vec<String> {
    let mut tokens: Vec<String> = Vec::with_capacity(raw.len());
    for token in raw.iter().map(|t| canonical_token(t)) {
        if !token.is_empty() && !tokens.contains(&token) {
            tokens.push(token);
        }
    }
    tokens
}

fn trimmed(values: Vec<String>) -> Vec<String> {
    values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}
