//! Summary Generator
//!
//! Produces the final markdown answer from the query, its analysis, any
//! aggregated data and the conversation context block.

use crate::error::OrchestrationError;
use crate::llm::{LlmClient, LlmRequest};
use crate::models::{AggregatorResult, Analysis, TokenDetail};
use crate::Result;
use std::sync::Arc;
use tracing::{debug, info};

const SUMMARY_INSTRUCTION: &str = r#"You are a concise cryptocurrency market assistant.

Answer the user's question in markdown using ONLY the data provided plus well-established background knowledge.
- Quote live figures exactly as given; never invent prices, volumes or dates.
- When live data is marked unavailable, say so plainly and answer what you can without numbers.
- Keep answers under 250 words unless the user asks for depth.
- Match the user's technical level from the conversation context.
- This is not financial advice; never tell the user to buy or sell."#;

const MAX_WEB_RESULTS: usize = 5;

pub struct SummaryGenerator {
    llm: Arc<dyn LlmClient>,
}

impl SummaryGenerator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    /// Generate the answer. `data` is `None` when nothing was fetched or the
    /// fetch was abandoned.
    pub async fn generate(
        &self,
        query: &str,
        analysis: &Analysis,
        data: Option<&AggregatorResult>,
        context_block: &str,
    ) -> Result<String> {
        let prompt = build_prompt(query, analysis, data, context_block);
        debug!(prompt_chars = prompt.len(), has_data = data.is_some(), "Requesting summary");

        let request = LlmRequest::new(SUMMARY_INSTRUCTION, prompt).with_max_output_tokens(1200);
        let text = self.llm.complete(&request).await?;
        let text = text.trim();

        if text.is_empty() {
            return Err(OrchestrationError::Llm(
                "summary response was empty".to_string(),
            ));
        }

        info!(chars = text.len(), "Summary generated");
        Ok(text.to_string())
    }
}

pub fn build_prompt(
    query: &str,
    analysis: &Analysis,
    data: Option<&AggregatorResult>,
    context_block: &str,
) -> String {
    let mut prompt = String::new();

    prompt.push_str(context_block.trim_end());
    prompt.push_str("\n\n## Query\n");
    prompt.push_str(query.trim());

    prompt.push_str("\n\n## Analysis\n");
    prompt.push_str(&format!(
        "Intent: {} (confidence {:.2})\n",
        analysis.primary_intent.as_str(),
        analysis.confidence
    ));
    if !analysis.detected_tokens.is_empty() {
        prompt.push_str(&format!("Tokens: {}\n", analysis.detected_tokens.join(", ")));
    }
    if let Some(timeframe) = &analysis.time_context.timeframe {
        prompt.push_str(&format!("Timeframe: {}\n", timeframe));
    }
    if analysis.comparison.is_comparison && !analysis.comparison.metrics.is_empty() {
        prompt.push_str(&format!(
            "Compare on: {}\n",
            analysis.comparison.metrics.join(", ")
        ));
    }

    prompt.push_str("\n## Data\n");
    prompt.push_str(&data_block(analysis, data));
    prompt
}

fn data_block(analysis: &Analysis, data: Option<&AggregatorResult>) -> String {
    let wanted_data = analysis.needs_api_call
        || analysis.requires_web_search
        || analysis.primary_intent.wants_market_data();

    let Some(data) = data.filter(|d| d.has_usable_data()) else {
        return if wanted_data {
            "Live data is currently unavailable: the market and news sources could not be \
             reached. Tell the user live figures could not be retrieved right now and answer \
             from general knowledge without quoting prices.\n"
                .to_string()
        } else {
            "No live data was needed for this question.\n".to_string()
        };
    };

    let mut block = String::new();

    if data.primary.len() + data.fallback.len() > 0 {
        block.push_str("### Market Data\n");
        for detail in data.primary.values() {
            block.push_str(&format_detail(detail, false));
        }
        for detail in data.fallback.values() {
            block.push_str(&format_detail(detail, true));
        }

        let missing: Vec<&str> = analysis
            .detected_tokens
            .iter()
            .filter(|t| data.detail_for(t).is_none())
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            block.push_str(&format!("Data unavailable for: {}\n", missing.join(", ")));
        }
    }

    if !data.web_results.is_empty() {
        block.push_str("### Web Results\n");
        for hit in data.web_results.iter().take(MAX_WEB_RESULTS) {
            let published = hit
                .published
                .as_deref()
                .map(|p| format!(" ({})", p))
                .unwrap_or_default();
            block.push_str(&format!(
                "- {}{}: {} [{}]\n",
                hit.title, published, hit.snippet, hit.url
            ));
        }
    }

    block
}

fn format_detail(detail: &TokenDetail, from_fallback: bool) -> String {
    let mut fields = Vec::new();

    if let Some(price) = detail.price_usd {
        fields.push(format!("price {}", format_usd(price)));
    }
    if let Some(change) = detail.change_24h_pct {
        fields.push(format!("24h {:+.2}%", change));
    }
    if let Some(cap) = detail.market_cap_usd {
        fields.push(format!("market cap {}", format_usd(cap)));
    }
    if let Some(volume) = detail.volume_24h_usd {
        fields.push(format!("24h volume {}", format_usd(volume)));
    }
    if let Some(supply) = detail.circulating_supply {
        fields.push(format!("circulating {:.0}", supply));
    }
    if let Some(rank) = detail.market_cap_rank {
        fields.push(format!("rank #{}", rank));
    }

    let source = if from_fallback {
        format!("{}, fallback", detail.source)
    } else {
        detail.source.clone()
    };

    format!(
        "- {} ({}): {} [source: {}, as of {}]\n",
        detail.name,
        detail.symbol,
        if fields.is_empty() {
            "no figures reported".to_string()
        } else {
            fields.join(" | ")
        },
        source,
        detail.fetched_at.format("%Y-%m-%d %H:%M UTC")
    )
}

fn format_usd(value: f64) -> String {
    let abs = value.abs();
    if abs >= 1e12 {
        format!("${:.2}T", value / 1e12)
    } else if abs >= 1e9 {
        format!("${:.2}B", value / 1e9)
    } else if abs >= 1e6 {
        format!("${:.2}M", value / 1e6)
    } else if abs >= 1.0 {
        format!("${:.2}", value)
    } else {
        format!("${:.6}", value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::SchemaValidator;
    use crate::error::ErrorKind;
    use crate::models::WebSearchResult;
    use crate::test_support::{classification_payload, token_detail, Script, ScriptedLlm};

    fn analysis(intent: &str, tokens: &[&str], needs_api: bool) -> Analysis {
        SchemaValidator::validate(&classification_payload(intent, 0.9, tokens, needs_api, false))
            .unwrap()
    }

    #[test]
    fn test_prompt_lists_primary_and_fallback_data() {
        let mut data = AggregatorResult::default();
        data.primary.insert(
            "bitcoin".into(),
            token_detail("bitcoin", "BTC", "Bitcoin", 64000.0, "coingecko"),
        );
        data.fallback.insert(
            "ethereum".into(),
            token_detail("ethereum", "ETH", "Ethereum", 3100.0, "coincap"),
        );

        let prompt = build_prompt(
            "btc vs eth vs sol",
            &analysis("COMPARISON", &["btc", "eth", "sol"], true),
            Some(&data),
            "## Conversation Context\nNo prior conversation in this session.",
        );

        assert!(prompt.contains("Bitcoin (BTC): price $64000.00"));
        assert!(prompt.contains("coincap, fallback"));
        assert!(prompt.contains("Data unavailable for: solana"));
        assert!(prompt.contains("Intent: COMPARISON"));
    }

    #[test]
    fn test_prompt_marks_missing_market_data() {
        let prompt = build_prompt("btc price", &analysis("MARKET_DATA", &["btc"], true), None, "");
        assert!(prompt.contains("Live data is currently unavailable"));

        let empty = AggregatorResult::default();
        let prompt = build_prompt(
            "btc price",
            &analysis("MARKET_DATA", &["btc"], true),
            Some(&empty),
            "",
        );
        assert!(prompt.contains("Live data is currently unavailable"));
    }

    #[test]
    fn test_prompt_without_data_needs() {
        let prompt = build_prompt(
            "what is a blockchain",
            &analysis("EDUCATIONAL", &[], false),
            None,
            "",
        );
        assert!(prompt.contains("No live data was needed"));
    }

    #[test]
    fn test_web_results_listed() {
        let mut data = AggregatorResult::default();
        data.web_results.push(WebSearchResult {
            title: "Exchange hacked".into(),
            url: "https://news.example/hack".into(),
            snippet: "Funds were drained.".into(),
            published: Some("2026-10-12".into()),
            source: "tavily".into(),
        });

        let prompt = build_prompt("any hacks", &analysis("SECURITY", &[], false), Some(&data), "");
        assert!(prompt.contains("- Exchange hacked (2026-10-12): Funds were drained."));
    }

    #[test]
    fn test_usd_formatting() {
        assert_eq!(format_usd(1.26e12), "$1.26T");
        assert_eq!(format_usd(31_000_000_000.0), "$31.00B");
        assert_eq!(format_usd(0.000123), "$0.000123");
    }

    #[tokio::test]
    async fn test_generate_trims_output() {
        let llm = Arc::new(ScriptedLlm::new().summarize(Script::Text("  **Bitcoin** is at $64k.\n\n".into())));
        let generator = SummaryGenerator::new(llm.clone());

        let text = generator
            .generate("btc", &analysis("MARKET_DATA", &["btc"], true), None, "")
            .await
            .unwrap();

        assert_eq!(text, "**Bitcoin** is at $64k.");
        assert!(!llm.requests()[0].json_output);
    }

    #[tokio::test]
    async fn test_empty_output_is_llm_error() {
        let llm = Arc::new(ScriptedLlm::new().summarize(Script::Text("   ".into())));
        let err = SummaryGenerator::new(llm)
            .generate("btc", &analysis("MARKET_DATA", &["btc"], true), None, "")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Llm);
    }
}
