//! Main orchestrator - runs one conversational turn
//!
//! VALIDATE CONFIG → CLASSIFY → BUILD CONTEXT → AGGREGATE? → SUMMARIZE →
//! PERSIST TURN → RESPOND
//!
//! A failed aggregation, or a failed summary over aggregated data, recovers
//! by summarizing again without data. Any other failure ends the turn with
//! a user-safe `QueryError` and nothing is persisted.

use crate::aggregator::DataAggregator;
use crate::classifier::IntentClassifier;
use crate::config::Config;
use crate::error::{ErrorKind, QueryError};
use crate::llm::LlmClient;
use crate::memory::context::{ContextBuilder, EnhancedContext};
use crate::memory::store::{ChatMessage, ConversationStore, MessageMetadata};
use crate::models::{AggregatorResult, Analysis, ContextAnalysis, ProcessQueryResult};
use crate::retry::{retry_transient, retry_with, RetryPolicy};
use crate::summarizer::SummaryGenerator;
use crate::Result;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{error, info, warn};

/// Suggestions returned per turn
pub const MAX_SUGGESTIONS: usize = 3;

/// Aggregation backs off twice as long as the other steps
const AGGREGATE_BACKOFF_MULTIPLIER: u32 = 2;

pub struct Orchestrator {
    config: Config,
    classifier: IntentClassifier,
    aggregator: Arc<DataAggregator>,
    context_builder: ContextBuilder,
    summarizer: SummaryGenerator,
    store: Arc<ConversationStore>,
    step_policy: RetryPolicy,
    rng: Mutex<StdRng>,
}

impl Orchestrator {
    pub fn new(
        config: Config,
        llm: Arc<dyn LlmClient>,
        aggregator: Arc<DataAggregator>,
        store: Arc<ConversationStore>,
    ) -> Self {
        let step_policy = RetryPolicy::new(config.retry.max_attempts, config.retry.base_delay)
            .with_timeout(config.retry.step_timeout);

        let rng = match config.suggestion_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Self {
            classifier: IntentClassifier::new(llm.clone()).with_retry(step_policy),
            summarizer: SummaryGenerator::new(llm),
            context_builder: ContextBuilder::new(store.clone()),
            aggregator,
            store,
            step_policy,
            rng: Mutex::new(rng),
            config,
        }
    }

    /// Replace the suggestion shuffle source
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub async fn create_session(&self) -> String {
        self.store.create_session().await
    }

    /// Answer one query. Internal causes are logged; the caller only sees
    /// a user-safe message.
    pub async fn process_query(
        &self,
        query: &str,
        session_id: &str,
    ) -> std::result::Result<ProcessQueryResult, QueryError> {
        let started = Instant::now();

        match self.run_turn(query, session_id).await {
            Ok(result) => {
                info!(
                    session_id,
                    intent = result.analysis.primary_intent.as_str(),
                    with_data = result.aggregator_data.is_some(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn completed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(
                    session_id,
                    kind = ?e.kind(),
                    error = %e,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Turn failed"
                );
                Err(QueryError::from(&e))
            }
        }
    }

    /// The turn itself, with internal errors intact
    pub async fn run_turn(&self, query: &str, session_id: &str) -> Result<ProcessQueryResult> {
        // === VALIDATE CONFIG ===
        self.config.require_llm()?;

        let _turn = self.store.lock_session(session_id).await;

        // === CLASSIFY ===
        // Rate limits are retried inside the classifier; only timeouts and
        // dropped connections are retried here.
        let analysis = retry_with(
            "classify",
            &RetryPolicy::new(self.step_policy.max_attempts, self.step_policy.base_delay),
            |e| matches!(e.kind(), ErrorKind::Timeout | ErrorKind::Connection),
            || self.classifier.classify(query),
        )
        .await?;

        // Created only once the query is known to be usable
        self.store.ensure_session(session_id).await;

        // === BUILD CONTEXT ===
        let context = self.context_builder.build(session_id, &analysis).await;
        let judgment = self.context_builder.judge_continuity(&context);
        let context_block = self.context_builder.format(&context);

        // === AGGREGATE ===
        let aggregated = self.aggregate(&analysis).await;

        // === SUMMARIZE ===
        let summary = self
            .summarize(query, &analysis, aggregated.as_ref(), &context_block)
            .await;
        let (answer, aggregator_data) = match summary {
            Ok(text) => (text, aggregated),
            Err(e) if aggregated.is_some() => {
                warn!(
                    session_id,
                    error = %e,
                    "Summary over aggregated data failed, retrying without data"
                );
                let text = self
                    .summarize(query, &analysis, None, &context_block)
                    .await?;
                (text, None)
            }
            Err(e) => return Err(e),
        };

        let response = match &judgment.suggested_follow_up {
            Some(follow_up) => format!("{}\n\n{}", answer, follow_up),
            None => answer,
        };
        let suggestions = self.suggestions(&context, judgment.suggested_follow_up.as_deref());

        // === PERSIST TURN ===
        let metadata =
            MessageMetadata::from_analysis(&analysis).with_contextual_confidence(judgment.confidence);
        self.store
            .append_message(session_id, ChatMessage::user(query.trim(), metadata.clone()))
            .await;
        self.store
            .append_message(session_id, ChatMessage::assistant(response.clone(), metadata))
            .await;

        let continuity_score = self
            .store
            .metadata(session_id)
            .await
            .map(|m| m.continuity_score)
            .unwrap_or(context.metrics.continuity_score);

        // === RESPOND ===
        Ok(ProcessQueryResult {
            session_id: session_id.to_string(),
            context_analysis: ContextAnalysis {
                is_coherent: judgment.is_coherent,
                confidence: judgment.confidence,
                suggested_follow_up: judgment.suggested_follow_up,
                continuity_score,
                related_topics: context
                    .related_topics
                    .iter()
                    .map(|t| t.topic.name.clone())
                    .collect(),
            },
            analysis,
            aggregator_data,
            response,
            suggestions,
        })
    }

    /// Fetch external data when the analysis calls for it. A failure here
    /// is not fatal: the turn continues without data.
    async fn aggregate(&self, analysis: &Analysis) -> Option<AggregatorResult> {
        let spec = self.aggregator.plan(analysis);
        if spec.is_empty() {
            return None;
        }

        let policy = self.step_policy.scaled(AGGREGATE_BACKOFF_MULTIPLIER);
        match retry_transient("aggregate", &policy, || self.aggregator.execute(&spec)).await {
            Ok(result) => Some(result),
            Err(e) => {
                warn!(error = %e, "Aggregation failed, continuing without data");
                None
            }
        }
    }

    async fn summarize(
        &self,
        query: &str,
        analysis: &Analysis,
        data: Option<&AggregatorResult>,
        context_block: &str,
    ) -> Result<String> {
        retry_transient("summarize", &self.step_policy, || {
            self.summarizer.generate(query, analysis, data, context_block)
        })
        .await
    }

    /// The bridging question first when there is one, then predicted
    /// topics in shuffled order, capped
    fn suggestions(&self, context: &EnhancedContext, follow_up: Option<&str>) -> Vec<String> {
        let mut topics = self.context_builder.predict_topics(context);
        {
            let mut rng = self.rng.lock().unwrap_or_else(|p| p.into_inner());
            topics.shuffle(&mut *rng);
        }

        let mut suggestions: Vec<String> = follow_up.map(str::to_string).into_iter().collect();
        suggestions.extend(topics.into_iter().filter(|t| Some(t.as_str()) != follow_up));
        suggestions.truncate(MAX_SUGGESTIONS);
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::RateBudget;
    use crate::config::{RetryConfig, SessionConfig};
    use crate::memory::store::MessageRole;
    use crate::test_support::{classification_json, Script, ScriptedLlm, StaticMarketProvider};
    use std::time::Duration;

    fn test_config() -> Config {
        let mut config = Config::from_env();
        config.llm.api_key = Some("test-key".into());
        config.session = SessionConfig::default();
        config.retry = RetryConfig {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            step_timeout: Duration::from_secs(5),
        };
        config.suggestion_seed = Some(42);
        config
    }

    fn market_aggregator(provider: StaticMarketProvider) -> Arc<DataAggregator> {
        Arc::new(
            DataAggregator::new()
                .with_market_provider(Arc::new(provider), RateBudget::new(100, Duration::from_secs(60))),
        )
    }

    fn gecko() -> StaticMarketProvider {
        StaticMarketProvider::new("gecko").with_token("bitcoin", "BTC", "Bitcoin", 64000.0)
    }

    fn btc_classification() -> Script {
        Script::Text(classification_json("MARKET_DATA", 0.95, &["BTC"], true, false))
    }

    fn orchestrator(llm: Arc<ScriptedLlm>, aggregator: Arc<DataAggregator>) -> Orchestrator {
        Orchestrator::new(
            test_config(),
            llm,
            aggregator,
            Arc::new(ConversationStore::default()),
        )
    }

    #[tokio::test]
    async fn test_btc_price_turn() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Text("Bitcoin trades at **$64,000**.".into())),
        );
        let orchestrator = orchestrator(llm.clone(), market_aggregator(gecko()));
        let session = orchestrator.create_session().await;

        let result = orchestrator
            .process_query("What's BTC price?", &session)
            .await
            .unwrap();

        assert_eq!(result.analysis.detected_tokens, vec!["bitcoin"]);
        assert!(result.analysis.needs_api_call);
        assert_eq!(
            result.aggregator_data.as_ref().unwrap().primary["bitcoin"].price_usd,
            Some(64000.0)
        );
        assert!(result.response.starts_with("Bitcoin trades at"));
        assert!(!result.suggestions.is_empty());
        assert!(result.suggestions.len() <= MAX_SUGGESTIONS);
        assert!(result.context_analysis.is_coherent);

        let summary_prompt = &llm.summary_requests()[0].user;
        assert!(summary_prompt.contains("Bitcoin (BTC): price $64000.00"));

        let messages = orchestrator.store().recent_messages(&session, 10).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, MessageRole::User);
        assert_eq!(messages[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn test_market_query_without_data_still_answers() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Text("I couldn't fetch live prices right now.".into())),
        );
        let orchestrator = orchestrator(
            llm.clone(),
            market_aggregator(StaticMarketProvider::failing("gecko", ErrorKind::Provider)),
        );

        let result = orchestrator.process_query("btc price", "s1").await.unwrap();

        assert!(!result.response.trim().is_empty());
        assert!(!result.aggregator_data.unwrap().has_usable_data());
        assert!(llm.summary_requests()[0]
            .user
            .contains("Live data is currently unavailable"));
    }

    #[tokio::test]
    async fn test_empty_query_fails_before_any_call() {
        let llm = Arc::new(ScriptedLlm::new());
        let orchestrator = orchestrator(llm.clone(), market_aggregator(gecko()));

        let err = orchestrator.process_query("   ", "s1").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::Preprocessing);
        assert_eq!(llm.calls(), 0);
        assert!(orchestrator.store().recent_messages("s1", 10).await.is_empty());
        assert_eq!(orchestrator.store().session_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_turn_persists_nothing() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(Script::Text(classification_json("EDUCATIONAL", 0.9, &[], false, false)))
                .summarize(Script::Fail(ErrorKind::Llm)),
        );
        let orchestrator = orchestrator(llm, market_aggregator(gecko()));

        let err = orchestrator
            .process_query("what is a blockchain", "s1")
            .await
            .unwrap_err();

        assert_eq!(err.kind, ErrorKind::Llm);
        assert_eq!(err.message, ErrorKind::Llm.user_message());
        assert!(orchestrator.store().recent_messages("s1", 10).await.is_empty());
    }

    #[tokio::test]
    async fn test_summary_failure_recovers_without_data() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Fail(ErrorKind::Llm))
                .summarize(Script::Text("Live prices are unavailable right now.".into())),
        );
        let orchestrator = orchestrator(llm.clone(), market_aggregator(gecko()));

        let result = orchestrator.process_query("btc price", "s1").await.unwrap();

        assert!(result.aggregator_data.is_none());
        assert_eq!(result.response, "Live prices are unavailable right now.");

        let summaries = llm.summary_requests();
        assert_eq!(summaries.len(), 2);
        assert!(summaries[0].user.contains("Bitcoin (BTC)"));
        assert!(summaries[1].user.contains("Live data is currently unavailable"));
    }

    #[tokio::test]
    async fn test_transient_aggregation_failure_retried_then_recovered() {
        let provider = Arc::new(StaticMarketProvider::failing("gecko", ErrorKind::RateLimit));
        let aggregator = Arc::new(
            DataAggregator::new()
                .with_market_provider(provider.clone(), RateBudget::new(100, Duration::from_secs(60))),
        );
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Text("Prices are unavailable.".into())),
        );
        let orchestrator = orchestrator(llm, aggregator);

        let result = orchestrator.process_query("btc price", "s1").await.unwrap();

        assert!(result.aggregator_data.is_none());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_rate_limited_classification_attempted_max_times() {
        let llm = Arc::new(ScriptedLlm::new().classify(Script::Fail(ErrorKind::RateLimit)));
        let orchestrator = orchestrator(llm.clone(), market_aggregator(gecko()));

        let err = orchestrator.process_query("btc price", "s1").await.unwrap_err();

        assert_eq!(err.kind, ErrorKind::RateLimit);
        assert_eq!(err.to_string(), "Service is currently busy. Please try again in a moment.");
        assert_eq!(llm.calls(), 3);
    }

    #[tokio::test]
    async fn test_missing_llm_key_is_configuration_error() {
        let llm = Arc::new(ScriptedLlm::new().classify(btc_classification()));
        let mut config = test_config();
        config.llm.api_key = None;
        let orchestrator = Orchestrator::new(
            config,
            llm.clone(),
            market_aggregator(gecko()),
            Arc::new(ConversationStore::default()),
        );

        let err = orchestrator.process_query("btc price", "s1").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Configuration);
        assert_eq!(llm.calls(), 0);
    }

    #[tokio::test]
    async fn test_seeded_suggestions_are_deterministic() {
        let run = || async {
            let llm = Arc::new(
                ScriptedLlm::new()
                    .classify(btc_classification())
                    .summarize(Script::Text("ok".into())),
            );
            let orchestrator = orchestrator(llm, market_aggregator(gecko()));
            let result = orchestrator.process_query("btc price", "s1").await.unwrap();
            result.suggestions
        };

        assert_eq!(run().await, run().await);
    }

    #[tokio::test]
    async fn test_concurrent_turns_on_one_session_are_serialized() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Text("answer".into())),
        );
        let orchestrator = orchestrator(llm, market_aggregator(gecko()));

        let (a, b) = tokio::join!(
            orchestrator.process_query("btc price", "shared"),
            orchestrator.process_query("bitcoin price", "shared"),
        );
        assert!(a.is_ok() && b.is_ok());

        let roles: Vec<MessageRole> = orchestrator
            .store()
            .recent_messages("shared", 10)
            .await
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            vec![
                MessageRole::User,
                MessageRole::Assistant,
                MessageRole::User,
                MessageRole::Assistant
            ]
        );

        let meta = orchestrator.store().metadata("shared").await.unwrap();
        assert_eq!(meta.message_count, 4);
        assert!((0.0..=1.0).contains(&meta.continuity_score));
    }

    #[tokio::test]
    async fn test_topic_jump_offers_bridge_first() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .classify(Script::Text(classification_json("SECURITY", 0.2, &[], false, false)))
                .summarize(Script::Text("answer".into())),
        );
        let orchestrator = orchestrator(llm, market_aggregator(gecko()));

        let first = orchestrator.process_query("btc price", "s1").await.unwrap();
        assert!(first.context_analysis.suggested_follow_up.is_none());

        let second = orchestrator
            .process_query("how do rug pulls work", "s1")
            .await
            .unwrap();

        let bridge = second.context_analysis.suggested_follow_up.clone().unwrap();
        assert!(bridge.starts_with("Earlier we were discussing market data around Bitcoin"));
        assert!(!second.context_analysis.is_coherent);
        assert_eq!(second.response, format!("answer\n\n{}", bridge));
        assert_eq!(second.suggestions[0], bridge);
        assert!(second.suggestions.len() <= MAX_SUGGESTIONS);
        assert_eq!(second.suggestions.iter().filter(|s| **s == bridge).count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_connection_during_classification_is_retried() {
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(Script::Fail(ErrorKind::Connection))
                .classify(btc_classification())
                .summarize(Script::Text("Bitcoin trades at $64,000.".into())),
        );
        let orchestrator = orchestrator(llm.clone(), market_aggregator(gecko()));

        let result = orchestrator.process_query("btc price", "s1").await.unwrap();

        assert_eq!(result.analysis.detected_tokens, vec!["bitcoin"]);
        let classify_calls = llm.requests().iter().filter(|r| r.json_output).count();
        assert_eq!(classify_calls, 2);
    }

    #[tokio::test]
    async fn test_permanent_provider_failure_not_retried() {
        let provider = Arc::new(StaticMarketProvider::failing("gecko", ErrorKind::Provider));
        let aggregator = Arc::new(
            DataAggregator::new()
                .with_market_provider(provider.clone(), RateBudget::new(100, Duration::from_secs(60))),
        );
        let llm = Arc::new(
            ScriptedLlm::new()
                .classify(btc_classification())
                .summarize(Script::Text("Prices are unavailable.".into())),
        );
        let orchestrator = orchestrator(llm, aggregator);

        let result = orchestrator.process_query("btc price", "s1").await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert!(!result.aggregator_data.unwrap().has_usable_data());
    }
}
