//! Context Builder
//!
//! Reads the conversation store alongside the current `Analysis` and
//! produces the `EnhancedContext` fed to response generation, plus a
//! continuity judgment and predicted follow-up topics.

use crate::memory::store::{
    ChatMessage, ConversationStore, MessageRole, RankedTopic, TechnicalLevel, TopicMetadata,
    UserPreferences,
};
use crate::models::{Analysis, Intent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Messages carried into the prompt context
pub const RECENT_MESSAGE_COUNT: usize = 6;

/// Predicted topics returned at most
pub const MAX_PREDICTED_TOPICS: usize = 5;

const COHERENCE_THRESHOLD: f64 = 0.7;
const CONTINUITY_WEIGHT: f64 = 0.3;
const CONFIDENCE_WEIGHT: f64 = 0.4;
const OVERLAP_WEIGHT: f64 = 0.3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetrics {
    pub message_count: u64,
    pub continuity_score: f64,
    /// Intents of the recent user turns, oldest first
    pub recent_intents: Vec<Intent>,
    pub topic_count: usize,
    pub session_age_secs: i64,
    pub technical_level: TechnicalLevel,
}

/// Read-only view of a session for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnhancedContext {
    pub session_id: String,
    pub recent_messages: Vec<ChatMessage>,
    pub preferences: UserPreferences,
    pub metrics: ConversationMetrics,
    pub analysis: Analysis,
    pub related_topics: Vec<RankedTopic>,
    /// Most recently mentioned topic before this query
    pub last_topic: Option<TopicMetadata>,
}

impl EnhancedContext {
    pub fn is_fresh(&self) -> bool {
        self.recent_messages.is_empty() && self.last_topic.is_none()
    }

    /// Current intent already seen recently or among related topics
    pub fn has_topic_overlap(&self) -> bool {
        let intent = self.analysis.primary_intent;
        self.metrics.recent_intents.contains(&intent)
            || self.related_topics.iter().any(|t| t.topic.intent == intent)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ContinuityJudgment {
    pub is_coherent: bool,
    pub confidence: f64,
    pub suggested_follow_up: Option<String>,
}

pub struct ContextBuilder {
    store: Arc<ConversationStore>,
    recency_window: Duration,
}

impl ContextBuilder {
    pub fn new(store: Arc<ConversationStore>) -> Self {
        let recency_window = store.config().recency_window;
        Self {
            store,
            recency_window,
        }
    }

    pub async fn build(&self, session_id: &str, analysis: &Analysis) -> EnhancedContext {
        self.build_at(session_id, analysis, Utc::now()).await
    }

    pub async fn build_at(
        &self,
        session_id: &str,
        analysis: &Analysis,
        now: DateTime<Utc>,
    ) -> EnhancedContext {
        let recent_messages = self
            .store
            .recent_messages(session_id, RECENT_MESSAGE_COUNT)
            .await;
        let ranked = self.store.ranked_topics_at(session_id, now).await;
        let metadata = self.store.metadata(session_id).await;

        let recent_intents: Vec<Intent> = recent_messages
            .iter()
            .filter(|m| m.role == MessageRole::User)
            .filter_map(|m| m.metadata.as_ref().map(|meta| meta.intent))
            .collect();

        let last_topic = ranked
            .iter()
            .max_by_key(|t| t.topic.last_mentioned)
            .map(|t| t.topic.clone());

        let recency = chrono::Duration::from_std(self.recency_window).unwrap_or(chrono::Duration::zero());
        let related_topics: Vec<RankedTopic> = ranked
            .iter()
            .filter(|t| is_related(&t.topic, analysis, now, recency))
            .cloned()
            .collect();

        let (preferences, metrics) = match metadata {
            Some(meta) => (
                meta.user_preferences.clone(),
                ConversationMetrics {
                    message_count: meta.message_count,
                    continuity_score: meta.continuity_score,
                    recent_intents,
                    topic_count: meta.topics.len(),
                    session_age_secs: (now - meta.created_at).num_seconds().max(0),
                    technical_level: meta.user_preferences.technical_level,
                },
            ),
            None => {
                let preferences = UserPreferences::empty(now);
                let technical_level = preferences.technical_level;
                (
                    preferences,
                    ConversationMetrics {
                        message_count: 0,
                        continuity_score: 1.0,
                        recent_intents,
                        topic_count: 0,
                        session_age_secs: 0,
                        technical_level,
                    },
                )
            }
        };

        EnhancedContext {
            session_id: session_id.to_string(),
            recent_messages,
            preferences,
            metrics,
            analysis: analysis.clone(),
            related_topics,
            last_topic,
        }
    }

    /// Render the context block for the summarization prompt
    pub fn format(&self, ctx: &EnhancedContext) -> String {
        let mut out = String::from("## Conversation Context\n");

        if ctx.is_fresh() {
            out.push_str("No prior conversation in this session.\n");
            return out;
        }

        out.push_str(&format!(
            "Messages so far: {} | Continuity: {:.2} | Technical level: {}\n",
            ctx.metrics.message_count,
            ctx.metrics.continuity_score,
            level_label(ctx.metrics.technical_level)
        ));

        if !ctx.recent_messages.is_empty() {
            out.push_str("\nRecent exchanges:\n");
            for message in &ctx.recent_messages {
                let role = match message.role {
                    MessageRole::User => "User",
                    MessageRole::Assistant => "Assistant",
                    MessageRole::System => "System",
                };
                out.push_str(&format!("- {}: {}\n", role, clip(&message.content, 200)));
            }
        }

        if !ctx.related_topics.is_empty() {
            let topics: Vec<String> = ctx
                .related_topics
                .iter()
                .map(|t| {
                    if t.topic.related_tokens.is_empty() {
                        t.topic.intent.to_string()
                    } else {
                        let tokens: Vec<&str> =
                            t.topic.related_tokens.iter().map(String::as_str).collect();
                        format!("{} ({})", t.topic.intent, tokens.join(", "))
                    }
                })
                .collect();
            out.push_str(&format!("\nRelated topics: {}\n", topics.join("; ")));
        }

        let favorites = ctx.preferences.top_tokens(3);
        if !favorites.is_empty() {
            out.push_str(&format!("Favorite tokens: {}\n", favorites.join(", ")));
        }

        if !ctx.preferences.preferred_timeframes.is_empty() {
            let timeframes: Vec<&str> = ctx
                .preferences
                .preferred_timeframes
                .iter()
                .map(String::as_str)
                .collect();
            out.push_str(&format!("Preferred timeframes: {}\n", timeframes.join(", ")));
        }

        out
    }

    /// Weighted coherence of the current query with the conversation.
    ///
    /// A bridging question is only suggested when the score is below the
    /// threshold and the current intent has no overlap with recent turns.
    pub fn judge_continuity(&self, ctx: &EnhancedContext) -> ContinuityJudgment {
        let overlap = ctx.is_fresh() || ctx.has_topic_overlap();
        let overlap_signal = if overlap { 1.0 } else { 0.0 };
        let score = (CONTINUITY_WEIGHT * ctx.metrics.continuity_score
            + CONFIDENCE_WEIGHT * ctx.analysis.confidence
            + OVERLAP_WEIGHT * overlap_signal)
            .clamp(0.0, 1.0);

        if ctx.is_fresh() {
            return ContinuityJudgment {
                is_coherent: true,
                confidence: score,
                suggested_follow_up: None,
            };
        }

        let is_coherent = score >= COHERENCE_THRESHOLD;
        let suggested_follow_up = match &ctx.last_topic {
            Some(last) if !is_coherent && !overlap && last.intent != ctx.analysis.primary_intent => {
                Some(bridging_question(last, ctx.analysis.primary_intent))
            }
            _ => None,
        };

        ContinuityJudgment {
            is_coherent,
            confidence: score,
            suggested_follow_up,
        }
    }

    /// Up to five follow-up prompts: intent templates first, then bridges to
    /// related topics, then favorite tokens not in this query
    pub fn predict_topics(&self, ctx: &EnhancedContext) -> Vec<String> {
        let analysis = &ctx.analysis;
        let subject = analysis
            .detected_tokens
            .first()
            .cloned()
            .or_else(|| ctx.preferences.top_tokens(1).into_iter().next())
            .unwrap_or_else(|| "bitcoin".to_string());
        let subject = display_token(&subject);

        let mut topics: Vec<String> = intent_templates(analysis.primary_intent, &subject);

        for related in &ctx.related_topics {
            if related.topic.intent != analysis.primary_intent {
                topics.push(format!("Tell me more about {}", related.topic.intent));
            }
        }

        for token in ctx.preferences.top_tokens(3) {
            if !analysis.detected_tokens.contains(&token) {
                topics.push(format!("What's the latest on {}?", display_token(&token)));
            }
        }

        let mut unique: Vec<String> = Vec::with_capacity(MAX_PREDICTED_TOPICS);
        for topic in topics {
            if !unique.contains(&topic) {
                unique.push(topic);
            }
        }
        unique.truncate(MAX_PREDICTED_TOPICS);
        unique
    }
}

/// Shared token OR same intent OR mentioned within the recency window
fn is_related(
    topic: &TopicMetadata,
    analysis: &Analysis,
    now: DateTime<Utc>,
    recency: chrono::Duration,
) -> bool {
    let shares_token = analysis
        .detected_tokens
        .iter()
        .any(|t| topic.related_tokens.contains(t));
    let same_intent = topic.name == analysis.primary_intent.as_str();
    let recent = now - topic.last_mentioned <= recency;

    shares_token || same_intent || recent
}

fn bridging_question(last: &TopicMetadata, current: Intent) -> String {
    let about = last
        .related_tokens
        .iter()
        .next()
        .map(|t| format!(" around {}", display_token(t)))
        .unwrap_or_default();

    format!(
        "Earlier we were discussing {}{}. Would you like to continue with that, or dive deeper into {}?",
        last.intent, about, current
    )
}

fn intent_templates(intent: Intent, subject: &str) -> Vec<String> {
    let templates: &[&str] = match intent {
        Intent::MarketData => &[
            "How has {} performed over the last 7 days?",
            "What is {}'s market cap compared to its peers?",
            "What is the 24h trading volume for {}?",
        ],
        Intent::Comparison => &[
            "Which of these tokens has stronger fundamentals?",
            "How do their 24h trading volumes compare?",
            "How does {} compare on market cap?",
        ],
        Intent::Technical => &[
            "What are the key support and resistance levels for {}?",
            "What does the RSI say about {} right now?",
        ],
        Intent::Educational => &[
            "What are the main risks of holding {}?",
            "How do I store {} safely?",
            "How is {} different from traditional finance?",
        ],
        Intent::News => &[
            "How did the market react to the latest {} news?",
            "Are there any regulatory updates affecting {}?",
        ],
        Intent::Regulatory => &[
            "How could new regulation affect {}'s price?",
            "What are the tax implications of trading {}?",
        ],
        Intent::Security => &[
            "How can I keep my {} wallet secure?",
            "What are the most common crypto scams to avoid?",
        ],
        Intent::Defi => &[
            "What are the risks of yield farming?",
            "Which DeFi protocols support {}?",
        ],
        Intent::General => &[
            "What's the current price of {}?",
            "Explain how blockchain technology works",
        ],
    };

    templates
        .iter()
        .map(|t| t.replace("{}", subject))
        .collect()
}

fn display_token(token: &str) -> String {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn level_label(level: TechnicalLevel) -> &'static str {
    match level {
        TechnicalLevel::Beginner => "beginner",
        TechnicalLevel::Intermediate => "intermediate",
        TechnicalLevel::Advanced => "advanced",
    }
}

fn clip(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        format!("{}...", text.chars().take(max).collect::<String>())
    }
}
