//! Conversation Store
//!
//! Process-wide, session-keyed memory: bounded message history, topic
//! relevance with time decay, inferred user preferences and a rolling
//! continuity score. Sessions are swept in the background once idle past
//! the expiry window.

use crate::config::SessionConfig;
use crate::models::{Analysis, Intent};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Role of a message sender
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

/// Classification facts attached to a message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MessageMetadata {
    pub intent: Intent,
    pub confidence: f64,
    pub detected_tokens: Vec<String>,
    /// Coherence of this turn with the conversation so far
    pub contextual_confidence: Option<f64>,
    pub timeframe: Option<String>,
}

impl MessageMetadata {
    pub fn from_analysis(analysis: &Analysis) -> Self {
        Self {
            intent: analysis.primary_intent,
            confidence: clamp_unit(analysis.confidence),
            detected_tokens: analysis.detected_tokens.clone(),
            contextual_confidence: None,
            timeframe: analysis.time_context.timeframe.clone(),
        }
    }

    pub fn with_contextual_confidence(mut self, confidence: f64) -> Self {
        self.contextual_confidence = Some(clamp_unit(confidence));
        self
    }
}

/// A single message; never modified once appended
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub role: MessageRole,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: Option<MessageMetadata>,
}

impl ChatMessage {
    pub fn new(role: MessageRole, content: impl Into<String>, metadata: Option<MessageMetadata>) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            content: content.into(),
            timestamp: Utc::now(),
            metadata,
        }
    }

    pub fn user(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(MessageRole::User, content, Some(metadata))
    }

    pub fn assistant(content: impl Into<String>, metadata: MessageMetadata) -> Self {
        Self::new(MessageRole::Assistant, content, Some(metadata))
    }

    /// Override the timestamp (replayed or backdated messages)
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// One entry per distinct intent seen in a session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TopicMetadata {
    pub name: String,
    pub intent: Intent,
    pub frequency: u32,
    pub last_mentioned: DateTime<Utc>,
    pub related_tokens: BTreeSet<String>,
    pub confidence: f64,
}

/// Weight of the newest evidence when blending topic confidence
const TOPIC_CONFIDENCE_ALPHA: f64 = 0.6;

impl TopicMetadata {
    fn new(intent: Intent, confidence: f64, tokens: &[String], now: DateTime<Utc>) -> Self {
        Self {
            name: intent.as_str().to_string(),
            intent,
            frequency: 1,
            last_mentioned: now,
            related_tokens: tokens.iter().cloned().collect(),
            confidence: clamp_unit(confidence),
        }
    }

    fn record(&mut self, confidence: f64, tokens: &[String], now: DateTime<Utc>) {
        self.frequency = self.frequency.saturating_add(1);
        self.last_mentioned = self.last_mentioned.max(now);
        self.confidence = clamp_unit(
            (1.0 - TOPIC_CONFIDENCE_ALPHA) * self.confidence
                + TOPIC_CONFIDENCE_ALPHA * clamp_unit(confidence),
        );
        self.related_tokens.extend(tokens.iter().cloned());
    }

    /// Frequency-weighted confidence, discounted exponentially by idle time
    pub fn importance_at(&self, now: DateTime<Utc>, decay_window: Duration) -> f64 {
        let idle_secs = (now - self.last_mentioned).num_milliseconds().max(0) as f64 / 1000.0;
        let window_secs = decay_window.as_secs_f64().max(1.0);
        let frequency_weight = 1.0 + f64::from(self.frequency.max(1)).ln();

        self.confidence * frequency_weight * (-idle_secs / window_secs).exp()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TechnicalLevel {
    Beginner,
    Intermediate,
    Advanced,
}

/// Inferred incrementally; every field only accumulates
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserPreferences {
    /// Token → number of turns it was mentioned in
    pub favorite_tokens: BTreeMap<String, u32>,
    pub preferred_timeframes: BTreeSet<String>,
    pub interests: BTreeSet<Intent>,
    pub technical_level: TechnicalLevel,
    pub last_updated: DateTime<Utc>,
}

impl UserPreferences {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            favorite_tokens: BTreeMap::new(),
            preferred_timeframes: BTreeSet::new(),
            interests: BTreeSet::new(),
            technical_level: TechnicalLevel::Beginner,
            last_updated: now,
        }
    }

    fn absorb(&mut self, metadata: &MessageMetadata, now: DateTime<Utc>) {
        for token in &metadata.detected_tokens {
            *self.favorite_tokens.entry(token.clone()).or_insert(0) += 1;
        }
        if let Some(timeframe) = &metadata.timeframe {
            self.preferred_timeframes.insert(timeframe.clone());
        }
        self.interests.insert(metadata.intent);

        let inferred = if self.interests.contains(&Intent::Technical)
            || self.interests.contains(&Intent::Defi)
        {
            TechnicalLevel::Advanced
        } else if self.interests.contains(&Intent::MarketData)
            || self.interests.contains(&Intent::Comparison)
        {
            TechnicalLevel::Intermediate
        } else {
            TechnicalLevel::Beginner
        };
        self.technical_level = self.technical_level.max(inferred);
        self.last_updated = self.last_updated.max(now);
    }

    /// Most mentioned tokens first; ties broken alphabetically
    pub fn top_tokens(&self, limit: usize) -> Vec<String> {
        let mut tokens: Vec<(&String, &u32)> = self.favorite_tokens.iter().collect();
        tokens.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        tokens
            .into_iter()
            .take(limit)
            .map(|(token, _)| token.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationMetadata {
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
    /// Messages ever appended, including ones since dropped by the cap
    pub message_count: u64,
    pub topics: BTreeMap<Intent, TopicMetadata>,
    pub user_preferences: UserPreferences,
    pub continuity_score: f64,
}

impl ConversationMetadata {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            created_at: now,
            last_active: now,
            message_count: 0,
            topics: BTreeMap::new(),
            user_preferences: UserPreferences::empty(now),
            continuity_score: 1.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub messages: VecDeque<ChatMessage>,
    pub metadata: ConversationMetadata,
}

impl Session {
    fn new(id: String, now: DateTime<Utc>) -> Self {
        Self {
            id,
            messages: VecDeque::new(),
            metadata: ConversationMetadata::new(now),
        }
    }
}

/// A topic with its decayed importance at read time
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RankedTopic {
    pub topic: TopicMetadata,
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub session_id: String,
    pub message_count: u64,
    pub stored_messages: usize,
    pub top_topics: Vec<RankedTopic>,
    pub favorite_tokens: Vec<String>,
    pub technical_level: TechnicalLevel,
    pub continuity_score: f64,
    pub age_secs: i64,
}

// ===== Continuity =====

const CONTINUITY_HISTORY_WEIGHT: f64 = 0.4;
const TURN_SIGNAL_WEIGHT: f64 = 0.6;
const TURN_CONFIDENCE_WEIGHT: f64 = 0.4;

fn clamp_unit(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

/// Recompute continuity after an assistant turn.
///
/// The turn counts as continuous when its intent matches the previous
/// user turn's intent, or when an earlier turn on the same intent is still
/// inside the decay window.
fn next_continuity(
    previous_score: f64,
    messages: &VecDeque<ChatMessage>,
    current: &MessageMetadata,
    now: DateTime<Utc>,
    decay_window: Duration,
) -> f64 {
    let mut earlier_user_turns = messages
        .iter()
        .rev()
        .filter(|m| m.role == MessageRole::User)
        .filter_map(|m| m.metadata.as_ref().map(|meta| (m.timestamp, meta)))
        .skip(1);

    let previous_intent = earlier_user_turns.clone().next().map(|(_, meta)| meta.intent);
    let window = chrono::Duration::from_std(decay_window).unwrap_or(chrono::Duration::MAX);

    let matches_previous = previous_intent.map_or(true, |intent| intent == current.intent);
    let hot_topic = earlier_user_turns
        .any(|(at, meta)| meta.intent == current.intent && now - at <= window);

    let signal = if matches_previous || hot_topic { 1.0 } else { 0.0 };
    let turn_score =
        TURN_SIGNAL_WEIGHT * signal + TURN_CONFIDENCE_WEIGHT * clamp_unit(current.confidence);

    clamp_unit(
        CONTINUITY_HISTORY_WEIGHT * clamp_unit(previous_score)
            + (1.0 - CONTINUITY_HISTORY_WEIGHT) * turn_score,
    )
}

// ===== Store =====

/// Session-keyed conversation memory, shared by `Arc`
pub struct ConversationStore {
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Session>>,
    request_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl ConversationStore {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            request_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn create_session(&self) -> String {
        let id = Uuid::new_v4().to_string();
        let mut sessions = self.sessions.write().await;
        sessions.insert(id.clone(), Session::new(id.clone(), Utc::now()));
        debug!(session_id = %id, "Session created");
        id
    }

    /// Create the session if missing, otherwise mark it active.
    /// Returns true when a new session was created.
    pub async fn ensure_session(&self, session_id: &str) -> bool {
        let now = Utc::now();
        let mut sessions = self.sessions.write().await;

        match sessions.get_mut(session_id) {
            Some(session) => {
                session.metadata.last_active = session.metadata.last_active.max(now);
                false
            }
            None => {
                sessions.insert(
                    session_id.to_string(),
                    Session::new(session_id.to_string(), now),
                );
                debug!(session_id, "Session created lazily");
                true
            }
        }
    }

    /// Append a message, creating the session on first use.
    ///
    /// User messages with metadata update topics and preferences; assistant
    /// messages recompute the continuity score.
    pub async fn append_message(&self, session_id: &str, message: ChatMessage) {
        let now = message.timestamp;
        let decay_window = self.config.topic_decay_window;
        let max_messages = self.config.max_messages.max(1);

        let mut sessions = self.sessions.write().await;
        let session = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| Session::new(session_id.to_string(), now));

        let role = message.role;
        let metadata = message.metadata.clone();

        session.messages.push_back(message);
        while session.messages.len() > max_messages {
            session.messages.pop_front();
        }

        let meta = &mut session.metadata;
        meta.message_count += 1;
        meta.last_active = meta.last_active.max(now);

        match (role, metadata) {
            (MessageRole::User, Some(turn)) => {
                meta.topics
                    .entry(turn.intent)
                    .and_modify(|topic| topic.record(turn.confidence, &turn.detected_tokens, now))
                    .or_insert_with(|| {
                        TopicMetadata::new(turn.intent, turn.confidence, &turn.detected_tokens, now)
                    });
                meta.user_preferences.absorb(&turn, now);
            }
            (MessageRole::Assistant, assistant_meta) => {
                let current = assistant_meta.or_else(|| {
                    session
                        .messages
                        .iter()
                        .rev()
                        .find(|m| m.role == MessageRole::User)
                        .and_then(|m| m.metadata.clone())
                });

                if let Some(current) = current {
                    let score = next_continuity(
                        session.metadata.continuity_score,
                        &session.messages,
                        &current,
                        now,
                        decay_window,
                    );
                    debug!(session_id, continuity = score, "Continuity updated");
                    session.metadata.continuity_score = score;
                }
            }
            _ => {}
        }
    }

    /// The last `count` messages, oldest first
    pub async fn recent_messages(&self, session_id: &str, count: usize) -> Vec<ChatMessage> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| {
                let skip = s.messages.len().saturating_sub(count);
                s.messages.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    pub async fn metadata(&self, session_id: &str) -> Option<ConversationMetadata> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).map(|s| s.metadata.clone())
    }

    pub async fn snapshot(&self, session_id: &str) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.get(session_id).cloned()
    }

    pub async fn ranked_topics(&self, session_id: &str) -> Vec<RankedTopic> {
        self.ranked_topics_at(session_id, Utc::now()).await
    }

    /// Topics by decayed importance, most important first
    pub async fn ranked_topics_at(&self, session_id: &str, now: DateTime<Utc>) -> Vec<RankedTopic> {
        let sessions = self.sessions.read().await;
        let Some(session) = sessions.get(session_id) else {
            return Vec::new();
        };

        let mut ranked: Vec<RankedTopic> = session
            .metadata
            .topics
            .values()
            .map(|topic| RankedTopic {
                importance: topic.importance_at(now, self.config.topic_decay_window),
                topic: topic.clone(),
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.importance
                .total_cmp(&a.importance)
                .then_with(|| b.topic.last_mentioned.cmp(&a.topic.last_mentioned))
        });
        ranked
    }

    pub async fn favorite_tokens(&self, session_id: &str, limit: usize) -> Vec<String> {
        let sessions = self.sessions.read().await;
        sessions
            .get(session_id)
            .map(|s| s.metadata.user_preferences.top_tokens(limit))
            .unwrap_or_default()
    }

    pub async fn summary(&self, session_id: &str) -> Option<ConversationSummary> {
        let now = Utc::now();
        let top_topics: Vec<RankedTopic> = self
            .ranked_topics_at(session_id, now)
            .await
            .into_iter()
            .take(3)
            .collect();

        let sessions = self.sessions.read().await;
        let session = sessions.get(session_id)?;
        let meta = &session.metadata;

        Some(ConversationSummary {
            session_id: session_id.to_string(),
            message_count: meta.message_count,
            stored_messages: session.messages.len(),
            top_topics,
            favorite_tokens: meta.user_preferences.top_tokens(5),
            technical_level: meta.user_preferences.technical_level,
            continuity_score: meta.continuity_score,
            age_secs: (now - meta.created_at).num_seconds().max(0),
        })
    }

    pub async fn delete_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().await.remove(session_id).is_some();
        self.request_locks
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(session_id);
        removed
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    // ===== Concurrency =====

    /// Serialize requests for one session. The guard is held for a whole
    /// turn; other sessions are unaffected.
    pub async fn lock_session(&self, session_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.request_locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(session_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now()).await
    }

    /// Remove sessions idle past the expiry window. A session whose request
    /// lock is held is skipped and reconsidered on the next sweep.
    pub async fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expiry = chrono::Duration::from_std(self.config.expiry).unwrap_or(chrono::Duration::MAX);
        let mut sessions = self.sessions.write().await;

        let expired: Vec<String> = sessions
            .values()
            .filter(|s| now - s.metadata.last_active > expiry)
            .map(|s| s.id.clone())
            .collect();

        let mut locks = self.request_locks.lock().unwrap_or_else(|p| p.into_inner());
        let mut removed = 0;

        for id in expired {
            let _guard = match locks.get(&id) {
                Some(lock) => match lock.clone().try_lock_owned() {
                    Ok(guard) => Some(guard),
                    Err(_) => {
                        debug!(session_id = %id, "Skipping busy session during sweep");
                        continue;
                    }
                },
                None => None,
            };

            sessions.remove(&id);
            locks.remove(&id);
            removed += 1;
        }

        if removed > 0 {
            info!(removed, remaining = sessions.len(), "Expired sessions swept");
        }
        removed
    }

    /// Periodic sweep on a background task. The task ends once the store
    /// has been dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        let period = self.config.sweep_interval.max(Duration::from_millis(10));

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    debug!("Conversation store dropped, sweeper exiting");
                    break;
                };
                store.sweep_expired().await;
            }
        })
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
