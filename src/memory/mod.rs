//! Conversation Memory
//!
//! Session storage with topic tracking, plus the per-query context view
//! built on top of it.

pub mod context;
pub mod store;

pub use context::{ContextBuilder, ContinuityJudgment, EnhancedContext};
pub use store::{ChatMessage, ConversationStore, MessageMetadata, MessageRole};
