//! Crypto Chat Orchestrator
//!
//! A conversational assistant for cryptocurrency questions that:
//! - Classifies each query into an intent with an LLM, validated by schema
//! - Fetches live market data with provider fallback and rate budgets
//! - Adds web search results for news, regulatory and security questions
//! - Remembers each session's topics, preferences and continuity
//! - Summarizes everything into one grounded answer with follow-up suggestions
//!
//! TURN:
//! VALIDATE CONFIG → CLASSIFY → BUILD CONTEXT → AGGREGATE? → SUMMARIZE → PERSIST → RESPOND

pub mod agent;
pub mod aggregator;
pub mod classifier;
pub mod config;
pub mod error;
pub mod llm;
pub mod memory;
pub mod models;
pub mod retry;
pub mod summarizer;

#[cfg(test)]
mod test_support;

pub use error::{ErrorKind, OrchestrationError, QueryError, Result};

// Re-export common types
pub use agent::Orchestrator;
pub use models::*;
