//! LLM provider abstraction.

pub mod anthropic;
pub mod provider;

pub use provider::{create_provider, CompletionRequest, CompletionResponse, LlmProvider};
