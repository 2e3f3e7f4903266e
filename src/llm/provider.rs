//! LLM provider trait and factory.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::RunnerConfig;
use crate::error::{ConfigError, LlmError};
use crate::llm::anthropic::AnthropicProvider;

/// A single completion request: one prompt in, one text out.
#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub timeout: Duration,
}

/// Completion result with token accounting.
#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Vendor-agnostic LLM client.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Model identifier reported in attestations.
    fn model_name(&self) -> &str;

    /// Run a completion. The call is aborted once `request.timeout` elapses.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError>;
}

/// Build the configured provider.
pub fn create_provider(config: &RunnerConfig) -> Result<Arc<dyn LlmProvider>, ConfigError> {
    let api_key = config
        .api_key
        .clone()
        .ok_or_else(|| ConfigError::MissingEnvVar("ANTHROPIC_API_KEY".into()))?;
    Ok(Arc::new(AnthropicProvider::new(
        api_key,
        config.model.clone(),
    )))
}
