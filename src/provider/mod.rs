//! Model-completion provider abstraction

mod openai;

pub use openai::OpenAiCompatProvider;

use async_trait::async_trait;
use thiserror::Error;

/// Errors that can occur when interacting with a completion provider
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("JSON serialization/deserialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Provider returned error: {0}")]
    ProviderError(String),

    #[error("Provider returned an empty completion")]
    EmptyCompletion,
}

/// Trait for completion providers. Implementations must tolerate many
/// concurrent in-flight calls; batch delegation fans out across them.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logging/identification
    fn name(&self) -> &str;

    /// Model being used
    fn model(&self) -> &str;

    /// Send one completion request and return the generated text.
    async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        max_tokens: u32,
    ) -> Result<String, ProviderError>;
}
