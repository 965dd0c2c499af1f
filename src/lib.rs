//! RLM Engine - Recursive Language Model execution core
//!
//! This crate provides:
//! - A marker protocol for intercepting `llm_query` calls made by sandboxed code
//! - Sandboxed Python execution with pause/resolve/cache/resume semantics
//! - Recursive delegation of sub-prompts to further model calls, bounded by depth
//! - An event-sourced execution tree for live observability

pub mod api;
pub mod codegen;
pub mod executor;
pub mod pool;
pub mod protocol;
pub mod provider;
pub mod resolver;
pub mod sandbox;
pub mod tree;

pub use executor::{ExecutionRequest, Executor, ExecutorError};
pub use provider::{CompletionProvider, ProviderError};
pub use sandbox::{InterpreterProvider, SandboxSession, SessionError};
pub use tree::{EventSink, ExecutionEvent, ExecutionNode, NodeStatus, TreeState};

/// Configuration for the RLM engine
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RlmConfig {
    /// Execution loop settings
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Sandbox settings
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Completion provider configuration
    pub provider: ProviderConfig,
}

/// Execution loop and delegation settings
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExecutorConfig {
    /// Maximum iterations of one node's run-intercept-resume loop
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Default maximum delegation depth (callers may override per request)
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,

    /// Number of batch prompts resolved concurrently
    #[serde(default = "default_batch_group_size")]
    pub batch_group_size: usize,

    /// Stagger between request starts within a batch group (ms)
    #[serde(default = "default_batch_stagger_ms")]
    pub batch_stagger_ms: u64,

    /// Cooldown between batch groups (ms)
    #[serde(default = "default_batch_cooldown_ms")]
    pub batch_cooldown_ms: u64,

    /// Max tokens for generated programs
    #[serde(default = "default_codegen_max_tokens")]
    pub codegen_max_tokens: u32,

    /// Max tokens for leaf delegation answers
    #[serde(default = "default_leaf_max_tokens")]
    pub leaf_max_tokens: u32,
}

fn default_max_iterations() -> usize { 100 }
fn default_max_depth() -> u32 { 1 }
fn default_batch_group_size() -> usize { 10 }
fn default_batch_stagger_ms() -> u64 { 100 }
fn default_batch_cooldown_ms() -> u64 { 2000 }
fn default_codegen_max_tokens() -> u32 { 4096 }
fn default_leaf_max_tokens() -> u32 { 1024 }

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_depth: default_max_depth(),
            batch_group_size: default_batch_group_size(),
            batch_stagger_ms: default_batch_stagger_ms(),
            batch_cooldown_ms: default_batch_cooldown_ms(),
            codegen_max_tokens: default_codegen_max_tokens(),
            leaf_max_tokens: default_leaf_max_tokens(),
        }
    }
}

/// Sandbox session settings
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SandboxConfig {
    /// Hard wall-clock timeout for one run (seconds)
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,

    /// Provisioning attempts before giving up
    #[serde(default = "default_provision_attempts")]
    pub provision_attempts: u32,

    /// Base backoff between provisioning attempts (ms, doubled each retry)
    #[serde(default = "default_provision_backoff_ms")]
    pub provision_backoff_ms: u64,

    /// Context payloads above this size go through a side-channel file (bytes)
    #[serde(default = "default_inline_context_limit")]
    pub inline_context_limit: usize,

    /// Python interpreter binary
    #[serde(default = "default_python_bin")]
    pub python_bin: String,

    /// Released environments parked for reuse (0 disables pooling)
    #[serde(default = "default_pool_max_idle")]
    pub pool_max_idle: usize,

    /// How long a parked environment may sit idle before it is destroyed
    #[serde(default = "default_pool_idle_ttl_secs")]
    pub pool_idle_ttl_secs: u64,
}

fn default_run_timeout_secs() -> u64 { 300 }
fn default_provision_attempts() -> u32 { 3 }
fn default_provision_backoff_ms() -> u64 { 500 }
fn default_inline_context_limit() -> usize { 1024 * 1024 }
fn default_python_bin() -> String { "python3".to_string() }
fn default_pool_max_idle() -> usize { 4 }
fn default_pool_idle_ttl_secs() -> u64 { 300 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            run_timeout_secs: default_run_timeout_secs(),
            provision_attempts: default_provision_attempts(),
            provision_backoff_ms: default_provision_backoff_ms(),
            inline_context_limit: default_inline_context_limit(),
            python_bin: default_python_bin(),
            pool_max_idle: default_pool_max_idle(),
            pool_idle_ttl_secs: default_pool_idle_ttl_secs(),
        }
    }
}

/// Configuration for the completion provider
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ProviderConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint
    pub base_url: String,

    /// Model name
    pub model: String,

    /// Optional API key (falls back to RLM_API_KEY in the binaries)
    pub api_key: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_defaults_match_recommended_policy() {
        let cfg = ExecutorConfig::default();
        assert_eq!(cfg.max_iterations, 100);
        assert_eq!(cfg.max_depth, 1);
        assert_eq!(cfg.batch_group_size, 10);
        assert_eq!(cfg.batch_stagger_ms, 100);
        assert_eq!(cfg.batch_cooldown_ms, 2000);
    }

    #[test]
    fn config_parses_with_partial_sections() {
        let cfg: RlmConfig = toml::from_str(
            r#"
            [provider]
            base_url = "http://localhost:4000"
            model = "deepseek-chat"

            [executor]
            max_depth = 2
            "#,
        )
        .unwrap();
        assert_eq!(cfg.executor.max_depth, 2);
        assert_eq!(cfg.executor.max_iterations, 100);
        assert_eq!(cfg.sandbox.run_timeout_secs, 300);
        assert!(cfg.provider.api_key.is_none());
    }
}
