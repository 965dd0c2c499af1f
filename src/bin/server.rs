//! RLM Server binary

use anyhow::{Context, Result};
use rlm_engine::api::{create_router, ApiState};
use rlm_engine::executor::Executor;
use rlm_engine::pool::SandboxPool;
use rlm_engine::provider::OpenAiCompatProvider;
use rlm_engine::sandbox::PythonInterpreterProvider;
use rlm_engine::{CompletionProvider, InterpreterProvider, RlmConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging (RUST_LOG overrides the default level)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .init();

    info!("Starting RLM Server v{}", env!("CARGO_PKG_VERSION"));

    // Load config from file
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.toml".to_string());

    let config_contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path))?;

    let config: RlmConfig = toml::from_str(&config_contents)
        .with_context(|| format!("Failed to parse config file: {}", config_path))?;

    info!(
        config_path = config_path,
        model = config.provider.model,
        base_url = config.provider.base_url,
        max_depth = config.executor.max_depth,
        "Loaded configuration"
    );

    let api_key = config
        .provider
        .api_key
        .clone()
        .or_else(|| std::env::var("RLM_API_KEY").ok());

    let provider: Arc<dyn CompletionProvider> = Arc::new(OpenAiCompatProvider::new(
        &config.provider.base_url,
        api_key,
        &config.provider.model,
    ));

    let interpreter_provider: Arc<dyn InterpreterProvider> =
        Arc::new(PythonInterpreterProvider::new(&config.sandbox.python_bin));
    let pool = Arc::new(SandboxPool::new(
        interpreter_provider,
        config.sandbox.pool_max_idle,
    ));
    pool.clone().start_reap_task(
        Duration::from_secs(config.sandbox.pool_idle_ttl_secs),
        Duration::from_secs(60),
    );

    let executor = Arc::new(Executor::new(
        Arc::clone(&provider),
        pool,
        config.executor.clone(),
        config.sandbox.clone(),
    ));

    let state = Arc::new(ApiState {
        executor,
        model: config.provider.model.clone(),
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
