//! The execution loop: run, intercept, resolve, resume
//!
//! One loop drives one node. It runs the generated program in a sandbox
//! session, decodes the captured output for protocol markers, resolves any
//! pending delegation out of band, then re-runs the same unmodified body
//! with the resolutions seeded into the preamble cache. Because each run is
//! a clean interpreter invocation, prior delegations replay instantly from
//! cache and only newly reached calls pause the program again. The loop
//! ends on a FINAL marker, a terminal error, or the iteration budget.

use crate::codegen::{self, CodeGenError};
use crate::protocol::{self, DecodeError, Decoded};
use crate::provider::{CompletionProvider, ProviderError};
use crate::resolver;
use crate::sandbox::{ExitStatus, InterpreterHost, SandboxSession, SessionError};
use crate::tree::{EventSink, ExecutionEvent, ExecutionNode, NodeStatus};
use crate::{ExecutorConfig, SandboxConfig};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result text used when a program exits cleanly without printing anything.
const EMPTY_RESULT_PLACEHOLDER: &str = "(no output)";

/// Errors from the execution loop
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Code generation error: {0}")]
    CodeGen(#[from] CodeGenError),

    #[error("Max iterations ({0}) exceeded without a final result")]
    IterationBudget(usize),

    #[error("Delegation failed: {0}")]
    Delegation(String),

    /// Not a failure: the caller tore the run down. Suppresses further
    /// events for the affected branch.
    #[error("Execution cancelled")]
    Cancelled,
}

/// A top-level execution request
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ExecutionRequest {
    pub query: String,
    pub context: String,

    /// Logical context/session id; generated when absent, propagated
    /// unchanged to every descendant node.
    #[serde(default)]
    pub context_id: Option<String>,

    /// Maximum delegation depth for this request
    #[serde(default)]
    pub max_depth: Option<u32>,
}

/// Everything one execution shares across its recursive call graph.
pub(crate) struct ExecCtx {
    pub provider: Arc<dyn CompletionProvider>,
    pub host: Arc<dyn InterpreterHost>,
    pub executor_cfg: ExecutorConfig,
    pub sandbox_cfg: SandboxConfig,
    pub sink: Arc<dyn EventSink>,
    pub cancel: CancellationToken,
    pub context_id: String,
    pub max_depth: u32,
}

impl ExecCtx {
    pub fn emit(&self, event: ExecutionEvent) {
        self.sink.emit(event);
    }

    pub fn status(&self, node_id: &str, status: NodeStatus) {
        self.emit(ExecutionEvent::NodeStatusChanged {
            node_id: node_id.to_string(),
            status,
        });
    }
}

/// The RLM executor: one per deployment, shared across requests.
pub struct Executor {
    provider: Arc<dyn CompletionProvider>,
    host: Arc<dyn InterpreterHost>,
    executor_cfg: ExecutorConfig,
    sandbox_cfg: SandboxConfig,
}

impl Executor {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        host: Arc<dyn InterpreterHost>,
        executor_cfg: ExecutorConfig,
        sandbox_cfg: SandboxConfig,
    ) -> Self {
        Self {
            provider,
            host,
            executor_cfg,
            sandbox_cfg,
        }
    }

    /// Run one request to completion, emitting events into `sink`.
    ///
    /// Exactly one of `ExecutionComplete` / `ExecutionError` is emitted,
    /// except under cancellation, where the stream simply ends.
    pub async fn execute(
        &self,
        request: ExecutionRequest,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<String, ExecutorError> {
        let ctx = Arc::new(ExecCtx {
            provider: Arc::clone(&self.provider),
            host: Arc::clone(&self.host),
            executor_cfg: self.executor_cfg.clone(),
            sandbox_cfg: self.sandbox_cfg.clone(),
            sink,
            cancel,
            context_id: request
                .context_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            max_depth: request.max_depth.unwrap_or(self.executor_cfg.max_depth),
        });

        if ctx.cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        info!(
            context_id = %ctx.context_id,
            max_depth = ctx.max_depth,
            context_len = request.context.len(),
            "Starting execution"
        );

        let result = self.execute_root(&ctx, &request).await;

        match &result {
            Ok(answer) => {
                debug!(answer_len = answer.len(), "Execution complete");
                ctx.emit(ExecutionEvent::ExecutionComplete {
                    result: answer.clone(),
                });
            }
            Err(ExecutorError::Cancelled) => {
                info!(context_id = %ctx.context_id, "Execution cancelled");
            }
            Err(e) => {
                warn!(error = %e, "Execution failed");
                ctx.emit(ExecutionEvent::ExecutionError {
                    error: e.to_string(),
                });
            }
        }

        result
    }

    /// Spawn an execution and return its live event stream. The stream ends
    /// after the terminal event (or silently, on cancellation).
    pub fn execute_with_delegation(
        self: &Arc<Self>,
        request: ExecutionRequest,
        cancel: CancellationToken,
    ) -> mpsc::UnboundedReceiver<ExecutionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let executor = Arc::clone(self);
        tokio::spawn(async move {
            let sink: Arc<dyn EventSink> = Arc::new(tx);
            let _ = executor.execute(request, sink, cancel).await;
        });
        rx
    }

    async fn execute_root(
        &self,
        ctx: &Arc<ExecCtx>,
        request: &ExecutionRequest,
    ) -> Result<String, ExecutorError> {
        // Author the root program before the node surfaces, so NodeCreated
        // carries the code it will run.
        let code = cancellable(
            &ctx.cancel,
            codegen::generate_program(
                ctx.provider.as_ref(),
                &request.query,
                request.context.len(),
                ctx.executor_cfg.codegen_max_tokens,
            ),
        )
        .await??;

        let mut root = ExecutionNode::new(None, 0, &ctx.context_id, NodeStatus::Pending);
        root.code = code.clone();
        let root_id = root.id.clone();
        ctx.emit(ExecutionEvent::NodeCreated { node: root });

        let mut session = cancellable(
            &ctx.cancel,
            SandboxSession::open(Arc::clone(&ctx.host), &request.context, &ctx.sandbox_cfg),
        )
        .await?
        .map_err(|e| {
            ctx.emit(ExecutionEvent::NodeErrored {
                node_id: root_id.clone(),
                error: e.to_string(),
            });
            ExecutorError::from(e)
        })?;

        ctx.status(&root_id, NodeStatus::Executing);

        let result = run_node(Arc::clone(ctx), root_id.clone(), 0, code, &mut session).await;

        // The session is released on every exit path, cancellation included.
        session.close().await;

        match result {
            Ok(answer) => {
                ctx.status(&root_id, NodeStatus::Completed);
                Ok(answer)
            }
            Err(ExecutorError::Cancelled) => Err(ExecutorError::Cancelled),
            Err(e) => {
                ctx.emit(ExecutionEvent::NodeErrored {
                    node_id: root_id,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

/// Await a future unless the token fires first.
pub(crate) async fn cancellable<F, T>(
    cancel: &CancellationToken,
    fut: F,
) -> Result<T, ExecutorError>
where
    F: Future<Output = T>,
{
    tokio::select! {
        _ = cancel.cancelled() => Err(ExecutorError::Cancelled),
        out = fut => Ok(out),
    }
}

/// Drive one node's iterate-intercept-resume loop to a terminal state.
///
/// Boxed because the loop recurses through the delegation resolver for
/// sub-executions at depth + 1.
pub(crate) fn run_node<'a>(
    ctx: Arc<ExecCtx>,
    node_id: String,
    depth: u32,
    body: String,
    session: &'a mut SandboxSession,
) -> Pin<Box<dyn Future<Output = Result<String, ExecutorError>> + Send + 'a>> {
    Box::pin(async move {
        // Resolutions accumulate for the life of this node and are
        // re-encoded into a fresh preamble on every run.
        let mut cache: BTreeMap<String, String> = BTreeMap::new();

        for iteration in 0..ctx.executor_cfg.max_iterations {
            debug!(node_id = %node_id, depth, iteration = iteration + 1, "Loop iteration");

            let out = cancellable(&ctx.cancel, session.run(&body, &cache)).await??;

            // Surface the program's own text; skip marker-only output.
            let cleaned = protocol::strip_markers(&out.merged);
            if !cleaned.trim().is_empty() {
                ctx.emit(ExecutionEvent::NodeOutputAppended {
                    node_id: node_id.clone(),
                    text: cleaned.clone(),
                });
            }

            if out.status == ExitStatus::Crashed {
                return Err(SessionError::Crashed(format!(
                    "environment died without an exit status; partial output: {}",
                    out.merged
                ))
                .into());
            }

            match protocol::decode(&out.stdout)? {
                Decoded::Final(result) => {
                    debug!(node_id = %node_id, "FINAL marker decoded");
                    return Ok(result);
                }
                Decoded::PendingSingle(prompt) => {
                    resolve_and_cache(&ctx, &node_id, depth, vec![prompt], &mut cache).await?;
                }
                Decoded::PendingBatch(prompts) => {
                    resolve_and_cache(&ctx, &node_id, depth, prompts, &mut cache).await?;
                }
                Decoded::None => {
                    return match out.status {
                        // Clean exit with nothing pending and no FINAL is
                        // implicit success, by policy.
                        ExitStatus::Success => {
                            let stdout_clean = protocol::strip_markers(&out.stdout);
                            let trailing = stdout_clean.trim();
                            if trailing.is_empty() {
                                Ok(EMPTY_RESULT_PLACEHOLDER.to_string())
                            } else {
                                Ok(trailing.to_string())
                            }
                        }
                        ExitStatus::Failure(code) => Err(SessionError::Program {
                            code,
                            detail: out.merged,
                        }
                        .into()),
                        ExitStatus::Crashed => unreachable!("handled above"),
                    };
                }
            }
        }

        Err(ExecutorError::IterationBudget(ctx.executor_cfg.max_iterations))
    })
}

/// Resolve a pending prompt set and merge the responses into the cache.
async fn resolve_and_cache(
    ctx: &Arc<ExecCtx>,
    node_id: &str,
    depth: u32,
    prompts: Vec<String>,
    cache: &mut BTreeMap<String, String>,
) -> Result<(), ExecutorError> {
    ctx.status(node_id, NodeStatus::LlmCalling);
    let resolved = resolver::resolve_pending(ctx, node_id, depth, prompts).await?;
    cache.extend(resolved);
    ctx.status(node_id, NodeStatus::Executing);
    Ok(())
}
