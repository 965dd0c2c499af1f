//! Delegation resolver: pending prompts become child executions
//!
//! Every intercepted prompt gets a child node at depth + 1. Below the depth
//! cap the child is a full recursive execution with its own sandbox session;
//! at the cap it collapses to a single completion call against the leaf
//! model. Batch prompts fan out in throttled groups so a wide
//! `llm_query_batch` cannot stampede the provider.

use crate::codegen;
use crate::executor::{cancellable, run_node, ExecCtx, ExecutorError};
use crate::sandbox::SandboxSession;
use crate::tree::{ExecutionEvent, ExecutionNode, NodeStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, warn};

/// System prompt for leaf delegation calls. Leaf answers are returned to the
/// paused program verbatim and never re-parsed for markers.
const LEAF_SYSTEM_PROMPT: &str = "You are answering a delegated sub-question from a larger \
analysis. Answer the question directly and concisely. Output only the answer, with no preamble \
and no code.";

/// Resolve a set of pending prompts into `(prompt, response)` pairs.
///
/// Prompts are resolved in groups of `batch_group_size`, with starts inside
/// a group staggered by `batch_stagger_ms` and a `batch_cooldown_ms` pause
/// between groups. All children of a group run to completion even when a
/// sibling fails; the first failure is then reported to the caller.
pub(crate) async fn resolve_pending(
    ctx: &Arc<ExecCtx>,
    parent_id: &str,
    parent_depth: u32,
    prompts: Vec<String>,
) -> Result<Vec<(String, String)>, ExecutorError> {
    if prompts.is_empty() {
        return Ok(Vec::new());
    }

    debug!(
        parent_id,
        parent_depth,
        count = prompts.len(),
        "Resolving pending delegations"
    );

    let group_size = ctx.executor_cfg.batch_group_size.max(1);
    let stagger = Duration::from_millis(ctx.executor_cfg.batch_stagger_ms);
    let cooldown = Duration::from_millis(ctx.executor_cfg.batch_cooldown_ms);
    let group_count = prompts.len().div_ceil(group_size);

    let mut resolved = Vec::with_capacity(prompts.len());
    let mut first_error: Option<ExecutorError> = None;

    for (group_index, group) in prompts.chunks(group_size).enumerate() {
        let mut tasks = JoinSet::new();
        for (offset, prompt) in group.iter().cloned().enumerate() {
            let ctx = Arc::clone(ctx);
            let parent_id = parent_id.to_string();
            let delay = stagger * offset as u32;
            tasks.spawn(async move {
                if !delay.is_zero() {
                    cancellable(&ctx.cancel, sleep(delay)).await?;
                }
                resolve_one(ctx, parent_id, parent_depth, prompt).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(|e| ExecutorError::Delegation(format!("delegation task panicked: {e}")))
                .and_then(|r| r);
            match outcome {
                Ok(pair) => resolved.push(pair),
                Err(ExecutorError::Cancelled) => {
                    first_error = Some(ExecutorError::Cancelled);
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if let Some(e) = first_error.take() {
            return Err(e);
        }

        if group_index + 1 < group_count {
            cancellable(&ctx.cancel, sleep(cooldown)).await?;
        }
    }

    Ok(resolved)
}

/// Resolve one prompt through its own child node.
async fn resolve_one(
    ctx: Arc<ExecCtx>,
    parent_id: String,
    parent_depth: u32,
    prompt: String,
) -> Result<(String, String), ExecutorError> {
    let child_depth = parent_depth + 1;

    let mut child = ExecutionNode::new(
        Some(parent_id),
        child_depth,
        &ctx.context_id,
        NodeStatus::LlmCalling,
    );
    child.delegated_prompt = Some(prompt.clone());
    let child_id = child.id.clone();

    ctx.emit(ExecutionEvent::NodeCreated { node: child });
    ctx.emit(ExecutionEvent::DelegationStarted {
        node_id: child_id.clone(),
        prompt: prompt.clone(),
    });

    let outcome = if child_depth < ctx.max_depth {
        resolve_recursive(&ctx, &child_id, child_depth, &prompt).await
    } else {
        resolve_leaf(&ctx, &prompt).await
    };

    match outcome {
        Ok(response) => {
            ctx.emit(ExecutionEvent::DelegationFinished {
                node_id: child_id.clone(),
                response: response.clone(),
            });
            ctx.status(&child_id, NodeStatus::Completed);
            Ok((prompt, response))
        }
        Err(ExecutorError::Cancelled) => Err(ExecutorError::Cancelled),
        Err(e) => {
            warn!(node_id = %child_id, error = %e, "Delegation failed");
            ctx.emit(ExecutionEvent::NodeErrored {
                node_id: child_id,
                error: e.to_string(),
            });
            Err(ExecutorError::Delegation(e.to_string()))
        }
    }
}

/// Sub-execution: the delegated prompt becomes the child's query and
/// context, and the child runs its own iterate-intercept-resume loop.
async fn resolve_recursive(
    ctx: &Arc<ExecCtx>,
    child_id: &str,
    child_depth: u32,
    prompt: &str,
) -> Result<String, ExecutorError> {
    let code = cancellable(
        &ctx.cancel,
        codegen::generate_program(
            ctx.provider.as_ref(),
            prompt,
            prompt.len(),
            ctx.executor_cfg.codegen_max_tokens,
        ),
    )
    .await??;

    ctx.status(child_id, NodeStatus::Executing);

    let mut session = cancellable(
        &ctx.cancel,
        SandboxSession::open(Arc::clone(&ctx.host), prompt, &ctx.sandbox_cfg),
    )
    .await??;

    let result = run_node(
        Arc::clone(ctx),
        child_id.to_string(),
        child_depth,
        code,
        &mut session,
    )
    .await;

    session.close().await;
    result
}

/// Leaf call: one direct completion, no sandbox.
async fn resolve_leaf(ctx: &Arc<ExecCtx>, prompt: &str) -> Result<String, ExecutorError> {
    let response = cancellable(
        &ctx.cancel,
        ctx.provider.complete(
            Some(LEAF_SYSTEM_PROMPT),
            prompt,
            ctx.executor_cfg.leaf_max_tokens,
        ),
    )
    .await??;
    Ok(response)
}
