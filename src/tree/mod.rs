//! Event-sourced model of the recursive execution tree
//!
//! The executor never mutates tree state in place: every lifecycle
//! transition is emitted as an [`ExecutionEvent`], and [`TreeState`] is a
//! pure fold over that event sequence. The fold exists for observability
//! (live visualization, debugging), not for execution correctness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Status of a single node's execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Pending,
    Executing,
    LlmCalling,
    Completed,
    Error,
}

impl NodeStatus {
    /// Whether a node in this status can still transition.
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeStatus::Completed | NodeStatus::Error)
    }
}

/// One unit of delegated work in the recursion tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionNode {
    /// Opaque unique identifier
    pub id: String,

    /// Node that spawned this one; absent for the root
    pub parent_id: Option<String>,

    /// Delegation hops from the root; root is 0
    pub depth: u32,

    pub status: NodeStatus,

    /// Generated program text this node runs (empty for leaf delegations)
    #[serde(default)]
    pub code: String,

    /// Accumulated marker-stripped output, append-only
    #[serde(default)]
    pub output: String,

    /// Prompt sent to the resolution step, once delegation starts
    pub delegated_prompt: Option<String>,

    /// Response received from the resolution step
    pub delegated_response: Option<String>,

    /// Logical context/session this node belongs to
    pub context_id: String,

    pub started_at: DateTime<Utc>,

    /// Set exactly once, on transition to completed or error
    pub completed_at: Option<DateTime<Utc>>,

    /// Present only in the error state
    pub error: Option<String>,
}

impl ExecutionNode {
    /// Create a fresh node. Timestamps and id are assigned here.
    pub fn new(parent_id: Option<String>, depth: u32, context_id: &str, status: NodeStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id,
            depth,
            status,
            code: String::new(),
            output: String::new(),
            delegated_prompt: None,
            delegated_response: None,
            context_id: context_id.to_string(),
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }
}

/// Overall status of one top-level execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Idle,
    Running,
    Completed,
    Error,
}

/// Everything the execution core tells the outside world
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    NodeCreated { node: ExecutionNode },
    NodeStatusChanged { node_id: String, status: NodeStatus },
    NodeOutputAppended { node_id: String, text: String },
    DelegationStarted { node_id: String, prompt: String },
    DelegationFinished { node_id: String, response: String },
    NodeErrored { node_id: String, error: String },
    ExecutionComplete { result: String },
    ExecutionError { error: String },
}

/// Aggregate view of one execution, rebuilt by folding events in order
#[derive(Debug, Clone, Default, Serialize)]
pub struct TreeState {
    /// Nodes keyed by id, with creation order preserved separately
    pub nodes: HashMap<String, ExecutionNode>,
    pub node_order: Vec<String>,
    pub status: RunStatus,
    pub final_result: Option<String>,
    pub error: Option<String>,
}

impl Default for RunStatus {
    fn default() -> Self {
        RunStatus::Idle
    }
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into the state. Total over all inputs: events that
    /// arrive after a terminal state, or that reference unknown nodes, are
    /// ignored rather than rejected, because the event stream is a durable
    /// log and consumers must be safe against replays.
    pub fn apply(&mut self, event: &ExecutionEvent) {
        match event {
            ExecutionEvent::NodeCreated { node } => {
                if self.status == RunStatus::Idle {
                    self.status = RunStatus::Running;
                }
                if !self.nodes.contains_key(&node.id) {
                    self.node_order.push(node.id.clone());
                }
                self.nodes.insert(node.id.clone(), node.clone());
            }
            ExecutionEvent::NodeStatusChanged { node_id, status } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    // Completed/error nodes are never resurrected.
                    if !node.status.is_terminal() {
                        node.status = *status;
                        if status.is_terminal() && node.completed_at.is_none() {
                            node.completed_at = Some(Utc::now());
                        }
                    }
                }
            }
            ExecutionEvent::NodeOutputAppended { node_id, text } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.output.push_str(text);
                }
            }
            ExecutionEvent::DelegationStarted { node_id, prompt } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.delegated_prompt = Some(prompt.clone());
                }
            }
            ExecutionEvent::DelegationFinished { node_id, response } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    node.delegated_response = Some(response.clone());
                }
            }
            ExecutionEvent::NodeErrored { node_id, error } => {
                if let Some(node) = self.nodes.get_mut(node_id) {
                    if !node.status.is_terminal() {
                        node.status = NodeStatus::Error;
                        node.error = Some(error.clone());
                        if node.completed_at.is_none() {
                            node.completed_at = Some(Utc::now());
                        }
                    }
                }
            }
            ExecutionEvent::ExecutionComplete { result } => {
                if self.status != RunStatus::Error {
                    self.status = RunStatus::Completed;
                    self.final_result = Some(result.clone());
                }
            }
            ExecutionEvent::ExecutionError { error } => {
                if self.status != RunStatus::Completed {
                    self.status = RunStatus::Error;
                    self.error = Some(error.clone());
                }
            }
        }
    }

    /// Fold a full event sequence from scratch.
    pub fn fold<'a>(events: impl IntoIterator<Item = &'a ExecutionEvent>) -> Self {
        let mut state = Self::new();
        for event in events {
            state.apply(event);
        }
        state
    }

    /// The unique parentless node, if created yet.
    pub fn root(&self) -> Option<&ExecutionNode> {
        self.node_order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .find(|n| n.parent_id.is_none())
    }
}

/// Consumer of execution events. The core only assumes events are accepted
/// in emission order.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ExecutionEvent);
}

/// Sink that forwards events over an unbounded channel (the streaming path).
impl EventSink for mpsc::UnboundedSender<ExecutionEvent> {
    fn emit(&self, event: ExecutionEvent) {
        // Receiver gone means the client went away; execution continues and
        // the events are dropped.
        let _ = self.send(event);
    }
}

/// Sink that discards everything.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: ExecutionEvent) {}
}

/// Sink that records events for inspection. Used by tests and the blocking
/// query endpoint.
#[derive(Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ExecutionEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ExecutionEvent> {
        self.events.lock().expect("sink lock").clone()
    }
}

impl EventSink for CollectingSink {
    fn emit(&self, event: ExecutionEvent) {
        self.events.lock().expect("sink lock").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn created(node: &ExecutionNode) -> ExecutionEvent {
        ExecutionEvent::NodeCreated { node: node.clone() }
    }

    #[test]
    fn fold_tracks_depth_invariant_and_single_root() {
        let root = ExecutionNode::new(None, 0, "ctx", NodeStatus::Executing);
        let child = ExecutionNode::new(Some(root.id.clone()), 1, "ctx", NodeStatus::LlmCalling);
        let grandchild =
            ExecutionNode::new(Some(child.id.clone()), 2, "ctx", NodeStatus::LlmCalling);

        let events = vec![created(&root), created(&child), created(&grandchild)];
        let state = TreeState::fold(&events);

        assert_eq!(state.status, RunStatus::Running);
        let parentless: Vec<_> = state
            .nodes
            .values()
            .filter(|n| n.parent_id.is_none())
            .collect();
        assert_eq!(parentless.len(), 1);

        for node in state.nodes.values() {
            if let Some(parent_id) = &node.parent_id {
                let parent = &state.nodes[parent_id];
                assert_eq!(node.depth, parent.depth + 1);
            }
        }
    }

    #[test]
    fn terminal_node_is_not_resurrected() {
        let root = ExecutionNode::new(None, 0, "ctx", NodeStatus::Executing);
        let id = root.id.clone();
        let mut state = TreeState::new();
        state.apply(&created(&root));
        state.apply(&ExecutionEvent::NodeStatusChanged {
            node_id: id.clone(),
            status: NodeStatus::Completed,
        });
        state.apply(&ExecutionEvent::NodeStatusChanged {
            node_id: id.clone(),
            status: NodeStatus::Executing,
        });

        let node = &state.nodes[&id];
        assert_eq!(node.status, NodeStatus::Completed);
        assert!(node.completed_at.is_some());
        assert!(node.completed_at.unwrap() >= node.started_at);
    }

    #[test]
    fn output_is_append_only() {
        let root = ExecutionNode::new(None, 0, "ctx", NodeStatus::Executing);
        let id = root.id.clone();
        let mut state = TreeState::new();
        state.apply(&created(&root));
        state.apply(&ExecutionEvent::NodeOutputAppended {
            node_id: id.clone(),
            text: "first\n".to_string(),
        });
        state.apply(&ExecutionEvent::NodeOutputAppended {
            node_id: id.clone(),
            text: "second\n".to_string(),
        });
        assert_eq!(state.nodes[&id].output, "first\nsecond\n");
    }

    #[test]
    fn events_after_terminal_are_ignored() {
        let mut state = TreeState::new();
        let root = ExecutionNode::new(None, 0, "ctx", NodeStatus::Executing);
        state.apply(&created(&root));
        state.apply(&ExecutionEvent::ExecutionComplete {
            result: "done".to_string(),
        });
        state.apply(&ExecutionEvent::ExecutionError {
            error: "late".to_string(),
        });

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.final_result.as_deref(), Some("done"));
    }

    #[test]
    fn unknown_node_events_are_safe() {
        let mut state = TreeState::new();
        state.apply(&ExecutionEvent::NodeOutputAppended {
            node_id: "missing".to_string(),
            text: "x".to_string(),
        });
        state.apply(&ExecutionEvent::NodeErrored {
            node_id: "missing".to_string(),
            error: "x".to_string(),
        });
        assert!(state.nodes.is_empty());
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&ExecutionEvent::ExecutionComplete {
            result: "ok".to_string(),
        })
        .unwrap();
        assert!(json.contains(r#""type":"execution_complete""#));
    }
}
