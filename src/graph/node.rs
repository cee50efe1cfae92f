use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::RecallResult;

/// Per-node lifecycle within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Pending,
    Ready,
    Running,
    Completed,
    Failed,
}

impl NodeState {
    pub fn symbol(&self) -> &'static str {
        match self {
            NodeState::Pending => "◻",
            NodeState::Ready => "◇",
            NodeState::Running => "◼",
            NodeState::Completed => "✓",
            NodeState::Failed => "✗",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.symbol())
    }
}

/// Why a node produced no value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeError {
    #[error("failed: {message}")]
    Failed { message: String },
    #[error("timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("panicked: {message}")]
    Panicked { message: String },
}

/// Result of one node: its value, or the captured failure.
pub type NodeOutcome = Result<Value, NodeError>;

/// What a node sees when it runs: the caller's initial context plus the
/// outcomes of its declared dependencies, and nothing else.
#[derive(Debug, Clone)]
pub struct NodeContext {
    node: String,
    run_id: String,
    initial: Arc<HashMap<String, Value>>,
    dependencies: BTreeMap<String, NodeOutcome>,
}

impl NodeContext {
    pub(crate) fn new(
        node: impl Into<String>,
        run_id: impl Into<String>,
        initial: Arc<HashMap<String, Value>>,
        dependencies: BTreeMap<String, NodeOutcome>,
    ) -> Self {
        Self {
            node: node.into(),
            run_id: run_id.into(),
            initial,
            dependencies,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Value from the initial context.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.initial.get(key)
    }

    /// `get` as a string slice.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn initial(&self) -> &HashMap<String, Value> {
        &self.initial
    }

    /// Outcome of a declared dependency.
    pub fn dependency(&self, name: &str) -> Option<&NodeOutcome> {
        self.dependencies.get(name)
    }

    /// Value of a dependency that succeeded.
    pub fn dependency_value(&self, name: &str) -> Option<&Value> {
        self.dependency(name).and_then(|o| o.as_ref().ok())
    }

    pub fn dependencies(&self) -> &BTreeMap<String, NodeOutcome> {
        &self.dependencies
    }
}

/// A unit of work in a [`Graph`](super::Graph).
#[async_trait]
pub trait NodeExecutor: Send + Sync {
    async fn execute(&self, ctx: NodeContext) -> RecallResult<Value>;
}

struct FnNode<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> NodeExecutor for FnNode<F>
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecallResult<Value>> + Send + 'static,
{
    async fn execute(&self, ctx: NodeContext) -> RecallResult<Value> {
        (self.f)(ctx).await
    }
}

/// Wrap an async closure as a node executor.
///
/// ```rust
/// use recall_core::graph::node_fn;
///
/// let node = node_fn(|ctx| async move {
///     Ok(serde_json::json!({ "echo": ctx.get("topic").cloned() }))
/// });
/// # let _ = node;
/// ```
pub fn node_fn<F, Fut>(f: F) -> Arc<dyn NodeExecutor>
where
    F: Fn(NodeContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = RecallResult<Value>> + Send + 'static,
{
    Arc::new(FnNode { f })
}

#[derive(Clone)]
pub(crate) struct GraphNode {
    pub(crate) dependencies: BTreeSet<String>,
    pub(crate) executor: Arc<dyn NodeExecutor>,
    pub(crate) timeout: Duration,
}
