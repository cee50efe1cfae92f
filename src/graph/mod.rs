//! Dependency-graph executor.
//!
//! Nodes declare the nodes they depend on; [`Graph::run`] executes every node
//! whose dependencies are all finished as one parallel batch, then repeats
//! until the graph is exhausted. A node failure never aborts the run: it is
//! recorded as that node's [`NodeOutcome`] and dependents still run, seeing
//! the `Err`.
//!
//! ```rust
//! use std::collections::HashMap;
//! use recall_core::graph::{node_fn, Graph};
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> recall_core::error::RecallResult<()> {
//! let mut graph = Graph::new();
//! graph.add("search", &[], node_fn(|_| async { Ok(json!(["r1", "r2"])) }))?;
//! graph.add("content", &[], node_fn(|_| async { Ok(json!("text")) }))?;
//! graph.add(
//!     "plan",
//!     &["search", "content"],
//!     node_fn(|ctx| async move {
//!         let hits = ctx.dependency_value("search").cloned();
//!         Ok(json!({ "based_on": hits }))
//!     }),
//! )?;
//!
//! let report = graph.run(HashMap::new()).await?;
//! assert_eq!(report.batches.len(), 2);
//! assert!(report.is_complete_success());
//! # Ok(())
//! # }
//! ```

pub mod node;
pub mod report;

pub use node::{node_fn, NodeContext, NodeError, NodeExecutor, NodeOutcome, NodeState};
pub use report::{RunMetrics, RunReport};

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::{RecallError, RecallResult};
use crate::events::{EventObserver, RunEvent};

use node::GraphNode;

/// Timeout applied by [`Graph::add`].
pub const DEFAULT_NODE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Building,
    Running,
    Done,
}

/// A set of named nodes whose dependencies form a DAG.
pub struct Graph {
    nodes: BTreeMap<String, GraphNode>,
    states: BTreeMap<String, NodeState>,
    run_state: RunState,
    events: Option<Arc<EventObserver>>,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::new(),
            states: BTreeMap::new(),
            run_state: RunState::Building,
            events: None,
        }
    }

    /// Send run lifecycle events to `log`.
    pub fn with_events(mut self, events: Arc<EventObserver>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn run_state(&self) -> RunState {
        self.run_state
    }

    pub fn node_state(&self, name: &str) -> Option<NodeState> {
        self.states.get(name).copied()
    }

    /// Register a node with the default 30 s timeout.
    pub fn add(
        &mut self,
        name: &str,
        dependencies: &[&str],
        executor: Arc<dyn NodeExecutor>,
    ) -> RecallResult<()> {
        self.add_node(name, dependencies, executor, DEFAULT_NODE_TIMEOUT)
    }

    /// Register a node.
    ///
    /// Rejects duplicate names and self-dependencies with
    /// [`RecallError::InvalidGraph`], and a dependency on a node that already
    /// depends on this one with [`RecallError::Cycle`]. Longer cycles are
    /// caught when the graph runs. Dependencies may name nodes added later.
    pub fn add_node(
        &mut self,
        name: &str,
        dependencies: &[&str],
        executor: Arc<dyn NodeExecutor>,
        timeout: Duration,
    ) -> RecallResult<()> {
        if self.run_state != RunState::Building {
            return Err(RecallError::InvalidGraph(format!(
                "cannot add node '{name}' after the graph has run"
            )));
        }
        if self.nodes.contains_key(name) {
            return Err(RecallError::InvalidGraph(format!(
                "duplicate node name '{name}'"
            )));
        }
        if dependencies.contains(&name) {
            return Err(RecallError::InvalidGraph(format!(
                "node '{name}' cannot depend on itself"
            )));
        }
        for dep in dependencies {
            if self
                .nodes
                .get(*dep)
                .is_some_and(|n| n.dependencies.contains(name))
            {
                return Err(RecallError::Cycle {
                    unresolved: [name.to_string(), dep.to_string()].into_iter().collect(),
                });
            }
        }

        let dependencies: BTreeSet<String> = dependencies.iter().map(|d| d.to_string()).collect();
        debug!(node = name, ?dependencies, "added graph node");
        self.nodes.insert(
            name.to_string(),
            GraphNode {
                dependencies,
                executor,
                timeout,
            },
        );
        self.states.insert(name.to_string(), NodeState::Pending);
        Ok(())
    }

    fn validate_dependencies(&self) -> RecallResult<()> {
        for (name, node) in &self.nodes {
            if let Some(missing) = node
                .dependencies
                .iter()
                .find(|d| !self.nodes.contains_key(*d))
            {
                return Err(RecallError::UnknownDependency {
                    node: name.clone(),
                    dependency: missing.clone(),
                });
            }
        }
        Ok(())
    }

    /// Kahn's algorithm; whatever cannot be ordered is on or behind a cycle.
    fn check_acyclic(&self) -> RecallResult<()> {
        let mut remaining: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(name, node)| (name.as_str(), node.dependencies.len()))
            .collect();
        let mut queue: Vec<&str> = remaining
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&name, _)| name)
            .collect();

        while let Some(done) = queue.pop() {
            remaining.remove(done);
            for (name, node) in &self.nodes {
                if node.dependencies.contains(done) {
                    if let Some(deg) = remaining.get_mut(name.as_str()) {
                        *deg -= 1;
                        if *deg == 0 {
                            queue.push(name);
                        }
                    }
                }
            }
        }

        if remaining.is_empty() {
            Ok(())
        } else {
            Err(RecallError::Cycle {
                unresolved: remaining.keys().map(|s| s.to_string()).collect(),
            })
        }
    }

    fn emit(&self, run_id: &str, event: RunEvent) {
        if let Some(events) = &self.events {
            events.emit(run_id, event);
        }
    }

    /// Execute the graph.
    ///
    /// Returns `Err` only for structural problems found before any node runs
    /// (unknown dependencies, cycles). Node failures, timeouts and panics are
    /// captured in the report.
    pub async fn run(&mut self, initial: HashMap<String, Value>) -> RecallResult<RunReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();

        self.validate_dependencies()?;
        self.check_acyclic()?;

        for state in self.states.values_mut() {
            *state = NodeState::Pending;
        }
        self.run_state = RunState::Running;

        if self.nodes.is_empty() {
            warn!("running an empty graph");
        }
        info!(run_id = %run_id, nodes = self.nodes.len(), "graph run started");
        self.emit(
            &run_id,
            RunEvent::RunStarted {
                nodes: self.nodes.len(),
            },
        );

        let initial = Arc::new(initial);
        let mut outcomes: BTreeMap<String, NodeOutcome> = BTreeMap::new();
        let mut batches: Vec<Vec<String>> = Vec::new();

        while outcomes.len() < self.nodes.len() {
            let ready: Vec<String> = self
                .nodes
                .iter()
                .filter(|(name, node)| {
                    !outcomes.contains_key(*name)
                        && node.dependencies.iter().all(|d| outcomes.contains_key(d))
                })
                .map(|(name, _)| name.clone())
                .collect();

            if ready.is_empty() {
                let unresolved: BTreeSet<String> = self
                    .nodes
                    .keys()
                    .filter(|n| !outcomes.contains_key(*n))
                    .cloned()
                    .collect();
                self.run_state = RunState::Done;
                return Err(RecallError::Cycle { unresolved });
            }

            debug!(run_id = %run_id, batch = ?ready, "executing batch");
            self.emit(
                &run_id,
                RunEvent::BatchStarted {
                    index: batches.len(),
                    nodes: ready.clone(),
                },
            );

            let mut tasks = JoinSet::new();
            let mut names = HashMap::new();
            for name in &ready {
                let Some(node) = self.nodes.get(name) else {
                    continue;
                };
                let dependencies = node
                    .dependencies
                    .iter()
                    .filter_map(|d| outcomes.get(d).map(|o| (d.clone(), o.clone())))
                    .collect();
                let ctx = NodeContext::new(name.clone(), run_id.clone(), initial.clone(), dependencies);
                let executor = node.executor.clone();
                let timeout = node.timeout;

                self.states.insert(name.clone(), NodeState::Ready);
                let handle = tasks.spawn(async move {
                    let started = Instant::now();
                    let outcome = match tokio::time::timeout(timeout, executor.execute(ctx)).await {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(e)) => Err(NodeError::Failed {
                            message: e.to_string(),
                        }),
                        Err(_) => Err(NodeError::Timeout {
                            timeout_ms: timeout.as_millis() as u64,
                        }),
                    };
                    (outcome, started.elapsed())
                });
                names.insert(handle.id(), name.clone());
                self.states.insert(name.clone(), NodeState::Running);
                self.emit(&run_id, RunEvent::NodeStarted { node: name.clone() });
            }

            while let Some(joined) = tasks.join_next_with_id().await {
                let (id, outcome, elapsed) = match joined {
                    Ok((id, (outcome, elapsed))) => (id, outcome, elapsed),
                    Err(e) => {
                        let id = e.id();
                        let message = if e.is_panic() {
                            panic_message(e.into_panic())
                        } else {
                            "task cancelled".to_string()
                        };
                        (id, Err(NodeError::Panicked { message }), Duration::ZERO)
                    }
                };
                let Some(name) = names.remove(&id) else {
                    continue;
                };

                let elapsed_ms = elapsed.as_millis() as u64;
                match &outcome {
                    Ok(_) => {
                        debug!(run_id = %run_id, node = %name, elapsed_ms, "node completed");
                        self.states.insert(name.clone(), NodeState::Completed);
                        self.emit(
                            &run_id,
                            RunEvent::NodeCompleted {
                                node: name.clone(),
                                elapsed_ms,
                            },
                        );
                    }
                    Err(e) => {
                        error!(run_id = %run_id, node = %name, error = %e, "node failed");
                        self.states.insert(name.clone(), NodeState::Failed);
                        self.emit(
                            &run_id,
                            RunEvent::NodeFailed {
                                node: name.clone(),
                                error: e.clone(),
                            },
                        );
                    }
                }
                outcomes.insert(name, outcome);
            }

            batches.push(ready);
        }

        let report = RunReport {
            run_id,
            outcomes,
            batches,
            elapsed: start.elapsed(),
        };
        self.run_state = RunState::Done;

        let metrics = report.metrics();
        if metrics.failed > 0 {
            warn!(
                run_id = %report.run_id,
                failed = metrics.failed,
                nodes = ?report.errors().keys().collect::<Vec<_>>(),
                "graph run finished with failures"
            );
        }
        info!(
            run_id = %report.run_id,
            elapsed_ms = report.elapsed.as_millis() as u64,
            batches = report.batches.len(),
            "graph run finished"
        );
        self.emit(
            &report.run_id,
            RunEvent::RunFinished {
                metrics,
                elapsed_ms: report.elapsed.as_millis() as u64,
            },
        );

        Ok(report)
    }

    /// Text listing of every node and its dependencies.
    pub fn render(&self) -> String {
        let mut lines = vec!["Node Execution Graph:".to_string(), "=".repeat(40)];
        for (name, node) in &self.nodes {
            if node.dependencies.is_empty() {
                lines.push(format!("{name} (no dependencies)"));
            } else {
                let deps: Vec<&str> = node.dependencies.iter().map(String::as_str).collect();
                lines.push(format!("{name} <- [{}]", deps.join(", ")));
            }
        }
        lines.join("\n")
    }
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
