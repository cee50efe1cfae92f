use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::node::{NodeError, NodeOutcome};
use crate::error::{RecallError, RecallResult};

/// Aggregate counts for a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_nodes: usize,
    pub successful: usize,
    pub failed: usize,
    pub success_rate: f64,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcomes: BTreeMap<String, NodeOutcome>,
    /// Node names per batch, in execution order.
    pub batches: Vec<Vec<String>>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn outcome(&self, node: &str) -> Option<&NodeOutcome> {
        self.outcomes.get(node)
    }

    /// Value of a node that succeeded.
    pub fn result(&self, node: &str) -> Option<&Value> {
        self.outcome(node).and_then(|o| o.as_ref().ok())
    }

    /// Every node's value, `None` for failures.
    pub fn results(&self) -> BTreeMap<&str, Option<&Value>> {
        self.outcomes
            .iter()
            .map(|(name, o)| (name.as_str(), o.as_ref().ok()))
            .collect()
    }

    pub fn errors(&self) -> BTreeMap<&str, &NodeError> {
        self.outcomes
            .iter()
            .filter_map(|(name, o)| o.as_ref().err().map(|e| (name.as_str(), e)))
            .collect()
    }

    /// Value of a node, or its failure as a [`RecallError`].
    pub fn require(&self, node: &str) -> RecallResult<&Value> {
        match self.outcome(node) {
            Some(Ok(value)) => Ok(value),
            Some(Err(NodeError::Timeout { timeout_ms })) => Err(RecallError::NodeTimeout {
                node: node.to_string(),
                timeout_ms: *timeout_ms,
            }),
            Some(Err(e)) => Err(RecallError::Other(anyhow::anyhow!("node '{node}' {e}"))),
            None => Err(RecallError::InvalidGraph(format!("no node named '{node}'"))),
        }
    }

    pub fn is_complete_success(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    pub fn metrics(&self) -> RunMetrics {
        let total_nodes = self.outcomes.len();
        let successful = self.outcomes.values().filter(|o| o.is_ok()).count();
        let failed = total_nodes - successful;
        let success_rate = if total_nodes == 0 {
            0.0
        } else {
            successful as f64 / total_nodes as f64
        };
        RunMetrics {
            total_nodes,
            successful,
            failed,
            success_rate,
        }
    }
}
