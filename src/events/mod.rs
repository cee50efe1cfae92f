//! Graph run lifecycle events.
//!
//! [`Graph::run`](crate::graph::Graph::run) reports progress as typed
//! [`RunEvent`]s stamped with the run id and a wall-clock time. Observers
//! register on an [`EventObserver`]; [`EventRecorder`] keeps everything for
//! later inspection and [`ChannelObserver`] streams events to another task.
//!
//! These are data for callers (progress views, audit trails). Operational
//! diagnostics go through `tracing`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::graph::{NodeError, RunMetrics};

/// One step in the life of a graph run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted {
        nodes: usize,
    },
    BatchStarted {
        index: usize,
        nodes: Vec<String>,
    },
    NodeStarted {
        node: String,
    },
    NodeCompleted {
        node: String,
        elapsed_ms: u64,
    },
    NodeFailed {
        node: String,
        error: NodeError,
    },
    RunFinished {
        metrics: RunMetrics,
        elapsed_ms: u64,
    },
}

impl RunEvent {
    /// Snake-case tag, as serialized.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::BatchStarted { .. } => "batch_started",
            RunEvent::NodeStarted { .. } => "node_started",
            RunEvent::NodeCompleted { .. } => "node_completed",
            RunEvent::NodeFailed { .. } => "node_failed",
            RunEvent::RunFinished { .. } => "run_finished",
        }
    }

    /// Node the event is about, if any.
    pub fn node(&self) -> Option<&str> {
        match self {
            RunEvent::NodeStarted { node }
            | RunEvent::NodeCompleted { node, .. }
            | RunEvent::NodeFailed { node, .. } => Some(node),
            _ => None,
        }
    }
}

/// A [`RunEvent`] with its run and time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub run_id: String,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: RunEvent,
}

pub trait RunObserver: Send + Sync {
    fn observe(&self, record: &RunEventRecord);
}

/// Stamps events and hands them to every registered observer.
#[derive(Default)]
pub struct EventObserver {
    observers: Vec<Arc<dyn RunObserver>>,
}

impl EventObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_observer(mut self, observer: Arc<dyn RunObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn observer_count(&self) -> usize {
        self.observers.len()
    }

    pub fn emit(&self, run_id: &str, event: RunEvent) {
        if self.observers.is_empty() {
            return;
        }
        let record = RunEventRecord {
            run_id: run_id.to_string(),
            at: Utc::now(),
            event,
        };
        for observer in &self.observers {
            observer.observe(&record);
        }
    }
}

/// Keeps every record in arrival order.
#[derive(Default)]
pub struct EventRecorder {
    records: Mutex<Vec<RunEventRecord>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<RunEventRecord> {
        self.records.lock().clone()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.records.lock().iter().map(|r| r.event.name()).collect()
    }

    /// Failed nodes with their errors, in the order they finished.
    pub fn failures(&self) -> Vec<(String, NodeError)> {
        self.records
            .lock()
            .iter()
            .filter_map(|r| match &r.event {
                RunEvent::NodeFailed { node, error } => Some((node.clone(), error.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl RunObserver for EventRecorder {
    fn observe(&self, record: &RunEventRecord) {
        self.records.lock().push(record.clone());
    }
}

/// Forwards records over an unbounded channel. A dropped receiver is ignored.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<RunEventRecord>,
}

impl ChannelObserver {
    pub fn new(tx: mpsc::UnboundedSender<RunEventRecord>) -> Self {
        Self { tx }
    }

    /// Observer plus the receiving end.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<RunEventRecord>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RunObserver for ChannelObserver {
    fn observe(&self, record: &RunEventRecord) {
        let _ = self.tx.send(record.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics() -> RunMetrics {
        RunMetrics {
            total_nodes: 2,
            successful: 1,
            failed: 1,
            success_rate: 0.5,
        }
    }

    #[test]
    fn serializes_with_event_tag() {
        let record = RunEventRecord {
            run_id: "r-1".into(),
            at: Utc::now(),
            event: RunEvent::NodeFailed {
                node: "quiz".into(),
                error: NodeError::Timeout { timeout_ms: 500 },
            },
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["event"], "node_failed");
        assert_eq!(json["node"], "quiz");
        assert_eq!(json["error"]["kind"], "timeout");
        assert_eq!(json["run_id"], "r-1");

        let back: RunEventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn name_matches_serialized_tag() {
        let events = [
            RunEvent::RunStarted { nodes: 1 },
            RunEvent::BatchStarted {
                index: 0,
                nodes: vec!["a".into()],
            },
            RunEvent::NodeCompleted {
                node: "a".into(),
                elapsed_ms: 3,
            },
            RunEvent::RunFinished {
                metrics: metrics(),
                elapsed_ms: 9,
            },
        ];
        for event in events {
            let json = serde_json::to_value(&event).unwrap();
            assert_eq!(json["event"], event.name());
        }
    }

    #[test]
    fn node_accessor() {
        assert_eq!(RunEvent::NodeStarted { node: "x".into() }.node(), Some("x"));
        assert_eq!(RunEvent::RunStarted { nodes: 0 }.node(), None);
    }

    #[test]
    fn recorder_collects_failures() {
        let recorder = Arc::new(EventRecorder::new());
        let events = EventObserver::new().with_observer(recorder.clone());
        events.emit("r", RunEvent::NodeStarted { node: "a".into() });
        events.emit(
            "r",
            RunEvent::NodeFailed {
                node: "a".into(),
                error: NodeError::Failed {
                    message: "boom".into(),
                },
            },
        );

        assert_eq!(recorder.names(), vec!["node_started", "node_failed"]);
        let failures = recorder.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "a");
        assert!(recorder.records().iter().all(|r| r.run_id == "r"));
    }

    #[tokio::test]
    async fn channel_observer_streams_records() {
        let (observer, mut rx) = ChannelObserver::channel();
        let events = EventObserver::new().with_observer(Arc::new(observer));
        assert_eq!(events.observer_count(), 1);

        events.emit("r-2", RunEvent::RunStarted { nodes: 4 });
        let record = rx.recv().await.unwrap();
        assert_eq!(record.event, RunEvent::RunStarted { nodes: 4 });

        drop(rx);
        events.emit("r-2", RunEvent::RunStarted { nodes: 4 });
    }
}
