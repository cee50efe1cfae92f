use std::collections::BTreeSet;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecallError {
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Provider rate limited: {provider}, retry after {retry_after_ms}ms")]
    RateLimited {
        provider: String,
        retry_after_ms: u64,
    },

    #[error("Corrupt index for namespace '{namespace}': {reason}")]
    CorruptIndex { namespace: String, reason: String },

    #[error("Dependency cycle detected, unresolved nodes: {}", join_names(.unresolved))]
    Cycle { unresolved: BTreeSet<String> },

    #[error("Rate limit exceeded: resource={resource}{}", caller_suffix(.caller))]
    RateLimitExceeded {
        resource: String,
        caller: Option<String>,
    },

    #[error("Node '{node}' timed out after {timeout_ms}ms")]
    NodeTimeout { node: String, timeout_ms: u64 },

    #[error("Invalid graph: {0}")]
    InvalidGraph(String),

    #[error("Node '{node}' depends on unknown node '{dependency}'")]
    UnknownDependency { node: String, dependency: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("Config error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

pub type RecallResult<T> = Result<T, RecallError>;

fn join_names(names: &BTreeSet<String>) -> String {
    names.iter().cloned().collect::<Vec<_>>().join(", ")
}

fn caller_suffix(caller: &Option<String>) -> String {
    caller
        .as_deref()
        .map(|c| format!(", caller={c}"))
        .unwrap_or_default()
}
