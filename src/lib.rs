//! # recall-core
//!
//! Async retrieval and orchestration core: per-namespace semantic vector
//! collections, a memoizing embedding cache, token-bucket rate limiting for
//! external calls, and a dependency-graph executor that runs independent
//! work units in parallel batches.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use recall_core::config::RecallConfig;
//! use recall_core::engine::Engine;
//! use recall_core::store::{MetadataFilter, NewDocument, SearchOptions};
//!
//! # async fn run() -> recall_core::error::RecallResult<()> {
//! let mut config = RecallConfig::default();
//! config.apply_env_overrides();
//! let engine = Engine::from_config(config)?;
//!
//! engine
//!     .store()
//!     .add(
//!         "calculus",
//!         vec![NewDocument::new("The derivative measures change.").with_meta("formula", "F1")],
//!     )
//!     .await?;
//!
//! let hits = engine
//!     .store()
//!     .search(
//!         "calculus",
//!         "what is a derivative?",
//!         SearchOptions::new(3).with_filters(MetadataFilter::new().equals("formula", "F1")),
//!     )
//!     .await?;
//! # let _ = hits;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`store`] | Namespaced vector store: lazy load, atomic persistence, metadata-filtered search |
//! | [`index`] | Exact flat L2 index with a binary codec |
//! | [`cache`] | LRU + TTL cache of embedding vectors keyed by SHA-256 |
//! | [`ratelimit`] | Token buckets and the multi-tier `RateLimiter` |
//! | [`graph`] | Dependency-graph executor: parallel batches, per-node timeouts, cycle detection |
//! | [`provider`] | Embedding / completion traits, OpenAI-compatible HTTP providers, cached and limited decorators |
//! | [`ingest`] | Overlapping text chunking and ingestion into a namespace |
//! | [`events`] | Typed graph run lifecycle events and observers |
//! | [`engine`] | Wires config, cache, limiter and store together |
//! | [`config`] | YAML configuration with environment overrides |
//! | [`telemetry`] | `tracing` subscriber setup |
//! | [`error`] | Error types with thiserror: Provider, RateLimited, CorruptIndex, Cycle, etc. |

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod provider;
pub mod ratelimit;
pub mod store;
pub mod telemetry;

pub use error::{RecallError, RecallResult};
