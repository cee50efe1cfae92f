//! Configuration.
//!
//! Every section has defaults, so an empty YAML document is a valid config.
//!
//! ```yaml
//! store:
//!   root_dir: /var/lib/recall
//!   batch_size: 50
//! cache:
//!   max_size: 10000
//!   ttl_secs: 3600
//! limits:
//!   global:
//!     embeddings: { capacity: 500, refill_rate: 50.0 }
//!   callers:
//!     api: { capacity: 100, refill_rate: 10.0 }
//! embedding:
//!   model: text-embedding-3-small
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{RecallError, RecallResult};
use crate::ingest::{DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE};
use crate::provider::FALLBACK_EMBEDDING_MODEL;
use crate::ratelimit::{BucketConfig, RateLimiter, API, EMBEDDINGS, LLM};
use crate::store::StoreConfig;

/// Overrides `store.root_dir`.
pub const ENV_STORE_DIR: &str = "VECTOR_STORE_DIR";
/// Overrides `embedding.model`.
pub const ENV_EMBEDDING_MODEL: &str = "RECALL_EMBEDDING_MODEL";
/// Overrides `embedding.base_url`.
pub const ENV_EMBEDDING_BASE_URL: &str = "RECALL_EMBEDDING_BASE_URL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_size: usize,
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            ttl_secs: 3600,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Global bucket per resource.
    pub global: BTreeMap<String, BucketConfig>,
    /// Per-caller bucket policy per resource.
    pub callers: BTreeMap<String, BucketConfig>,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let mut global = BTreeMap::new();
        global.insert(API.to_string(), BucketConfig::new(1000, 100.0));
        global.insert(EMBEDDINGS.to_string(), BucketConfig::new(500, 50.0));
        global.insert(LLM.to_string(), BucketConfig::new(200, 20.0));
        Self {
            global,
            callers: BTreeMap::new(),
        }
    }
}

impl LimitsConfig {
    pub fn build_limiter(&self) -> RateLimiter {
        let mut limiter = RateLimiter::new();
        for (resource, config) in &self.global {
            limiter.add_global_bucket(resource.clone(), *config);
        }
        for (resource, policy) in &self.callers {
            limiter.add_caller_policy(resource.clone(), *policy);
        }
        limiter
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub model: String,
    pub fallback_model: Option<String>,
    /// Environment variable holding the API key.
    pub api_key_env: String,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com".into(),
            model: "text-embedding-3-small".into(),
            fallback_model: Some(FALLBACK_EMBEDDING_MODEL.into()),
            api_key_env: "OPENAI_API_KEY".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub limits: LimitsConfig,
    pub embedding: EmbeddingConfig,
    pub ingest: IngestConfig,
}

impl RecallConfig {
    pub fn from_yaml_str(yaml: &str) -> RecallResult<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub async fn from_file(path: impl AsRef<Path>) -> RecallResult<Self> {
        let text = tokio::fs::read_to_string(path.as_ref()).await?;
        debug!(path = %path.as_ref().display(), "loaded config file");
        Self::from_yaml_str(&text)
    }

    /// Read overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from any key lookup. Blank values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = get(ENV_STORE_DIR) {
            self.store.root_dir = dir.into();
        }
        if let Some(model) = get(ENV_EMBEDDING_MODEL) {
            self.embedding.model = model;
        }
        if let Some(url) = get(ENV_EMBEDDING_BASE_URL) {
            self.embedding.base_url = url;
        }
    }

    pub fn validate(&self) -> RecallResult<()> {
        if self.store.batch_size == 0 {
            return Err(RecallError::Config("store.batch_size must be positive".into()));
        }
        if self.cache.max_size == 0 {
            return Err(RecallError::Config("cache.max_size must be positive".into()));
        }
        if self.ingest.chunk_size == 0 {
            return Err(RecallError::Config("ingest.chunk_size must be positive".into()));
        }
        if self.ingest.chunk_overlap >= self.ingest.chunk_size {
            return Err(RecallError::Config(
                "ingest.chunk_overlap must be smaller than chunk_size".into(),
            ));
        }
        let buckets = self
            .limits
            .global
            .iter()
            .map(|(r, c)| (format!("limits.global.{r}"), c))
            .chain(
                self.limits
                    .callers
                    .iter()
                    .map(|(r, c)| (format!("limits.callers.{r}"), c)),
            );
        for (path, bucket) in buckets {
            if bucket.capacity == 0 {
                return Err(RecallError::Config(format!("{path}: capacity must be positive")));
            }
            if bucket.refill_rate <= 0.0 || !bucket.refill_rate.is_finite() {
                return Err(RecallError::Config(format!(
                    "{path}: refill_rate must be a positive number"
                )));
            }
        }
        Ok(())
    }
}
