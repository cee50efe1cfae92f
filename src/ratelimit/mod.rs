//! Token-bucket rate limiting for external resources.
//!
//! A [`RateLimiter`] holds at most one global bucket per resource type
//! (`"embeddings"`, `"llm"`, ...) and, for resources with a caller policy,
//! one bucket per caller created on first use. The global bucket is always
//! consulted first so an exhausted resource fails fast.
//!
//! ```rust
//! use recall_core::ratelimit::{BucketConfig, RateLimiter};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let mut limiter = RateLimiter::new();
//! limiter.add_global_bucket("llm", BucketConfig::new(2, 1.0));
//!
//! assert!(limiter.check("llm", None, 1, false).await);
//! assert!(limiter.check("llm", None, 1, false).await);
//! assert!(!limiter.check("llm", None, 1, false).await);
//! # }
//! ```

pub mod bucket;

pub use bucket::{BucketConfig, BucketStats, TokenBucket};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{RecallError, RecallResult};

/// Resource name used for embedding calls.
pub const EMBEDDINGS: &str = "embeddings";
/// Resource name used for completion calls.
pub const LLM: &str = "llm";
/// Resource name used for caller-facing API requests.
pub const API: &str = "api";

/// Serializable snapshot of every bucket in a limiter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimiterStats {
    pub global: BTreeMap<String, BucketStats>,
    pub callers: BTreeMap<String, BTreeMap<String, BucketStats>>,
}

struct CallerBuckets {
    policy: BucketConfig,
    buckets: HashMap<String, Arc<TokenBucket>>,
}

/// Multi-tier limiter: global buckets per resource plus optional per-caller buckets.
#[derive(Default)]
pub struct RateLimiter {
    global: HashMap<String, Arc<TokenBucket>>,
    callers: RwLock<HashMap<String, CallerBuckets>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Limiter preloaded with the standard global buckets:
    /// `api` 1000 @ 100/s, `embeddings` 500 @ 50/s, `llm` 200 @ 20/s.
    pub fn with_defaults() -> Self {
        let mut limiter = Self::new();
        limiter.add_global_bucket(API, BucketConfig::new(1000, 100.0));
        limiter.add_global_bucket(EMBEDDINGS, BucketConfig::new(500, 50.0));
        limiter.add_global_bucket(LLM, BucketConfig::new(200, 20.0));
        limiter
    }

    /// Install (or replace) the global bucket for a resource.
    pub fn add_global_bucket(&mut self, resource: impl Into<String>, config: BucketConfig) {
        let resource = resource.into();
        info!(
            resource = %resource,
            capacity = config.capacity,
            refill_rate = config.refill_rate,
            "added global rate-limit bucket"
        );
        self.global
            .insert(resource, Arc::new(TokenBucket::from_config(config)));
    }

    /// Enable per-caller limits for a resource. Callers without an explicit
    /// bucket get one built from `policy` on first use.
    pub fn add_caller_policy(&self, resource: impl Into<String>, policy: BucketConfig) {
        let mut callers = self.callers.write();
        callers
            .entry(resource.into())
            .and_modify(|c| c.policy = policy)
            .or_insert_with(|| CallerBuckets {
                policy,
                buckets: HashMap::new(),
            });
    }

    /// Install an explicit bucket for one caller, enabling per-caller limits
    /// for the resource with the default policy if none is set.
    pub fn add_caller_bucket(
        &self,
        resource: impl Into<String>,
        caller: impl Into<String>,
        config: BucketConfig,
    ) {
        let mut callers = self.callers.write();
        let entry = callers
            .entry(resource.into())
            .or_insert_with(|| CallerBuckets {
                policy: BucketConfig::default(),
                buckets: HashMap::new(),
            });
        entry
            .buckets
            .insert(caller.into(), Arc::new(TokenBucket::from_config(config)));
    }

    pub fn global_bucket(&self, resource: &str) -> Option<Arc<TokenBucket>> {
        self.global.get(resource).cloned()
    }

    /// Existing or freshly created caller bucket; `None` when the resource has
    /// no caller policy.
    fn caller_bucket(&self, resource: &str, caller: &str) -> Option<Arc<TokenBucket>> {
        if let Some(bucket) = self
            .callers
            .read()
            .get(resource)
            .and_then(|c| c.buckets.get(caller).cloned())
        {
            return Some(bucket);
        }

        let mut callers = self.callers.write();
        let entry = callers.get_mut(resource)?;
        let policy = entry.policy;
        let bucket = entry
            .buckets
            .entry(caller.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::from_config(policy)));
        Some(bucket.clone())
    }

    /// Check the global bucket, then the caller bucket.
    ///
    /// Resources with no configured buckets always pass. Tokens taken from
    /// the global bucket are not refunded when the caller bucket rejects.
    pub async fn check(
        &self,
        resource: &str,
        caller: Option<&str>,
        tokens: u32,
        blocking: bool,
    ) -> bool {
        if let Some(global) = self.global.get(resource) {
            if !global.acquire(tokens, blocking).await {
                warn!(resource, "global rate limit exceeded");
                return false;
            }
        }

        if let Some(caller) = caller {
            if let Some(bucket) = self.caller_bucket(resource, caller) {
                if !bucket.acquire(tokens, blocking).await {
                    warn!(resource, caller, "caller rate limit exceeded");
                    return false;
                }
            }
        }

        true
    }

    /// Like [`check`](Self::check) but reports rejection as an error.
    pub async fn require(
        &self,
        resource: &str,
        caller: Option<&str>,
        tokens: u32,
        blocking: bool,
    ) -> RecallResult<()> {
        if self.check(resource, caller, tokens, blocking).await {
            Ok(())
        } else {
            Err(RecallError::RateLimitExceeded {
                resource: resource.to_string(),
                caller: caller.map(str::to_string),
            })
        }
    }

    pub fn all_stats(&self) -> LimiterStats {
        let global = self
            .global
            .iter()
            .map(|(name, bucket)| (name.clone(), bucket.stats()))
            .collect();
        let callers = self
            .callers
            .read()
            .iter()
            .map(|(resource, c)| {
                let per_caller = c
                    .buckets
                    .iter()
                    .map(|(caller, bucket)| (caller.clone(), bucket.stats()))
                    .collect();
                (resource.clone(), per_caller)
            })
            .collect();
        LimiterStats { global, callers }
    }
}
