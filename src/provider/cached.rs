use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::cache::EmbeddingCache;
use crate::error::{RecallError, RecallResult};
use crate::ratelimit::{RateLimiter, EMBEDDINGS, LLM};

use super::traits::{CompletionProvider, EmbeddingProvider};

/// Embedding provider decorator: cache lookups first, rate-limited calls for
/// the misses.
///
/// Each call that reaches the inner provider spends one token of the
/// `"embeddings"` resource, waiting for refill if necessary.
pub struct CachedEmbedder {
    inner: Arc<dyn EmbeddingProvider>,
    cache: Arc<EmbeddingCache>,
    limiter: Option<Arc<RateLimiter>>,
    caller: Option<String>,
}

impl CachedEmbedder {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, cache: Arc<EmbeddingCache>) -> Self {
        Self {
            inner,
            cache,
            limiter: None,
            caller: None,
        }
    }

    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Charge per-caller buckets in addition to the global one.
    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    async fn throttle(&self) -> RecallResult<()> {
        match &self.limiter {
            Some(limiter) => {
                limiter
                    .require(EMBEDDINGS, self.caller.as_deref(), 1, true)
                    .await
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl EmbeddingProvider for CachedEmbedder {
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
        if let Some(vector) = self.cache.get(text) {
            return Ok(vector);
        }
        self.throttle().await?;
        let vector = self.inner.embed(text).await?;
        self.cache.set(text, vector.clone());
        Ok(vector)
    }

    async fn embed_batch(&self, texts: &[String]) -> RecallResult<Vec<Vec<f32>>> {
        let mut out: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.cache.get(t)).collect();
        let missing: Vec<usize> = out
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_none())
            .map(|(i, _)| i)
            .collect();

        if !missing.is_empty() {
            debug!(
                hits = texts.len() - missing.len(),
                misses = missing.len(),
                "embedding batch cache lookup"
            );
            let pending: Vec<String> = missing.iter().map(|&i| texts[i].clone()).collect();
            self.throttle().await?;
            let fresh = self.inner.embed_batch(&pending).await?;
            if fresh.len() != pending.len() {
                return Err(RecallError::Provider(format!(
                    "provider returned {} vectors for {} texts",
                    fresh.len(),
                    pending.len()
                )));
            }
            for (&i, vector) in missing.iter().zip(fresh) {
                self.cache.set(&texts[i], vector.clone());
                out[i] = Some(vector);
            }
        }

        out.into_iter()
            .map(|v| v.ok_or_else(|| RecallError::Provider("missing embedding".into())))
            .collect()
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

/// Completion provider decorator that spends one `"llm"` token per call.
pub struct LimitedCompletion {
    inner: Arc<dyn CompletionProvider>,
    limiter: Arc<RateLimiter>,
    caller: Option<String>,
    blocking: bool,
}

impl LimitedCompletion {
    pub fn new(inner: Arc<dyn CompletionProvider>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            inner,
            limiter,
            caller: None,
            blocking: true,
        }
    }

    pub fn with_caller(mut self, caller: impl Into<String>) -> Self {
        self.caller = Some(caller.into());
        self
    }

    /// Fail immediately instead of waiting for refill.
    pub fn non_blocking(mut self) -> Self {
        self.blocking = false;
        self
    }
}

#[async_trait]
impl CompletionProvider for LimitedCompletion {
    async fn complete(&self, prompt: &str) -> RecallResult<String> {
        self.limiter
            .require(LLM, self.caller.as_deref(), 1, self.blocking)
            .await?;
        self.inner.complete(prompt).await
    }

    fn model_name(&self) -> &str {
        self.inner.model_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::BucketConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingEmbedder {
        calls: AtomicUsize,
        texts: AtomicUsize,
    }

    impl CountingEmbedder {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                texts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32, 1.0])
        }

        async fn embed_batch(&self, texts: &[String]) -> RecallResult<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.texts.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn model_name(&self) -> &str {
            "counting"
        }
    }

    struct Echo;

    #[async_trait]
    impl CompletionProvider for Echo {
        async fn complete(&self, prompt: &str) -> RecallResult<String> {
            Ok(prompt.to_uppercase())
        }

        fn model_name(&self) -> &str {
            "echo"
        }
    }

    fn cache() -> Arc<EmbeddingCache> {
        Arc::new(EmbeddingCache::new(100, Duration::from_secs(60)))
    }

    #[tokio::test]
    async fn second_embed_is_served_from_cache() {
        let inner = Arc::new(CountingEmbedder::new());
        let embedder = CachedEmbedder::new(inner.clone(), cache());

        let first = embedder.embed("hello").await.unwrap();
        let second = embedder.embed("hello").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.cache().stats().hits, 1);
        assert_eq!(embedder.model_name(), "counting");
    }

    #[tokio::test]
    async fn batch_only_sends_misses() {
        let inner = Arc::new(CountingEmbedder::new());
        let embedder = CachedEmbedder::new(inner.clone(), cache());
        embedder.embed("bb").await.unwrap();

        let texts = vec!["a".to_string(), "bb".to_string(), "ccc".to_string()];
        let vectors = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(vectors[0][0], 1.0);
        assert_eq!(vectors[1][0], 2.0);
        assert_eq!(vectors[2][0], 3.0);
        // One single call plus one batch call carrying two texts.
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(inner.texts.load(Ordering::SeqCst), 3);

        embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(inner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_limiter_surfaces_rate_limit_error() {
        let mut limiter = RateLimiter::new();
        limiter.add_global_bucket(EMBEDDINGS, BucketConfig::new(1, 0.0));
        let inner = Arc::new(CountingEmbedder::new());
        let embedder = CachedEmbedder::new(inner.clone(), cache())
            .with_limiter(Arc::new(limiter))
            .with_caller("u1");

        embedder.embed("one").await.unwrap();
        // Cache hits never spend tokens.
        embedder.embed("one").await.unwrap();
        let err = embedder.embed("two").await.unwrap_err();
        assert!(matches!(err, RecallError::RateLimitExceeded { .. }));
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn limited_completion_spends_llm_tokens() {
        let mut limiter = RateLimiter::new();
        limiter.add_global_bucket(LLM, BucketConfig::new(1, 1.0));
        let limiter = Arc::new(limiter);
        let llm = LimitedCompletion::new(Arc::new(Echo), limiter.clone()).non_blocking();

        assert_eq!(llm.complete("hi").await.unwrap(), "HI");
        assert!(llm.complete("again").await.is_err());
        assert_eq!(limiter.all_stats().global[LLM].tokens, 0.0);
    }
}
