//! One handle over the cache, limiter, store and run observers.

use std::sync::Arc;

use tracing::info;

use crate::cache::EmbeddingCache;
use crate::config::RecallConfig;
use crate::error::{RecallError, RecallResult};
use crate::events::EventObserver;
use crate::graph::Graph;
use crate::ingest::Ingestor;
use crate::provider::{
    CachedEmbedder, CompletionProvider, EmbeddingProvider, LimitedCompletion,
    OpenAiEmbeddingProvider,
};
use crate::ratelimit::RateLimiter;
use crate::store::VectorStore;

/// Shared services built from a [`RecallConfig`].
///
/// The store embeds through the cache and the `"embeddings"` limiter, so
/// repeated passages and queries reach the provider once.
pub struct Engine {
    config: RecallConfig,
    cache: Arc<EmbeddingCache>,
    limiter: Arc<RateLimiter>,
    store: Arc<VectorStore>,
    events: Arc<EventObserver>,
}

impl Engine {
    /// Build with an explicit embedding provider.
    pub fn new(config: RecallConfig, provider: Arc<dyn EmbeddingProvider>) -> RecallResult<Self> {
        config.validate()?;

        let cache = Arc::new(EmbeddingCache::new(
            config.cache.max_size,
            config.cache.ttl(),
        ));
        let limiter = Arc::new(config.limits.build_limiter());
        let embedder: Arc<dyn EmbeddingProvider> = Arc::new(
            CachedEmbedder::new(provider, cache.clone()).with_limiter(limiter.clone()),
        );
        let store = Arc::new(VectorStore::new(config.store.clone(), embedder));

        info!(
            root_dir = %config.store.root_dir.display(),
            cache_size = config.cache.max_size,
            "engine initialized"
        );
        Ok(Self {
            config,
            cache,
            limiter,
            store,
            events: Arc::new(EventObserver::new()),
        })
    }

    /// Build with the OpenAI-compatible provider described by `config.embedding`.
    /// The API key is read from the configured environment variable.
    pub fn from_config(config: RecallConfig) -> RecallResult<Self> {
        let key_var = &config.embedding.api_key_env;
        let api_key = std::env::var(key_var)
            .map_err(|_| RecallError::Config(format!("{key_var} is not set")))?;
        let provider = OpenAiEmbeddingProvider::new(api_key)
            .with_base_url(config.embedding.base_url.clone())
            .with_model(config.embedding.model.clone())
            .with_fallback_model(config.embedding.fallback_model.clone());
        Self::new(config, Arc::new(provider))
    }

    pub fn with_events(mut self, events: Arc<EventObserver>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn store(&self) -> &Arc<VectorStore> {
        &self.store
    }

    pub fn events(&self) -> &Arc<EventObserver> {
        &self.events
    }

    pub fn ingestor(&self) -> Ingestor {
        Ingestor::new(self.store.clone())
            .with_chunking(self.config.ingest.chunk_size, self.config.ingest.chunk_overlap)
    }

    /// Empty graph reporting to this engine's run observers.
    pub fn graph(&self) -> Graph {
        Graph::new().with_events(self.events.clone())
    }

    /// Wrap a completion provider so each call spends an `"llm"` token.
    pub fn completion(&self, inner: Arc<dyn CompletionProvider>) -> LimitedCompletion {
        LimitedCompletion::new(inner, self.limiter.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{EMBEDDINGS, LLM};
    use crate::store::{NewDocument, SearchOptions};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(AtomicUsize);

    #[async_trait]
    impl EmbeddingProvider for Counting {
        async fn embed(&self, text: &str) -> RecallResult<Vec<f32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(vec![text.len() as f32])
        }
        fn model_name(&self) -> &str {
            "counting"
        }
    }

    fn config(dir: &std::path::Path) -> RecallConfig {
        let mut cfg = RecallConfig::default();
        cfg.store.root_dir = dir.to_path_buf();
        cfg
    }

    #[tokio::test]
    async fn store_embeds_through_cache() {
        let dir = tempfile::tempdir().unwrap();
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        let engine = Engine::new(config(dir.path()), provider.clone()).unwrap();

        engine
            .store()
            .add("m", vec![NewDocument::new("abc"), NewDocument::new("abcdef")])
            .await
            .unwrap();
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);

        // The query text was already embedded as a document.
        let hits = engine
            .store()
            .search("m", "abc", SearchOptions::new(1))
            .await
            .unwrap();
        assert_eq!(hits[0].record.text, "abc");
        assert_eq!(provider.0.load(Ordering::SeqCst), 2);
        assert_eq!(engine.cache().stats().hits, 1);

        let stats = engine.limiter().all_stats();
        assert!(stats.global[EMBEDDINGS].tokens < 500.0);
        assert_eq!(stats.global[LLM].capacity, 200);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config(dir.path());
        cfg.cache.max_size = 0;
        let provider = Arc::new(Counting(AtomicUsize::new(0)));
        assert!(matches!(
            Engine::new(cfg, provider),
            Err(RecallError::Config(_))
        ));
    }

    #[test]
    fn from_config_requires_api_key() {
        let mut cfg = RecallConfig::default();
        cfg.embedding.api_key_env = "RECALL_TEST_KEY_THAT_IS_NEVER_SET".into();
        let err = Engine::from_config(cfg).err().unwrap();
        assert!(err.to_string().contains("RECALL_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn graph_uses_engine_event_log() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(config(dir.path()), Arc::new(Counting(AtomicUsize::new(0)))).unwrap();
        assert!(engine.graph().is_empty());
        assert_eq!(engine.config().store.root_dir, dir.path());
    }
}
