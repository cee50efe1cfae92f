//! Namespaced vector store.
//!
//! Every namespace owns one [`FlatIndex`] and a parallel list of
//! [`DocumentRecord`]s; row `i` of the index is record `i`. Namespaces are
//! created on first write, persisted after every successful `add`, and loaded
//! lazily from disk on first access after a restart.
//!
//! ## Concurrency
//!
//! Namespaces live in a [`DashMap`] keyed by the namespace hash, each behind
//! its own `tokio::sync::RwLock`. Writers to one namespace are serialized,
//! readers share, and unrelated namespaces never contend. Embedding happens
//! before the write lock is taken.

mod filter;
mod persist;

pub use filter::{FilterValue, MetadataFilter};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::error::{RecallError, RecallResult};
use crate::index::{similarity_from_distance, FlatIndex};
use crate::provider::EmbeddingProvider;

use filter::passes;
use persist::{namespace_key, Artifacts};

/// A stored passage. Immutable once added.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub text: String,
    pub source: String,
    pub url: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Input to [`VectorStore::add`]. Omitted fields get defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewDocument {
    pub text: String,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub metadata: Option<Map<String, Value>>,
}

impl NewDocument {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Map<String, Value>) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Set a single metadata key.
    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata
            .get_or_insert_with(Map::new)
            .insert(key.into(), value.into());
        self
    }

    fn into_record(self) -> DocumentRecord {
        DocumentRecord {
            text: self.text,
            source: self.source.unwrap_or_else(|| "Unknown".into()),
            url: self.url.unwrap_or_default(),
            metadata: self.metadata.unwrap_or_default(),
        }
    }
}

/// A search hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredDocument {
    #[serde(flatten)]
    pub record: DocumentRecord,
    /// Squared L2 distance to the query.
    pub distance: f32,
    /// `1 / (1 + distance)`.
    pub similarity_score: f32,
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    pub k: usize,
    pub filters: Option<MetadataFilter>,
    /// Candidates fetched before filtering; the store default when `None`.
    pub overfetch_k: Option<usize>,
}

impl SearchOptions {
    pub fn new(k: usize) -> Self {
        Self {
            k,
            ..Default::default()
        }
    }

    pub fn with_filters(mut self, filters: MetadataFilter) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn with_overfetch(mut self, overfetch_k: usize) -> Self {
        self.overfetch_k = Some(overfetch_k);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root_dir: PathBuf,
    /// Texts per embedding request.
    pub batch_size: usize,
    /// Extra attempts per failed embedding batch.
    pub batch_retries: u32,
    pub default_overfetch_k: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("data/vector_store"),
            batch_size: 50,
            batch_retries: 1,
            default_overfetch_k: 25,
        }
    }
}

impl StoreConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }
}

struct Collection {
    name: String,
    artifacts: Artifacts,
    loaded: bool,
    index: FlatIndex,
    records: Vec<DocumentRecord>,
}

type CollectionHandle = Arc<RwLock<Collection>>;

/// Per-namespace vector collections backed by an embedding provider.
pub struct VectorStore {
    config: StoreConfig,
    embedder: Arc<dyn EmbeddingProvider>,
    collections: DashMap<String, CollectionHandle>,
}

impl VectorStore {
    pub fn new(config: StoreConfig, embedder: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            config,
            embedder,
            collections: DashMap::new(),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Registry handle for a namespace, loaded from disk on first use.
    async fn collection(&self, namespace: &str) -> CollectionHandle {
        let key = namespace_key(namespace);
        let handle = self
            .collections
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(RwLock::new(Collection {
                    name: namespace.to_string(),
                    artifacts: Artifacts::new(&self.config.root_dir, &key),
                    loaded: false,
                    index: FlatIndex::new(),
                    records: Vec::new(),
                }))
            })
            .clone();

        if handle.read().await.loaded {
            return handle;
        }

        let mut coll = handle.write().await;
        if !coll.loaded {
            match coll.artifacts.load(namespace).await {
                Ok(Some((index, records))) => {
                    debug!(namespace, count = records.len(), "loaded namespace from disk");
                    coll.index = index;
                    coll.records = records;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(namespace, error = %e, "discarding unreadable namespace artifacts");
                }
            }
            coll.loaded = true;
        }
        drop(coll);
        handle
    }

    async fn embed_chunk(&self, chunk: &[String]) -> RecallResult<Vec<Vec<f32>>> {
        let mut attempt = 0;
        loop {
            let result = self.embedder.embed_batch(chunk).await.and_then(|vectors| {
                if vectors.len() == chunk.len() {
                    Ok(vectors)
                } else {
                    Err(RecallError::Provider(format!(
                        "provider returned {} vectors for {} texts",
                        vectors.len(),
                        chunk.len()
                    )))
                }
            });
            match result {
                Ok(vectors) => return Ok(vectors),
                Err(RecallError::RateLimited { retry_after_ms, .. })
                    if attempt < self.config.batch_retries =>
                {
                    attempt += 1;
                    warn!(retry_after_ms, attempt, "embedding batch rate limited, retrying");
                    tokio::time::sleep(Duration::from_millis(retry_after_ms)).await;
                }
                Err(e @ (RecallError::Provider(_) | RecallError::Http(_)))
                    if attempt < self.config.batch_retries =>
                {
                    attempt += 1;
                    warn!(error = %e, attempt, "embedding batch failed, retrying");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Embed and append documents to a namespace, returning how many were added.
    ///
    /// All texts are embedded before anything is mutated, so a provider
    /// failure leaves the namespace untouched. A persistence failure rolls the
    /// in-memory state back.
    pub async fn add(&self, namespace: &str, documents: Vec<NewDocument>) -> RecallResult<usize> {
        if documents.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = documents.iter().map(|d| d.text.clone()).collect();
        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.config.batch_size.max(1)) {
            vectors.extend(self.embed_chunk(chunk).await?);
        }

        let handle = self.collection(namespace).await;
        let mut coll = handle.write().await;
        let previous_dim = coll.index.dim();
        let previous_len = coll.records.len();
        coll.index.add(&vectors)?;
        coll.records
            .extend(documents.into_iter().map(NewDocument::into_record));

        let coll = &mut *coll;
        if let Err(e) = coll.artifacts.save(&coll.index, &coll.records).await {
            warn!(namespace, error = %e, "persisting namespace failed, rolling back");
            if previous_dim.is_none() {
                coll.index = FlatIndex::new();
            } else {
                coll.index.truncate(previous_len);
            }
            coll.records.truncate(previous_len);
            return Err(e);
        }

        let added = coll.records.len() - previous_len;
        info!(namespace, count = added, total = coll.records.len(), "added documents");
        Ok(added)
    }

    /// Nearest documents to `query`, filtered, at most `options.k`.
    pub async fn search(
        &self,
        namespace: &str,
        query: &str,
        options: SearchOptions,
    ) -> RecallResult<Vec<ScoredDocument>> {
        if options.k == 0 {
            return Ok(Vec::new());
        }
        let handle = self.collection(namespace).await;
        if handle.read().await.records.is_empty() {
            debug!(namespace, "search on empty namespace");
            return Ok(Vec::new());
        }

        let query_vector = self.embedder.embed(query).await?;

        let coll = handle.read().await;
        let fetch = options
            .k
            .max(options.overfetch_k.unwrap_or(self.config.default_overfetch_k));
        let hits = coll.index.search(&query_vector, fetch)?;

        let results: Vec<ScoredDocument> = hits
            .into_iter()
            .filter_map(|(row, distance)| {
                let record = coll.records.get(row)?;
                passes(options.filters.as_ref(), &record.metadata).then(|| ScoredDocument {
                    record: record.clone(),
                    distance,
                    similarity_score: similarity_from_distance(distance),
                })
            })
            .take(options.k)
            .collect();

        debug!(namespace, candidates = fetch, returned = results.len(), "search complete");
        Ok(results)
    }

    /// Every stored record in insertion order, optionally filtered.
    pub async fn get_documents(
        &self,
        namespace: &str,
        filters: Option<&MetadataFilter>,
    ) -> RecallResult<Vec<DocumentRecord>> {
        let handle = self.collection(namespace).await;
        let coll = handle.read().await;
        Ok(coll
            .records
            .iter()
            .filter(|r| passes(filters, &r.metadata))
            .cloned()
            .collect())
    }

    pub async fn get_context_length(&self, namespace: &str) -> RecallResult<usize> {
        let handle = self.collection(namespace).await;
        let len = handle.read().await.records.len();
        Ok(len)
    }

    /// Names of resident namespaces holding at least one document.
    pub async fn namespaces(&self) -> Vec<String> {
        let handles: Vec<CollectionHandle> =
            self.collections.iter().map(|e| e.value().clone()).collect();
        let mut names = Vec::new();
        for handle in handles {
            let coll = handle.read().await;
            if !coll.records.is_empty() {
                names.push(coll.name.clone());
            }
        }
        names.sort();
        names
    }
}
