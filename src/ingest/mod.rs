//! Text ingestion: split raw text into overlapping chunks and index them.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::info;

use crate::error::RecallResult;
use crate::store::{NewDocument, VectorStore};

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

fn is_break(c: char) -> bool {
    c == ' ' || c == '\n' || c == '.'
}

/// Split `text` into chunks of at most `size` characters, each starting
/// `overlap` characters before the previous one ended.
///
/// A chunk ends at the last space, newline or `.` before the limit; a run
/// with no break character is split hard at `size`. Chunks are trimmed and
/// empty ones dropped.
pub fn chunk_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let size = size.max(1);
    let overlap = overlap.min(size - 1);
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let mut end = start + size;
        if end < chars.len() {
            while end > start && !is_break(chars[end]) {
                end -= 1;
            }
            if end == start {
                end = start + size;
            }
        } else {
            end = chars.len();
        }

        let chunk: String = chars[start..end].iter().collect();
        let trimmed = chunk.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }
    chunks
}

/// Where ingested text came from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub name: String,
    /// e.g. `pdf`, `web`, `youtube`, `text`.
    pub kind: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl Source {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestReport {
    pub chunks: usize,
    pub source: String,
    pub kind: String,
}

/// Chunks text and adds it to a [`VectorStore`] namespace.
pub struct Ingestor {
    store: Arc<VectorStore>,
    chunk_size: usize,
    chunk_overlap: usize,
}

impl Ingestor {
    pub fn new(store: Arc<VectorStore>) -> Self {
        Self {
            store,
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
        }
    }

    pub fn with_chunking(mut self, chunk_size: usize, chunk_overlap: usize) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_overlap = chunk_overlap;
        self
    }

    /// Chunk `text` and add every chunk to `namespace`.
    ///
    /// Each chunk carries `source`, `type`, `chunk_index` and `created_at`
    /// metadata; `extra` keys are merged on top.
    pub async fn ingest_text(
        &self,
        namespace: &str,
        text: &str,
        source: &Source,
        extra: Option<Map<String, Value>>,
    ) -> RecallResult<IngestReport> {
        let chunks = chunk_text(text, self.chunk_size, self.chunk_overlap);
        let created_at = chrono::Utc::now().to_rfc3339();

        let documents: Vec<NewDocument> = chunks
            .into_iter()
            .enumerate()
            .map(|(i, chunk)| {
                let mut meta = Map::new();
                meta.insert("source".into(), Value::from(source.name.clone()));
                meta.insert("type".into(), Value::from(source.kind.clone()));
                meta.insert("chunk_index".into(), Value::from(i));
                meta.insert("created_at".into(), Value::from(created_at.clone()));
                if let Some(extra) = &extra {
                    meta.extend(extra.clone());
                }
                NewDocument::new(chunk)
                    .with_source(source.name.clone())
                    .with_url(source.url.clone().unwrap_or_default())
                    .with_metadata(meta)
            })
            .collect();

        let count = self.store.add(namespace, documents).await?;
        info!(namespace, source = %source.name, chunks = count, "ingested text");
        Ok(IngestReport {
            chunks: count,
            source: source.name.clone(),
            kind: source.kind.clone(),
        })
    }
}
