use crate::error::RecallResult;

/// Text → vector provider (the external embedding service).
#[async_trait::async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> RecallResult<Vec<f32>>;

    /// Embed many texts in one call. Output order matches input order.
    async fn embed_batch(&self, texts: &[String]) -> RecallResult<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Model (or deployment) name used for new requests.
    fn model_name(&self) -> &str;
}

/// Prompt → text provider (the external generation service).
///
/// Only graph nodes call this; the store and cache never do.
#[async_trait::async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, prompt: &str) -> RecallResult<String>;

    fn model_name(&self) -> &str;
}
