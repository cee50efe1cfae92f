mod cached;
mod openai;
mod traits;

pub use cached::{CachedEmbedder, LimitedCompletion};
pub use openai::{OpenAiCompletionProvider, OpenAiEmbeddingProvider, FALLBACK_EMBEDDING_MODEL};
pub use traits::*;
