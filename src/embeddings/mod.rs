// Embeddings module
// Embedding model boundary and the Ollama client behind it

pub mod ollama;

pub use ollama::{DEFAULT_EMBEDDING_DIMENSION, ModelInfo, OllamaClient};

/// A model mapping texts to fixed-length vectors
pub trait Embedder: Send + Sync {
    /// Embed `texts`, returning exactly one vector per text in the same order
    fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>>;

    /// Identifier of the model, for logging and summaries
    fn model_name(&self) -> &str;
}
