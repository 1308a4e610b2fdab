// Database module
// Vector collection boundary and its LanceDB implementation

pub mod lancedb;

pub use self::lancedb::LanceCollection;

use async_trait::async_trait;

use crate::Result;
use crate::records::{Document, Metadata};

/// One nearest-neighbour match from a collection query
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub id: String,
    pub text: String,
    pub metadata: Metadata,
    pub distance: f32,
    /// `1 - distance`, higher is closer
    pub similarity: f32,
}

/// Persistent store of documents keyed by identifier, searchable by vector
#[async_trait]
pub trait VectorCollection: Send + Sync {
    /// Insert or replace documents with their embeddings.
    ///
    /// `embeddings[i]` belongs to `documents[i]`; a length mismatch is an error
    /// and nothing is written.
    async fn upsert(&mut self, documents: &[Document], embeddings: &[Vec<f32>]) -> Result<()>;

    /// The `k` documents nearest to `embedding`, closest first
    async fn query(&self, embedding: &[f32], k: usize) -> Result<Vec<SearchHit>>;

    /// Number of stored documents
    async fn count(&self) -> Result<u64>;

    /// Drop all stored documents
    async fn recreate(&mut self) -> Result<()>;
}
