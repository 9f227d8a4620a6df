//! Query-time similarity search over the active index.

use std::sync::Arc;

use tracing::{debug, error, instrument};

use crate::document::SearchResult;
use crate::embedding::{EmbeddingProvider, normalize_l2};
use crate::error::{RagError, Result};
use crate::index::SharedIndex;

/// Embeds questions and finds the most similar chunks.
///
/// Safe to share between concurrent queries: every search runs against a
/// snapshot of the active index.
#[derive(Clone)]
pub struct Retriever {
    provider: Arc<dyn EmbeddingProvider>,
    index: Arc<SharedIndex>,
    default_k: usize,
}

impl Retriever {
    /// Create a retriever over `index` returning `default_k` results unless told otherwise.
    pub fn new(provider: Arc<dyn EmbeddingProvider>, index: Arc<SharedIndex>, default_k: usize) -> Self {
        Self { provider, index, default_k }
    }

    /// Number of results returned by [`retrieve_default`](Self::retrieve_default).
    pub fn default_k(&self) -> usize {
        self.default_k
    }

    /// Return up to `k` chunks ordered by descending cosine similarity to `query`.
    ///
    /// Fewer than `k` results come back only when the index holds fewer
    /// than `k` chunks.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Retrieval`] wrapping the embedding failure.
    #[instrument(skip(self, query), fields(query_len = query.len()))]
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        if k == 0 {
            return Ok(Vec::new());
        }

        let mut query_embedding = self.provider.embed(query).await.map_err(|e| {
            error!(error = %e, "embedding failed during retrieval");
            RagError::Retrieval(Box::new(e))
        })?;

        let index = self.index.snapshot().await;
        if query_embedding.len() != index.dimension() {
            let mismatch = RagError::DimensionMismatch {
                expected: index.dimension(),
                actual: query_embedding.len(),
            };
            error!(error = %mismatch, "query embedding does not fit the index");
            return Err(RagError::Retrieval(Box::new(mismatch)));
        }
        normalize_l2(&mut query_embedding);

        let results = index.search(&query_embedding, k);
        debug!(
            result_count = results.len(),
            top_score = results.first().map(|r| r.score),
            "retrieval completed"
        );
        Ok(results)
    }

    /// [`retrieve`](Self::retrieve) with the default `k`.
    pub async fn retrieve_default(&self, query: &str) -> Result<Vec<SearchResult>> {
        self.retrieve(query, self.default_k).await
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::document::Chunk;
    use crate::error::EmbeddingFailure;
    use crate::index::{FlatIndex, VectorIndex};

    struct Fixed(Vec<f32>);

    #[async_trait]
    impl EmbeddingProvider for Fixed {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        fn dimensions(&self) -> usize {
            self.0.len()
        }
    }

    struct Down;

    #[async_trait]
    impl EmbeddingProvider for Down {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Err(RagError::EmbeddingService {
                provider: "down".into(),
                kind: EmbeddingFailure::Network,
                message: "unreachable".into(),
            })
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn index() -> Arc<SharedIndex> {
        let mut vectors = FlatIndex::new(2);
        vectors.add(&[1.0, 0.0]).unwrap();
        vectors.add(&[0.0, 1.0]).unwrap();
        let chunks = (0..2)
            .map(|id| Chunk { id, text: format!("chunk {id}"), source: PathBuf::new(), chunk_index: id })
            .collect();
        Arc::new(SharedIndex::new(VectorIndex::new(Uuid::new_v4(), "m", vectors, chunks).unwrap()))
    }

    #[tokio::test]
    async fn unnormalized_queries_score_as_cosine() {
        let retriever = Retriever::new(Arc::new(Fixed(vec![0.0, 5.0])), index(), 3);
        let results = retriever.retrieve("q", 1).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.id, 1);
        assert!((results[0].score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn k_larger_than_index_returns_everything() {
        let retriever = Retriever::new(Arc::new(Fixed(vec![1.0, 1.0])), index(), 3);
        assert_eq!(retriever.retrieve("q", 5).await.unwrap().len(), 2);
        assert_eq!(retriever.retrieve_default("q").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn embedding_failures_become_retrieval_errors() {
        let retriever = Retriever::new(Arc::new(Down), index(), 3);
        let err = retriever.retrieve("q", 3).await.unwrap_err();
        assert!(matches!(err, RagError::Retrieval(inner) if inner.is_transient()));
    }

    #[tokio::test]
    async fn wrongly_sized_queries_are_rejected() {
        let retriever = Retriever::new(Arc::new(Fixed(vec![1.0, 0.0, 0.0])), index(), 3);
        let err = retriever.retrieve("q", 3).await.unwrap_err();
        assert!(matches!(err, RagError::Retrieval(inner) if matches!(*inner, RagError::DimensionMismatch { .. })));
    }
}
