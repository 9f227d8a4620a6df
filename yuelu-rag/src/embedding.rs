//! Embedding provider trait for generating vector embeddings from text.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{RagError, Result};

/// A provider that generates vector embeddings from text input.
///
/// Implementations wrap a specific embedding backend behind a unified async
/// interface. The default [`embed_batch`](EmbeddingProvider::embed_batch)
/// implementation calls [`embed`](EmbeddingProvider::embed) sequentially;
/// backends that support native batching should override it.
///
/// Providers do not retry. A failed call surfaces as
/// [`RagError::EmbeddingService`] and the caller decides what to do.
///
/// # Example
///
/// ```rust,ignore
/// use yuelu_rag::EmbeddingProvider;
///
/// let provider = MyEmbeddingProvider::new();
/// let embedding = provider.embed("hello world").await?;
/// assert_eq!(embedding.len(), provider.dimensions());
/// ```
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Generate an embedding vector for a single text input.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Generate embedding vectors for a batch of text inputs, one per input,
    /// in input order.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Return the dimensionality of embeddings produced by this provider.
    fn dimensions(&self) -> usize;

    /// A short provider name for logs and errors.
    fn name(&self) -> &str {
        "embedding"
    }
}

/// Embed `texts` in batches of at most `batch_size`, pausing `delay` between
/// batches to stay under the provider's rate limit.
///
/// The output has exactly one vector per input, in input order, and every
/// vector has the provider's dimension.
///
/// # Errors
///
/// Propagates the first provider error. Returns
/// [`RagError::EmbeddingService`] if a batch comes back with the wrong number
/// of vectors or with NaN/infinite components, and
/// [`RagError::DimensionMismatch`] for a wrongly sized vector.
pub async fn embed_in_batches(
    provider: &dyn EmbeddingProvider,
    texts: &[&str],
    batch_size: usize,
    delay: Duration,
) -> Result<Vec<Vec<f32>>> {
    let batch_size = batch_size.max(1);
    let mut embeddings = Vec::with_capacity(texts.len());

    for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
        if batch_index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(provider = provider.name(), batch_index, batch_size = batch.len(), "embedding batch");

        let vectors = provider.embed_batch(batch).await?;
        check_batch(provider, batch.len(), &vectors)?;
        embeddings.extend(vectors);
    }

    Ok(embeddings)
}

fn check_batch(provider: &dyn EmbeddingProvider, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
    if vectors.len() != expected {
        return Err(RagError::EmbeddingService {
            provider: provider.name().to_string(),
            kind: crate::error::EmbeddingFailure::InvalidResponse,
            message: format!("expected {expected} embeddings, got {}", vectors.len()),
        });
    }
    let dimensions = provider.dimensions();
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(RagError::DimensionMismatch { expected: dimensions, actual: bad.len() });
    }
    if let Some(row) = vectors.iter().position(|v| v.iter().any(|x| !x.is_finite())) {
        return Err(RagError::EmbeddingService {
            provider: provider.name().to_string(),
            kind: crate::error::EmbeddingFailure::InvalidResponse,
            message: format!("embedding {row} of the batch has a non-finite component"),
        });
    }
    Ok(())
}

/// Scale `v` to unit L2 norm in place. Zero vectors are left untouched.
pub fn normalize_l2(v: &mut [f32]) {
    let norm_sq: f32 = v.iter().map(|x| x * x).sum();
    if norm_sq > 0.0 {
        let inv_norm = norm_sq.sqrt().recip();
        for x in v.iter_mut() {
            *x *= inv_norm;
        }
    }
}

/// Inner product of two equally sized vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
