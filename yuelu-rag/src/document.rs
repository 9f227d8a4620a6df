//! Data types for documents, chunks, and search results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A source document loaded from the corpus directory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Document {
    /// Identifier derived from the file name.
    pub id: String,
    /// The text content of the document.
    pub text: String,
    /// The file the document was read from.
    pub source: PathBuf,
}

/// A bounded-size slice of a [`Document`], the unit of retrieval.
///
/// Chunks are immutable once created. `id` is the chunk's position in the
/// corpus and therefore also its row in the vector index.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    /// Position of the chunk in the whole corpus.
    pub id: usize,
    /// The text content of the chunk.
    pub text: String,
    /// The file the chunk was cut from.
    pub source: PathBuf,
    /// Position of the chunk within its document.
    pub chunk_index: usize,
}

/// A retrieved [`Chunk`] paired with its similarity score.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResult {
    /// The retrieved chunk.
    pub chunk: Chunk,
    /// Inner product of the normalized query and chunk vectors (cosine similarity).
    pub score: f32,
}
