//! Retrieval-augmented generation core for the YueLu chat agent.
//!
//! This crate provides:
//! - Corpus discovery and boundary-aware chunking with overlap
//! - Batched, rate-limited embedding with retry on transient failures
//! - An exact cosine-similarity vector index persisted as two cross-checked files
//! - Top-k retrieval and prompt assembly
//! - Streaming answer generation behind a [`LanguageModel`] trait
//! - [`RagService`], which ties it together and exposes a chat interface
//!
//! The `openai` feature (on by default) adds an OpenAI-compatible embedding
//! provider and a client for locally served `/completions` endpoints.

pub mod chunking;
pub mod config;
pub mod document;
pub mod embedding;
pub mod error;
pub mod generator;
pub mod index;
pub mod ingest;
pub mod model;
pub mod prompt;
pub mod retriever;
pub mod retry;
pub mod service;

#[cfg(feature = "openai")]
pub mod completions;
#[cfg(feature = "openai")]
pub mod openai;

pub use chunking::{Chunker, FixedSizeChunker, RecursiveChunker};
pub use config::{EmbeddingConfig, GenerationConfig, RagConfig, RagConfigBuilder};
pub use document::{Chunk, Document, SearchResult};
pub use embedding::{EmbeddingProvider, embed_in_batches, normalize_l2};
pub use error::{EmbeddingFailure, RagError, Result};
pub use generator::{AnswerStream, Generator};
pub use index::{FlatIndex, IndexManifest, IndexStore, SharedIndex, VectorIndex, build_index};
pub use ingest::{CorpusIngestor, discover_documents};
pub use model::{FragmentStream, GenerationRequest, LanguageModel, SamplingConfig};
pub use prompt::PromptTemplate;
pub use retriever::Retriever;
pub use retry::{RetryPolicy, retry_with_backoff};
pub use service::{ChatTurn, RagService, RagServiceBuilder, TurnStatus};

#[cfg(feature = "openai")]
pub use completions::OpenAICompatibleModel;
#[cfg(feature = "openai")]
pub use openai::OpenAIEmbeddingProvider;
