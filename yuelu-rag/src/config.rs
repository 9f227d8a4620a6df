//! Configuration for the RAG service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RagError, Result};
use crate::prompt::{CONTEXT_PLACEHOLDER, DEFAULT_TEMPLATE, QUESTION_PLACEHOLDER};
use crate::retry::RetryPolicy;

/// Settings for the embedding service and how the index builder calls it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Model identifier sent with every embedding request.
    pub model: String,
    /// Dimension D of every vector produced by `model`.
    pub dimensions: usize,
    /// Maximum number of texts per embedding request.
    pub batch_size: usize,
    /// Pause between consecutive batches, in milliseconds.
    pub batch_delay_ms: u64,
    /// Backoff applied by the index builder to transient failures.
    pub retry: RetryPolicy,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "text-embedding-v4".to_string(),
            dimensions: 1024,
            batch_size: 10,
            batch_delay_ms: 200,
            retry: RetryPolicy::default(),
        }
    }
}

impl EmbeddingConfig {
    /// The pause between batches as a [`Duration`].
    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

/// Decoding parameters for the language model.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on newly generated tokens per answer.
    pub max_new_tokens: usize,
    /// Penalty (> 1.0 discourages) applied to already generated tokens.
    pub repetition_penalty: f32,
    /// Optional stop sequence in addition to the model's end-of-sequence token.
    pub stop: Option<String>,
    /// Prompt template with `{context}` and `{question}` placeholders.
    pub prompt_template: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 512,
            repetition_penalty: 1.1,
            stop: None,
            prompt_template: DEFAULT_TEMPLATE.to_string(),
        }
    }
}

/// Configuration parameters for the RAG service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RagConfig {
    /// Directory holding the source documents.
    pub corpus_dir: PathBuf,
    /// Directory holding the persisted index artifacts.
    pub vector_dir: PathBuf,
    /// File extension (without the dot) of documents to ingest.
    pub file_extension: String,
    /// Maximum chunk size in characters.
    pub chunk_size: usize,
    /// Number of overlapping characters between consecutive chunks.
    pub chunk_overlap: usize,
    /// Number of chunks retrieved per question.
    pub top_k: usize,
    /// Embedding service settings.
    pub embedding: EmbeddingConfig,
    /// Language model settings.
    pub generation: GenerationConfig,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            corpus_dir: PathBuf::from("data"),
            vector_dir: PathBuf::from("vector_store"),
            file_extension: "md".to_string(),
            chunk_size: 800,
            chunk_overlap: 100,
            top_k: 3,
            embedding: EmbeddingConfig::default(),
            generation: GenerationConfig::default(),
        }
    }
}

impl RagConfig {
    /// Create a new builder for constructing a [`RagConfig`].
    pub fn builder() -> RagConfigBuilder {
        RagConfigBuilder::default()
    }

    /// Check that the parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(RagError::Config("chunk_size must be greater than zero".to_string()));
        }
        if self.chunk_overlap >= self.chunk_size {
            return Err(RagError::Config(format!(
                "chunk_overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if self.top_k == 0 {
            return Err(RagError::Config("top_k must be greater than zero".to_string()));
        }
        if self.file_extension.is_empty() {
            return Err(RagError::Config("file_extension must not be empty".to_string()));
        }
        if self.embedding.model.is_empty() {
            return Err(RagError::Config("embedding model must not be empty".to_string()));
        }
        if self.embedding.dimensions == 0 {
            return Err(RagError::Config("embedding dimensions must be greater than zero".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(RagError::Config("embedding batch_size must be greater than zero".into()));
        }
        if self.generation.max_new_tokens == 0 {
            return Err(RagError::Config("max_new_tokens must be greater than zero".to_string()));
        }
        if !(self.generation.repetition_penalty.is_finite()
            && self.generation.repetition_penalty > 0.0)
        {
            return Err(RagError::Config(format!(
                "repetition_penalty ({}) must be a positive number",
                self.generation.repetition_penalty
            )));
        }
        let template = &self.generation.prompt_template;
        if !template.contains(CONTEXT_PLACEHOLDER) || !template.contains(QUESTION_PLACEHOLDER) {
            return Err(RagError::Config(format!(
                "prompt_template must contain both {CONTEXT_PLACEHOLDER} and {QUESTION_PLACEHOLDER}"
            )));
        }
        Ok(())
    }
}

/// Builder for constructing a validated [`RagConfig`].
#[derive(Debug, Clone, Default)]
pub struct RagConfigBuilder {
    config: RagConfig,
}

impl RagConfigBuilder {
    /// Start from an existing configuration, e.g. one read from a file.
    pub fn from_config(config: RagConfig) -> Self {
        Self { config }
    }

    /// Set the corpus directory.
    pub fn corpus_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.corpus_dir = dir.into();
        self
    }

    /// Set the directory for the persisted index.
    pub fn vector_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.vector_dir = dir.into();
        self
    }

    /// Set the extension of documents to ingest.
    pub fn file_extension(mut self, extension: impl Into<String>) -> Self {
        self.config.file_extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    /// Set the maximum chunk size in characters.
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.chunk_size = size;
        self
    }

    /// Set the overlap between consecutive chunks in characters.
    pub fn chunk_overlap(mut self, overlap: usize) -> Self {
        self.config.chunk_overlap = overlap;
        self
    }

    /// Set the number of chunks retrieved per question.
    pub fn top_k(mut self, k: usize) -> Self {
        self.config.top_k = k;
        self
    }

    /// Set the embedding model identifier.
    pub fn embedding_model(mut self, model: impl Into<String>) -> Self {
        self.config.embedding.model = model.into();
        self
    }

    /// Set the embedding dimension.
    pub fn embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.config.embedding.dimensions = dimensions;
        self
    }

    /// Set the embedding batch size.
    pub fn embedding_batch_size(mut self, size: usize) -> Self {
        self.config.embedding.batch_size = size;
        self
    }

    /// Set the pause between embedding batches.
    pub fn embedding_batch_delay(mut self, delay: Duration) -> Self {
        self.config.embedding.batch_delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the retry policy used while building the index.
    pub fn embedding_retry(mut self, policy: RetryPolicy) -> Self {
        self.config.embedding.retry = policy;
        self
    }

    /// Set the maximum number of generated tokens.
    pub fn max_new_tokens(mut self, tokens: usize) -> Self {
        self.config.generation.max_new_tokens = tokens;
        self
    }

    /// Set the repetition penalty.
    pub fn repetition_penalty(mut self, penalty: f32) -> Self {
        self.config.generation.repetition_penalty = penalty;
        self
    }

    /// Set an extra stop sequence.
    pub fn stop(mut self, stop: impl Into<String>) -> Self {
        self.config.generation.stop = Some(stop.into());
        self
    }

    /// Replace the prompt template.
    pub fn prompt_template(mut self, template: impl Into<String>) -> Self {
        self.config.generation.prompt_template = template.into();
        self
    }

    /// Build the [`RagConfig`], validating that parameters are consistent.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if, among others:
    /// - `chunk_overlap >= chunk_size`
    /// - `top_k == 0`
    /// - the prompt template lacks a placeholder
    pub fn build(self) -> Result<RagConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_agent() {
        let config = RagConfig::default();
        assert_eq!(config.chunk_size, 800);
        assert_eq!(config.chunk_overlap, 100);
        assert_eq!(config.top_k, 3);
        assert_eq!(config.embedding.model, "text-embedding-v4");
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.embedding.batch_size, 10);
        assert_eq!(config.embedding.batch_delay(), Duration::from_millis(200));
        assert_eq!(config.generation.max_new_tokens, 512);
        assert!((config.generation.repetition_penalty - 1.1).abs() < f32::EPSILON);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_overlap_not_smaller_than_chunk_size() {
        let result = RagConfig::builder().chunk_size(100).chunk_overlap(100).build();
        assert!(matches!(result, Err(RagError::Config(_))));
    }

    #[test]
    fn rejects_zero_top_k_and_zero_batch() {
        assert!(RagConfig::builder().top_k(0).build().is_err());
        assert!(RagConfig::builder().embedding_batch_size(0).build().is_err());
        assert!(RagConfig::builder().max_new_tokens(0).build().is_err());
        assert!(RagConfig::builder().repetition_penalty(0.0).build().is_err());
    }

    #[test]
    fn rejects_template_without_placeholders() {
        let result = RagConfig::builder().prompt_template("Answer: {question}").build();
        assert!(result.is_err());
    }

    #[test]
    fn builder_strips_leading_dot_from_extension() {
        let config = RagConfig::builder().file_extension(".txt").build().unwrap();
        assert_eq!(config.file_extension, "txt");
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: RagConfig =
            serde_json::from_str(r#"{ "top_k": 5, "embedding": { "batch_size": 4 } }"#).unwrap();
        assert_eq!(config.top_k, 5);
        assert_eq!(config.embedding.batch_size, 4);
        assert_eq!(config.embedding.dimensions, 1024);
        assert_eq!(config.chunk_size, 800);
    }
}
