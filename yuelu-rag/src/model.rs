//! The boundary between the generator and a causal language model.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::config::GenerationConfig;
use crate::error::Result;

/// Decoding parameters sent with every generation request.
///
/// Decoding is always greedy; `do_sample` exists so backends can forward it
/// verbatim to engines that expect the flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Upper bound on newly generated tokens.
    pub max_new_tokens: usize,
    /// Penalty applied to already generated tokens (1.0 = none).
    pub repetition_penalty: f32,
    /// Always `false`: pick the most likely token at every step.
    pub do_sample: bool,
    /// Optional stop sequence besides the model's end-of-sequence token.
    pub stop: Option<String>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self::from(&GenerationConfig::default())
    }
}

impl From<&GenerationConfig> for SamplingConfig {
    fn from(config: &GenerationConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            repetition_penalty: config.repetition_penalty,
            do_sample: false,
            stop: config.stop.clone(),
        }
    }
}

/// Everything a backend needs to answer one question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// The user's original question.
    pub query: String,
    /// The fully assembled prompt, context included.
    pub prompt: String,
    /// Decoding parameters.
    pub sampling: SamplingConfig,
}

/// Incrementally decoded text. Ends when decoding finishes; an `Err` item
/// means decoding failed and no further fragments follow.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// A causal language model that decodes a prompt token by token.
///
/// Implementations own their weights and accelerator memory. The generator
/// never calls [`stream`](LanguageModel::stream) concurrently on the same
/// instance.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model name for logs.
    fn name(&self) -> &str;

    /// Start decoding `request` and return the stream of text increments.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Generation`](crate::RagError::Generation) if
    /// decoding cannot start at all.
    async fn stream(&self, request: GenerationRequest) -> Result<FragmentStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sampling_follows_generation_config() {
        let config = GenerationConfig { stop: Some("</s>".into()), ..GenerationConfig::default() };
        let sampling = SamplingConfig::from(&config);
        assert_eq!(sampling.max_new_tokens, 512);
        assert!(!sampling.do_sample);
        assert_eq!(sampling.stop.as_deref(), Some("</s>"));
    }
}
