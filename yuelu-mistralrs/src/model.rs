//! MistralRsModel - in-process inference implementing the LanguageModel trait.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use mistralrs::{
    IsqType, ModelDType, PagedAttentionMetaBuilder, RequestBuilder, Response, StopTokens,
    TextMessageRole, TextModelBuilder,
};
use tracing::{debug, error, info, instrument};
use yuelu_rag::{FragmentStream, GenerationRequest, LanguageModel, RagError, SamplingConfig};

use crate::config::{DataType, Device, MistralRsConfig, ModelSource, QuantizationLevel};
use crate::error::{MistralRsError, Result};

/// mistral.rs model backend for the YueLu agent.
///
/// Loads the weights once and decodes prompts greedily, streaming every
/// increment back to the generator.
///
/// # Example
///
/// ```rust,ignore
/// use yuelu_mistralrs::MistralRsModel;
///
/// let model = MistralRsModel::from_local("models/yuelu-qwen-merged").await?;
/// ```
pub struct MistralRsModel {
    /// The underlying mistral.rs model instance
    model: Arc<mistralrs::Model>,
    /// Model name for identification
    name: String,
    /// Configuration used to create this model
    config: MistralRsConfig,
}

impl MistralRsModel {
    /// Load a model from configuration.
    #[instrument(skip(config), fields(model_source = ?config.model_source))]
    pub async fn new(config: MistralRsConfig) -> Result<Self> {
        config.validate()?;
        let model_id = config.model_id();
        info!(model = %model_id, "loading mistral.rs model");

        let mut builder = TextModelBuilder::new(model_id.clone()).with_dtype(model_dtype(config.dtype));

        if let Some(level) = config.isq {
            builder = builder.with_isq(quantization_level_to_isq(level));
            debug!(?level, "ISQ quantization enabled");
        }
        if config.device == Device::Cpu {
            builder = builder.with_force_cpu();
        }
        if let Some(template) = &config.chat_template {
            builder = builder.with_chat_template(template.display().to_string());
        }
        if config.paged_attention {
            builder = builder
                .with_paged_attn(|| PagedAttentionMetaBuilder::default().build())
                .map_err(|e| MistralRsError::ModelLoad(e.to_string()))?;
            debug!("PagedAttention enabled");
        }

        let model = builder.with_logging().build().await.map_err(|e| {
            error!(model = %model_id, error = %e, "model loading failed");
            MistralRsError::ModelLoad(e.to_string())
        })?;

        info!(model = %model_id, "model loaded");
        Ok(Self { model: Arc::new(model), name: model_id, config })
    }

    /// Load from a HuggingFace model ID with defaults.
    pub async fn from_hf(model_id: &str) -> Result<Self> {
        let config = MistralRsConfig::builder().model_source(ModelSource::huggingface(model_id)).build();
        Self::new(config).await
    }

    /// Load from a local model directory with defaults.
    pub async fn from_local(path: impl AsRef<Path>) -> Result<Self> {
        let config =
            MistralRsConfig::builder().model_source(ModelSource::local(path.as_ref())).build();
        Self::new(config).await
    }

    /// Get the model configuration
    pub fn config(&self) -> &MistralRsConfig {
        &self.config
    }
}

/// Translate the agent's decoding parameters into a mistral.rs request.
fn build_request(prompt: &str, sampling: &SamplingConfig) -> RequestBuilder {
    let mut request = RequestBuilder::new()
        .add_message(TextMessageRole::User, prompt)
        .set_deterministic_sampler()
        .set_sampler_max_len(sampling.max_new_tokens);

    if let Some(penalty) = frequency_penalty_for(sampling.repetition_penalty) {
        request = request.set_sampler_frequency_penalty(penalty);
    }
    if let Some(stop) = &sampling.stop {
        request = request.set_sampler_stop_toks(StopTokens::Seqs(vec![stop.clone()]));
    }
    request
}

/// mistral.rs penalizes repeats additively; 1.0 means no penalty.
fn frequency_penalty_for(repetition_penalty: f32) -> Option<f32> {
    let penalty = repetition_penalty - 1.0;
    (penalty > f32::EPSILON).then_some(penalty)
}

#[async_trait]
impl LanguageModel for MistralRsModel {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip_all, fields(model = %self.name, prompt_len = request.prompt.len()))]
    async fn stream(&self, request: GenerationRequest) -> yuelu_rag::Result<FragmentStream> {
        let chat_request = build_request(&request.prompt, &request.sampling);
        let model = Arc::clone(&self.model);

        let fragments = async_stream::stream! {
            let mut stream = match model.stream_chat_request(chat_request).await {
                Ok(stream) => stream,
                Err(e) => {
                    yield Err(RagError::from(MistralRsError::from_engine(e.to_string())));
                    return;
                }
            };

            let responses = async_stream::stream! {
                while let Some(response) = stream.next().await {
                    yield Step::from(response);
                }
            };
            let mut steps = Box::pin(decode_steps(responses));
            while let Some(item) = steps.next().await {
                yield item;
            }
        };

        Ok(Box::pin(fragments))
    }
}

/// What one engine response means for the answer.
#[derive(Debug)]
enum Step {
    Text(Vec<String>),
    Done,
    Failed(String),
    Skip,
}

impl From<Response> for Step {
    fn from(response: Response) -> Self {
        match response {
            Response::Chunk(chunk) => {
                Step::Text(chunk.choices.into_iter().filter_map(|choice| choice.delta.content).collect())
            }
            Response::Done(_) => Step::Done,
            Response::ModelError(message, _) => Step::Failed(message),
            Response::InternalError(e) | Response::ValidationError(e) => Step::Failed(e.to_string()),
            _ => Step::Skip,
        }
    }
}

/// Turn engine steps into fragments. A stream that stops without a
/// completion marker ends with an error.
fn decode_steps(
    steps: impl Stream<Item = Step> + Send,
) -> impl Stream<Item = yuelu_rag::Result<String>> + Send {
    async_stream::stream! {
        let mut steps = Box::pin(steps);
        let mut terminated = false;
        while let Some(step) = steps.next().await {
            match step {
                Step::Text(texts) => {
                    for text in texts {
                        yield Ok(text);
                    }
                }
                Step::Done => {
                    terminated = true;
                    break;
                }
                Step::Failed(message) => {
                    terminated = true;
                    yield Err(RagError::from(MistralRsError::from_engine(message)));
                    break;
                }
                Step::Skip => {}
            }
        }
        if !terminated {
            error!("engine stream ended without a completion marker");
            yield Err(RagError::from(MistralRsError::Inference(
                "stream ended before completion".to_string(),
            )));
        }
    }
}

fn model_dtype(dtype: DataType) -> ModelDType {
    match dtype {
        DataType::F32 => ModelDType::F32,
        DataType::F16 => ModelDType::F16,
        DataType::BF16 => ModelDType::BF16,
        DataType::Auto => ModelDType::Auto,
    }
}

/// Convert QuantizationLevel to mistral.rs IsqType
fn quantization_level_to_isq(level: QuantizationLevel) -> IsqType {
    match level {
        QuantizationLevel::Q4_0 => IsqType::Q4_0,
        QuantizationLevel::Q4_1 => IsqType::Q4_1,
        QuantizationLevel::Q5_0 => IsqType::Q5_0,
        QuantizationLevel::Q5_1 => IsqType::Q5_1,
        QuantizationLevel::Q8_0 => IsqType::Q8_0,
        QuantizationLevel::Q8_1 => IsqType::Q8_1,
        QuantizationLevel::Q2K => IsqType::Q2K,
        QuantizationLevel::Q3K => IsqType::Q3K,
        QuantizationLevel::Q4K => IsqType::Q4K,
        QuantizationLevel::Q5K => IsqType::Q5K,
        QuantizationLevel::Q6K => IsqType::Q6K,
    }
}

impl std::fmt::Debug for MistralRsModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MistralRsModel").field("name", &self.name).field("config", &self.config).finish()
    }
}
