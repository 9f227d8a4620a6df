//! Configuration types for mistral.rs model loading.

use std::path::PathBuf;

use crate::error::{MistralRsError, Result};

/// Configuration for mistral.rs model loading.
#[derive(Debug, Clone, Default)]
pub struct MistralRsConfig {
    /// Model source: HuggingFace ID or local directory
    pub model_source: ModelSource,

    /// Data type for model weights
    pub dtype: DataType,

    /// Device selection
    pub device: Device,

    /// In-situ quantization applied while loading (optional)
    pub isq: Option<QuantizationLevel>,

    /// Enable PagedAttention
    pub paged_attention: bool,

    /// Custom chat template file (optional)
    pub chat_template: Option<PathBuf>,
}

impl MistralRsConfig {
    /// Create a new config builder
    pub fn builder() -> MistralRsConfigBuilder {
        MistralRsConfigBuilder::default()
    }

    /// The model identifier handed to mistral.rs.
    pub fn model_id(&self) -> String {
        match &self.model_source {
            ModelSource::HuggingFace(id) => id.clone(),
            ModelSource::Local(path) => path.display().to_string(),
        }
    }

    /// Check that the model can be located.
    pub fn validate(&self) -> Result<()> {
        match &self.model_source {
            ModelSource::HuggingFace(id) if id.trim().is_empty() => {
                Err(MistralRsError::InvalidConfig("model id must not be empty".to_string()))
            }
            ModelSource::Local(path) if !path.is_dir() => {
                Err(MistralRsError::ModelNotFound { path: path.display().to_string() })
            }
            _ => Ok(()),
        }
    }
}

/// Builder for MistralRsConfig
#[derive(Debug, Clone, Default)]
pub struct MistralRsConfigBuilder {
    config: MistralRsConfig,
}

impl MistralRsConfigBuilder {
    /// Set the model source
    pub fn model_source(mut self, source: ModelSource) -> Self {
        self.config.model_source = source;
        self
    }

    /// Set the data type
    pub fn dtype(mut self, dtype: DataType) -> Self {
        self.config.dtype = dtype;
        self
    }

    /// Set the device
    pub fn device(mut self, device: Device) -> Self {
        self.config.device = device;
        self
    }

    /// Enable ISQ quantization
    pub fn isq(mut self, level: QuantizationLevel) -> Self {
        self.config.isq = Some(level);
        self
    }

    /// Enable PagedAttention
    pub fn paged_attention(mut self, enabled: bool) -> Self {
        self.config.paged_attention = enabled;
        self
    }

    /// Set custom chat template
    pub fn chat_template(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.chat_template = Some(path.into());
        self
    }

    /// Build the configuration
    pub fn build(self) -> MistralRsConfig {
        self.config
    }
}

/// Where the model weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// HuggingFace Hub model ID (e.g., "Qwen/Qwen2.5-1.5B-Instruct")
    HuggingFace(String),
    /// Local directory with weights, tokenizer and config, e.g. a merged fine-tune
    Local(PathBuf),
}

impl Default for ModelSource {
    fn default() -> Self {
        Self::HuggingFace(String::new())
    }
}

impl ModelSource {
    /// Create a HuggingFace model source
    pub fn huggingface(model_id: impl Into<String>) -> Self {
        Self::HuggingFace(model_id.into())
    }

    /// Create a local path model source
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self::Local(path.into())
    }
}

/// Data type for model weights
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DataType {
    /// 32-bit floating point
    F32,
    /// 16-bit floating point
    F16,
    /// Brain floating point 16
    BF16,
    /// Auto-detect based on model and hardware
    #[default]
    Auto,
}

/// Device selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    /// Best available accelerator, falling back to CPU
    #[default]
    Auto,
    /// Force CPU
    Cpu,
}

/// Quantization level for ISQ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuantizationLevel {
    /// 4-bit quantization (variant 0)
    Q4_0,
    /// 4-bit quantization (variant 1)
    Q4_1,
    /// 5-bit quantization (variant 0)
    Q5_0,
    /// 5-bit quantization (variant 1)
    Q5_1,
    /// 8-bit quantization (variant 0)
    Q8_0,
    /// 8-bit quantization (variant 1)
    Q8_1,
    /// 2-bit K-quant
    Q2K,
    /// 3-bit K-quant
    Q3K,
    /// 4-bit K-quant
    Q4K,
    /// 5-bit K-quant
    Q5K,
    /// 6-bit K-quant
    Q6K,
}
