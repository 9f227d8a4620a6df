//! Command-line arguments and their mapping onto [`RagConfig`].

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use yuelu_rag::RagConfig;
use yuelu_rag::completions::DEFAULT_LOCAL_BASE_URL;
use yuelu_rag::config::RagConfigBuilder;
use yuelu_rag::openai::{API_KEY_ENV, DEFAULT_BASE_URL};

/// Ask questions about the YueLu Academy knowledge base.
#[derive(Parser, Debug)]
#[command(name = "yuelu", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub settings: Settings,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Build the vector index if it is missing
    Index {
        /// Rebuild even if an index already exists
        #[arg(long)]
        rebuild: bool,
    },
    /// Answer a single question and exit
    Ask {
        /// The question
        #[arg(required = true, trailing_var_arg = true)]
        question: Vec<String>,

        /// Print the retrieved chunks after the answer
        #[arg(long)]
        show_sources: bool,
    },
    /// Start an interactive chat session
    Chat,
}

/// Settings shared by every subcommand.
///
/// Each flag falls back to an environment variable, then to the JSON file
/// given with `--config`, then to the built-in default.
#[derive(Args, Debug, Clone, Default)]
pub struct Settings {
    /// JSON configuration file seeding every other setting
    #[arg(long, global = true, env = "YUELU_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory holding the source documents
    #[arg(long, global = true, env = "YUELU_CORPUS_DIR")]
    pub corpus_dir: Option<PathBuf>,

    /// Directory holding the persisted index
    #[arg(long, global = true, env = "YUELU_VECTOR_DIR")]
    pub vector_dir: Option<PathBuf>,

    /// Extension of the documents to ingest, without the dot
    #[arg(long, global = true, env = "YUELU_FILE_EXTENSION")]
    pub file_extension: Option<String>,

    /// Maximum chunk size in characters
    #[arg(long, global = true, env = "YUELU_CHUNK_SIZE")]
    pub chunk_size: Option<usize>,

    /// Characters shared by consecutive chunks
    #[arg(long, global = true, env = "YUELU_CHUNK_OVERLAP")]
    pub chunk_overlap: Option<usize>,

    /// Chunks retrieved per question
    #[arg(long, global = true, env = "YUELU_TOP_K")]
    pub top_k: Option<usize>,

    /// Embedding model name
    #[arg(long, global = true, env = "YUELU_EMBEDDING_MODEL")]
    pub embedding_model: Option<String>,

    /// Embedding dimension
    #[arg(long, global = true, env = "YUELU_EMBEDDING_DIMENSIONS")]
    pub embedding_dimensions: Option<usize>,

    /// OpenAI-compatible embeddings endpoint
    #[arg(long, global = true, env = "YUELU_EMBEDDING_BASE_URL", default_value = DEFAULT_BASE_URL)]
    pub embedding_base_url: String,

    /// Embedding service API key
    #[arg(long, global = true, env = API_KEY_ENV, hide_env_values = true)]
    pub api_key: Option<String>,

    /// OpenAI-compatible completions endpoint serving the language model
    #[arg(long, global = true, env = "YUELU_MODEL_URL", default_value = DEFAULT_LOCAL_BASE_URL)]
    pub model_url: String,

    /// Language model name as known to the completions endpoint
    #[arg(long, global = true, env = "YUELU_MODEL", default_value = "yuelu")]
    pub model: String,

    /// API key for the completions endpoint, if it needs one
    #[arg(long, global = true, env = "YUELU_MODEL_API_KEY", hide_env_values = true)]
    pub model_api_key: Option<String>,

    /// Upper bound on generated tokens per answer
    #[arg(long, global = true, env = "YUELU_MAX_NEW_TOKENS")]
    pub max_new_tokens: Option<usize>,

    /// Penalty applied to repeated tokens
    #[arg(long, global = true, env = "YUELU_REPETITION_PENALTY")]
    pub repetition_penalty: Option<f32>,
}

impl Settings {
    /// Resolve the effective configuration.
    pub fn rag_config(&self) -> anyhow::Result<RagConfig> {
        let base = match &self.config {
            Some(path) => read_config_file(path)?,
            None => RagConfig::default(),
        };

        let mut builder = RagConfigBuilder::from_config(base);
        if let Some(dir) = &self.corpus_dir {
            builder = builder.corpus_dir(dir);
        }
        if let Some(dir) = &self.vector_dir {
            builder = builder.vector_dir(dir);
        }
        if let Some(extension) = &self.file_extension {
            builder = builder.file_extension(extension.trim_start_matches('.'));
        }
        if let Some(size) = self.chunk_size {
            builder = builder.chunk_size(size);
        }
        if let Some(overlap) = self.chunk_overlap {
            builder = builder.chunk_overlap(overlap);
        }
        if let Some(k) = self.top_k {
            builder = builder.top_k(k);
        }
        if let Some(model) = &self.embedding_model {
            builder = builder.embedding_model(model);
        }
        if let Some(dimensions) = self.embedding_dimensions {
            builder = builder.embedding_dimensions(dimensions);
        }
        if let Some(tokens) = self.max_new_tokens {
            builder = builder.max_new_tokens(tokens);
        }
        if let Some(penalty) = self.repetition_penalty {
            builder = builder.repetition_penalty(penalty);
        }

        Ok(builder.build()?)
    }
}

fn read_config_file(path: &Path) -> anyhow::Result<RagConfig> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ask_collects_the_question_words() {
        let cli = Cli::try_parse_from(["yuelu", "ask", "When", "was", "it", "founded?"]).unwrap();
        match cli.command {
            Command::Ask { question, show_sources } => {
                assert_eq!(question.join(" "), "When was it founded?");
                assert!(!show_sources);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn ask_requires_a_question() {
        assert!(Cli::try_parse_from(["yuelu", "ask"]).is_err());
    }

    #[test]
    fn global_flags_work_after_the_subcommand() {
        let cli = Cli::try_parse_from(["yuelu", "index", "--rebuild", "--top-k", "5"]).unwrap();
        assert_eq!(cli.command, Command::Index { rebuild: true });
        assert_eq!(cli.settings.top_k, Some(5));
    }

    #[test]
    fn flags_override_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("yuelu.json");
        std::fs::write(&path, r#"{ "top_k": 7, "chunk_size": 400, "embedding": { "dimensions": 512 } }"#)
            .unwrap();

        let settings = Settings {
            config: Some(path),
            chunk_size: Some(300),
            file_extension: Some(".txt".into()),
            ..Settings::default()
        };
        let config = settings.rag_config().unwrap();

        assert_eq!(config.top_k, 7);
        assert_eq!(config.chunk_size, 300);
        assert_eq!(config.embedding.dimensions, 512);
        assert_eq!(config.file_extension, "txt");
        assert_eq!(config.embedding.batch_size, 10);
    }

    #[test]
    fn invalid_combinations_are_rejected() {
        let settings = Settings { chunk_size: Some(50), chunk_overlap: Some(50), ..Settings::default() };
        assert!(settings.rag_config().is_err());
    }

    #[test]
    fn unreadable_config_file_is_reported() {
        let settings = Settings { config: Some(PathBuf::from("/nonexistent/yuelu.json")), ..Settings::default() };
        let err = settings.rag_config().unwrap_err();
        assert!(err.to_string().contains("failed to read config file"));
    }
}
