//! Language model backend for locally hosted OpenAI-compatible servers.
//!
//! Talks to the `/completions` endpoint of llama.cpp, vLLM or
//! `mistralrs-server` with streaming enabled and greedy decoding.
//!
//! This module is only available when the `openai` feature is enabled.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, instrument};

use crate::error::{RagError, Result};
use crate::model::{FragmentStream, GenerationRequest, LanguageModel};

/// Where a local inference server listens by default.
pub const DEFAULT_LOCAL_BASE_URL: &str = "http://127.0.0.1:8000/v1";

const DONE_SENTINEL: &str = "[DONE]";

/// A [`LanguageModel`] served over the OpenAI completions protocol.
///
/// # Example
///
/// ```rust,ignore
/// use yuelu_rag::completions::OpenAICompatibleModel;
///
/// let model = OpenAICompatibleModel::new("http://127.0.0.1:8000/v1", "yuelu-qwen");
/// ```
pub struct OpenAICompatibleModel {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAICompatibleModel {
    /// Create a backend for `model` served at `base_url`.
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key: None,
        }
    }

    /// Send `api_key` as a bearer token. Local servers usually need none.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/completions", self.base_url)
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    max_tokens: usize,
    temperature: f32,
    repetition_penalty: f32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<Vec<&'a str>>,
}

#[derive(Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
}

#[async_trait]
impl LanguageModel for OpenAICompatibleModel {
    fn name(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, prompt_len = request.prompt.len()))]
    async fn stream(&self, request: GenerationRequest) -> Result<FragmentStream> {
        let sampling = &request.sampling;
        let body = CompletionRequest {
            model: &self.model,
            prompt: &request.prompt,
            max_tokens: sampling.max_new_tokens,
            temperature: 0.0,
            repetition_penalty: sampling.repetition_penalty,
            stream: true,
            stop: sampling.stop.as_deref().map(|s| vec![s]),
        };

        let mut builder = self.client.post(self.endpoint()).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(|e| {
            error!(error = %e, "completion request failed");
            RagError::Generation(format!("completion request failed: {e}"))
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            error!(status = %status, "completion endpoint rejected the request");
            return Err(RagError::Generation(format!("completion endpoint returned {status}: {text}")));
        }
        debug!("completion stream opened");

        let mut events = Box::pin(response.bytes_stream().eventsource());
        let fragments = async_stream::stream! {
            let mut terminated = false;
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(e) => {
                        terminated = true;
                        yield Err(RagError::Generation(format!("malformed event stream: {e}")));
                        break;
                    }
                };
                if event.data.trim() == DONE_SENTINEL {
                    terminated = true;
                    break;
                }
                match serde_json::from_str::<CompletionChunk>(&event.data) {
                    Ok(chunk) => {
                        for choice in chunk.choices {
                            if !choice.text.is_empty() {
                                yield Ok(choice.text);
                            }
                        }
                    }
                    Err(e) => {
                        terminated = true;
                        yield Err(RagError::Generation(format!("malformed completion chunk: {e}")));
                        break;
                    }
                }
            }
            if !terminated {
                error!("completion stream ended before {DONE_SENTINEL}");
                yield Err(RagError::Generation(format!("stream ended before {DONE_SENTINEL}")));
            }
        };

        Ok(Box::pin(fragments))
    }
}
