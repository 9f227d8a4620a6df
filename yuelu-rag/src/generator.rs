//! Retrieval-grounded answer generation with background decoding.
//!
//! [`Generator::generate`] retrieves context, assembles the prompt and hands
//! decoding to a spawned worker task. The worker is the only producer on a
//! bounded channel and the returned [`AnswerStream`] is the only consumer.
//! The worker always finishes with an explicit marker, so a clean finish is
//! distinguishable from a failure or a crashed worker.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};

use futures::{Stream, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, instrument};

use crate::config::GenerationConfig;
use crate::document::SearchResult;
use crate::error::{RagError, Result};
use crate::model::{GenerationRequest, LanguageModel, SamplingConfig};
use crate::prompt::{PromptTemplate, context_block};
use crate::retriever::Retriever;

const CHANNEL_CAPACITY: usize = 64;

/// Messages from the decode worker to the stream reader.
#[derive(Debug)]
enum StreamEvent {
    Fragment(String),
    Done,
    Failed(RagError),
}

/// The answer to one question, delivered as it is decoded.
///
/// Yields `Ok(fragment)` for every decoded increment and ends with `None`
/// after a successful completion. A failed decode yields a single
/// `Err(RagError::Generation)` and then ends; everything yielded before it
/// is a truncated answer.
///
/// Dropping the stream tells the worker to stop forwarding fragments.
#[derive(Debug)]
pub struct AnswerStream {
    rx: mpsc::Receiver<StreamEvent>,
    sources: Vec<SearchResult>,
    finished: bool,
}

impl AnswerStream {
    /// The chunks the answer was grounded on, best first.
    pub fn sources(&self) -> &[SearchResult] {
        &self.sources
    }
}

impl Stream for AnswerStream {
    type Item = Result<String>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match ready!(this.rx.poll_recv(cx)) {
            Some(StreamEvent::Fragment(fragment)) => Poll::Ready(Some(Ok(fragment))),
            Some(StreamEvent::Done) => {
                this.finished = true;
                Poll::Ready(None)
            }
            Some(StreamEvent::Failed(e)) => {
                this.finished = true;
                Poll::Ready(Some(Err(e)))
            }
            None => {
                this.finished = true;
                Poll::Ready(Some(Err(RagError::Generation(
                    "decode worker exited without finishing".to_string(),
                ))))
            }
        }
    }
}

/// Answers questions with a language model grounded on retrieved chunks.
///
/// Only one decode runs at a time per generator: the worker holds the
/// model's lock for the whole request and later requests wait their turn.
pub struct Generator {
    retriever: Retriever,
    model: Arc<dyn LanguageModel>,
    decode_lock: Arc<Mutex<()>>,
    template: PromptTemplate,
    sampling: SamplingConfig,
}

impl Generator {
    /// Create a generator from a retriever, a model and decoding settings.
    pub fn new(retriever: Retriever, model: Arc<dyn LanguageModel>, config: &GenerationConfig) -> Self {
        Self {
            retriever,
            model,
            decode_lock: Arc::new(Mutex::new(())),
            template: PromptTemplate::new(config.prompt_template.clone()),
            sampling: SamplingConfig::from(config),
        }
    }

    /// The retriever used for grounding.
    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    /// Assemble the prompt for `query` from retrieved `results`.
    pub fn build_prompt(&self, query: &str, results: &[SearchResult]) -> String {
        self.template.render(&context_block(results), query)
    }

    /// Retrieve context for `query` and start decoding an answer.
    ///
    /// Every call runs retrieval and decoding from scratch.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Retrieval`] if context retrieval fails; no
    /// ungrounded answer is attempted in that case. Decode failures are
    /// reported through the returned stream.
    #[instrument(skip(self, query), fields(model = self.model.name(), query_len = query.len()))]
    pub async fn generate(&self, query: &str) -> Result<AnswerStream> {
        let sources = self.retriever.retrieve_default(query).await?;
        let prompt = self.build_prompt(query, &sources);
        debug!(source_count = sources.len(), prompt_len = prompt.len(), "assembled prompt");

        let request = GenerationRequest {
            query: query.to_string(),
            prompt,
            sampling: self.sampling.clone(),
        };

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        tokio::spawn(decode(Arc::clone(&self.model), Arc::clone(&self.decode_lock), request, tx));

        Ok(AnswerStream { rx, sources, finished: false })
    }
}

/// Drive one decode to completion, forwarding increments to `tx`.
async fn decode(
    model: Arc<dyn LanguageModel>,
    decode_lock: Arc<Mutex<()>>,
    request: GenerationRequest,
    tx: mpsc::Sender<StreamEvent>,
) {
    let _guard = decode_lock.lock_owned().await;

    let mut fragments = match model.stream(request).await {
        Ok(fragments) => fragments,
        Err(e) => {
            error!(model = model.name(), error = %e, "decoding failed to start");
            let _ = tx.send(StreamEvent::Failed(as_generation_error(e))).await;
            return;
        }
    };

    let mut fragment_count = 0usize;
    while let Some(item) = fragments.next().await {
        match item {
            Ok(fragment) if fragment.is_empty() => {}
            Ok(fragment) => {
                fragment_count += 1;
                if tx.send(StreamEvent::Fragment(fragment)).await.is_err() {
                    debug!(fragment_count, "answer stream dropped, stopping decode");
                    return;
                }
            }
            Err(e) => {
                error!(model = model.name(), fragment_count, error = %e, "decoding failed");
                let _ = tx.send(StreamEvent::Failed(as_generation_error(e))).await;
                return;
            }
        }
    }

    info!(model = model.name(), fragment_count, "generation completed");
    let _ = tx.send(StreamEvent::Done).await;
}

fn as_generation_error(e: RagError) -> RagError {
    match e {
        RagError::Generation(_) => e,
        other => RagError::Generation(other.to_string()),
    }
}
