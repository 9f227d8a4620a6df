//! The assembled agent: index lifecycle, retrieval, generation and chat.
//!
//! [`RagService`] owns everything a question needs and replaces process-wide
//! state with one explicit context object. Construct it with
//! [`RagService::builder()`], then either call
//! [`ensure_ready`](RagService::ensure_ready) up front or let the first query
//! do it.
//!
//! # Example
//!
//! ```rust,ignore
//! use yuelu_rag::{RagConfig, RagService};
//!
//! let service = RagService::builder()
//!     .config(RagConfig::default())
//!     .embedding_provider(Arc::new(embedder))
//!     .language_model(Arc::new(model))
//!     .build()?;
//!
//! let mut turns = Box::pin(service.ask("岳麓书院建于哪一年？", Vec::new()));
//! while let Some(snapshot) = turns.next().await {
//!     render(&snapshot);
//! }
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_stream::stream;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::chunking::{Chunker, RecursiveChunker};
use crate::config::RagConfig;
use crate::document::SearchResult;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::generator::{AnswerStream, Generator};
use crate::index::{IndexStore, SharedIndex, VectorIndex, build_index};
use crate::ingest::CorpusIngestor;
use crate::model::LanguageModel;
use crate::retriever::Retriever;

/// Where a chat turn's answer stands.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum TurnStatus {
    /// Fragments are still arriving.
    Streaming,
    /// The answer finished normally.
    Complete,
    /// The answer stopped early; the text so far is kept.
    Failed(String),
}

/// One exchange in a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    /// The user's message.
    pub user: String,
    /// The answer as far as it has been generated.
    pub assistant: String,
    /// Whether the answer is still streaming, finished or cut short.
    pub status: TurnStatus,
}

impl ChatTurn {
    /// A finished exchange, for seeding history.
    pub fn complete(user: impl Into<String>, assistant: impl Into<String>) -> Self {
        Self { user: user.into(), assistant: assistant.into(), status: TurnStatus::Complete }
    }

    fn pending(user: &str) -> Self {
        Self { user: user.to_string(), assistant: String::new(), status: TurnStatus::Streaming }
    }
}

/// The retrieval-augmented chat agent.
pub struct RagService {
    config: RagConfig,
    provider: Arc<dyn EmbeddingProvider>,
    ingestor: CorpusIngestor,
    store: IndexStore,
    index: Arc<SharedIndex>,
    generator: Generator,
    /// Set once an index is active; checked without locking.
    ready: AtomicBool,
    /// Serializes index loads and builds. Queries never take it once ready.
    build_lock: Mutex<()>,
}

impl RagService {
    /// Create a new [`RagServiceBuilder`].
    pub fn builder() -> RagServiceBuilder {
        RagServiceBuilder::default()
    }

    /// The service configuration.
    pub fn config(&self) -> &RagConfig {
        &self.config
    }

    /// The artifact store backing the index.
    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// The retriever used for grounding.
    pub fn retriever(&self) -> &Retriever {
        self.generator.retriever()
    }

    /// Whether an index has been loaded or built.
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// The active index. Empty until [`ensure_ready`](Self::ensure_ready) ran.
    pub async fn index(&self) -> Arc<VectorIndex> {
        self.index.snapshot().await
    }

    /// Make sure an index is active.
    ///
    /// Loads the persisted artifacts when both exist, otherwise builds an
    /// index from the corpus directory and persists it. Calling it again is
    /// a no-op; concurrent callers wait for the first one, so at most one
    /// build runs.
    ///
    /// # Errors
    ///
    /// Propagates corpus, embedding and persistence errors. A persisted
    /// index that does not match the embedding provider's dimension is
    /// reported as [`RagError::DimensionMismatch`]; run
    /// [`rebuild`](Self::rebuild) to replace it.
    #[instrument(skip(self), fields(vector_dir = %self.store.dir().display()))]
    pub async fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            return Ok(());
        }
        let _build = self.build_lock.lock().await;
        if self.is_ready() {
            return Ok(());
        }

        let index = if self.store.exists() {
            let index = self.store.load()?;
            if index.embedding_model() != self.config.embedding.model {
                warn!(
                    index_model = index.embedding_model(),
                    configured_model = %self.config.embedding.model,
                    "persisted index was built with another embedding model"
                );
            }
            index
        } else {
            info!("no persisted index found, building from corpus");
            self.build_and_persist().await?
        };
        self.check_dimension(&index)?;

        self.index.replace(index).await;
        self.ready.store(true, Ordering::Release);
        Ok(())
    }

    /// Build a fresh index from the corpus, persist it and make it active.
    ///
    /// Queries arriving meanwhile keep using the previous index; only the
    /// final swap excludes them. Concurrent rebuilds run one after another.
    ///
    /// # Errors
    ///
    /// On failure the previous index stays active and on disk.
    #[instrument(skip(self), fields(corpus = %self.config.corpus_dir.display()))]
    pub async fn rebuild(&self) -> Result<Uuid> {
        let _build = self.build_lock.lock().await;
        let index = self.build_and_persist().await?;
        let build_id = index.build_id();
        self.index.replace(index).await;
        self.ready.store(true, Ordering::Release);
        Ok(build_id)
    }

    async fn build_and_persist(&self) -> Result<VectorIndex> {
        let chunks = self.ingestor.ingest(&self.config.corpus_dir)?;
        let index = build_index(chunks, self.provider.as_ref(), &self.config.embedding)
            .await
            .inspect_err(|e| error!(error = %e, "index build failed"))?;
        self.store.save(&index)?;
        Ok(index)
    }

    fn check_dimension(&self, index: &VectorIndex) -> Result<()> {
        let expected = self.provider.dimensions();
        if index.dimension() != expected {
            warn!(
                index_dimension = index.dimension(),
                provider_dimension = expected,
                "persisted index was built with another embedding dimension"
            );
            return Err(RagError::DimensionMismatch { expected, actual: index.dimension() });
        }
        Ok(())
    }

    /// Return up to `k` chunks most similar to `query`.
    ///
    /// # Errors
    ///
    /// See [`ensure_ready`](Self::ensure_ready) and [`Retriever::retrieve`].
    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<SearchResult>> {
        self.ensure_ready().await?;
        self.retriever().retrieve(query, k).await
    }

    /// Answer `query` as a stream of text fragments.
    ///
    /// # Errors
    ///
    /// See [`ensure_ready`](Self::ensure_ready) and [`Generator::generate`].
    pub async fn generate(&self, query: &str) -> Result<AnswerStream> {
        self.ensure_ready().await?;
        self.generator.generate(query).await
    }

    /// Answer `message` in the context of a conversation.
    ///
    /// Yields the whole conversation after every change: first with the new
    /// turn appended and an empty answer, then once per decoded fragment,
    /// and finally with the turn marked [`TurnStatus::Complete`] or
    /// [`TurnStatus::Failed`]. A blank message yields `history` unchanged,
    /// once.
    ///
    /// `history` is carried along for display; answers are grounded on the
    /// current message only.
    pub fn ask<'a>(
        &'a self,
        message: &'a str,
        history: Vec<ChatTurn>,
    ) -> impl Stream<Item = Vec<ChatTurn>> + Send + 'a {
        stream! {
            let mut turns = history;
            if message.trim().is_empty() {
                yield turns;
                return;
            }

            let at = turns.len();
            turns.push(ChatTurn::pending(message));
            yield turns.clone();

            match self.generate(message).await {
                Ok(mut answer) => {
                    while let Some(item) = answer.next().await {
                        match item {
                            Ok(fragment) => {
                                turns[at].assistant.push_str(&fragment);
                                yield turns.clone();
                            }
                            Err(e) => {
                                turns[at].status = TurnStatus::Failed(e.to_string());
                                break;
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(error = %e, "could not answer message");
                    turns[at].status = TurnStatus::Failed(e.to_string());
                }
            }

            if turns[at].status == TurnStatus::Streaming {
                turns[at].status = TurnStatus::Complete;
            }
            yield turns;
        }
    }
}

/// Builder for constructing a [`RagService`].
///
/// The embedding provider and the language model are required. Without an
/// explicit configuration [`RagConfig::default()`] is used; without an
/// explicit chunker a [`RecursiveChunker`] sized from the configuration is.
#[derive(Default)]
pub struct RagServiceBuilder {
    config: Option<RagConfig>,
    embedding_provider: Option<Arc<dyn EmbeddingProvider>>,
    language_model: Option<Arc<dyn LanguageModel>>,
    chunker: Option<Arc<dyn Chunker>>,
}

impl RagServiceBuilder {
    /// Set the configuration.
    pub fn config(mut self, config: RagConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the embedding provider.
    pub fn embedding_provider(mut self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        self.embedding_provider = Some(provider);
        self
    }

    /// Set the language model.
    pub fn language_model(mut self, model: Arc<dyn LanguageModel>) -> Self {
        self.language_model = Some(model);
        self
    }

    /// Override the chunker.
    pub fn chunker(mut self, chunker: Arc<dyn Chunker>) -> Self {
        self.chunker = Some(chunker);
        self
    }

    /// Build the [`RagService`].
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Config`] if a required part is missing, the
    /// configuration is invalid or the provider's dimension differs from
    /// the configured one.
    pub fn build(self) -> Result<RagService> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let provider = self
            .embedding_provider
            .ok_or_else(|| RagError::Config("embedding_provider is required".to_string()))?;
        let model = self
            .language_model
            .ok_or_else(|| RagError::Config("language_model is required".to_string()))?;

        if provider.dimensions() != config.embedding.dimensions {
            return Err(RagError::Config(format!(
                "embedding provider '{}' produces {} dimensions but {} are configured",
                provider.name(),
                provider.dimensions(),
                config.embedding.dimensions
            )));
        }

        let chunker = self
            .chunker
            .unwrap_or_else(|| Arc::new(RecursiveChunker::new(config.chunk_size, config.chunk_overlap)));
        let ingestor = CorpusIngestor::new(config.file_extension.clone(), chunker);
        let store = IndexStore::new(config.vector_dir.clone());
        let index = Arc::new(SharedIndex::new(VectorIndex::empty(provider.dimensions())));
        let retriever = Retriever::new(Arc::clone(&provider), Arc::clone(&index), config.top_k);
        let generator = Generator::new(retriever, model, &config.generation);

        Ok(RagService {
            config,
            provider,
            ingestor,
            store,
            index,
            generator,
            ready: AtomicBool::new(false),
            build_lock: Mutex::new(()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use futures::stream;
    use tempfile::TempDir;

    use super::*;
    use crate::model::{FragmentStream, GenerationRequest};

    /// One dimension per keyword.
    struct Keywords {
        calls: AtomicUsize,
    }

    const VOCAB: [&str; 4] = ["sky", "blue", "grass", "green"];

    #[async_trait]
    impl EmbeddingProvider for Keywords {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let lower = text.to_lowercase();
            Ok(VOCAB.iter().map(|w| if lower.contains(w) { 1.0 } else { 0.0 }).collect())
        }

        fn dimensions(&self) -> usize {
            VOCAB.len()
        }
    }

    struct Echo {
        fail: bool,
    }

    #[async_trait]
    impl LanguageModel for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn stream(&self, request: GenerationRequest) -> Result<FragmentStream> {
            let mut items = vec![Ok("Answer: ".to_string()), Ok(request.query)];
            if self.fail {
                items.push(Err(RagError::Generation("device lost".into())));
            }
            Ok(Box::pin(stream::iter(items)))
        }
    }

    fn service(dir: &TempDir, fail: bool) -> RagService {
        let corpus = dir.path().join("data");
        std::fs::create_dir_all(&corpus).unwrap();
        std::fs::write(corpus.join("sky.md"), "The sky is blue.").unwrap();
        std::fs::write(corpus.join("grass.md"), "The grass is green.").unwrap();

        let config = RagConfig::builder()
            .corpus_dir(corpus)
            .vector_dir(dir.path().join("vector_store"))
            .embedding_dimensions(VOCAB.len())
            .embedding_batch_delay(std::time::Duration::ZERO)
            .build()
            .unwrap();
        RagService::builder()
            .config(config)
            .embedding_provider(Arc::new(Keywords { calls: AtomicUsize::new(0) }))
            .language_model(Arc::new(Echo { fail }))
            .build()
            .unwrap()
    }

    #[test]
    fn builder_requires_provider_and_model() {
        let err = RagService::builder().build().err().unwrap();
        assert!(matches!(err, RagError::Config(msg) if msg.contains("embedding_provider")));

        let err = RagService::builder()
            .embedding_provider(Arc::new(Keywords { calls: AtomicUsize::new(0) }))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn builder_rejects_dimension_disagreement() {
        let err = RagService::builder()
            .embedding_provider(Arc::new(Keywords { calls: AtomicUsize::new(0) }))
            .language_model(Arc::new(Echo { fail: false }))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RagError::Config(msg) if msg.contains("1024")));
    }

    #[tokio::test]
    async fn ensure_ready_builds_once_then_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, false);
        assert!(!service.is_ready());
        assert!(!service.store().exists());

        service.ensure_ready().await.unwrap();
        assert!(service.store().exists());
        let first = service.index().await.build_id();

        service.ensure_ready().await.unwrap();
        assert_eq!(service.index().await.build_id(), first);
        assert_eq!(service.index().await.len(), 2);
    }

    #[tokio::test]
    async fn rebuild_swaps_in_a_new_build() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, false);
        service.ensure_ready().await.unwrap();
        let before = service.index().await.build_id();

        let after = service.rebuild().await.unwrap();
        assert_ne!(before, after);
        assert_eq!(service.index().await.build_id(), after);
        assert_eq!(service.store().load().unwrap().build_id(), after);
    }

    #[tokio::test]
    async fn ask_streams_snapshots_and_completes() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, false);
        let history = vec![ChatTurn::complete("hi", "hello")];

        let snapshots: Vec<Vec<ChatTurn>> = service.ask("sky?", history).collect().await;

        assert_eq!(snapshots.len(), 4);
        assert_eq!(snapshots[0][1].assistant, "");
        assert_eq!(snapshots[1][1].assistant, "Answer: ");
        assert_eq!(snapshots[2][1].assistant, "Answer: sky?");
        let last = snapshots.last().unwrap();
        assert_eq!(last.len(), 2);
        assert_eq!(last[0], ChatTurn::complete("hi", "hello"));
        assert_eq!(last[1].status, TurnStatus::Complete);
    }

    #[tokio::test]
    async fn ask_keeps_partial_text_on_failure() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, true);

        let snapshots: Vec<Vec<ChatTurn>> = service.ask("sky?", Vec::new()).collect().await;
        let last = &snapshots.last().unwrap()[0];
        assert_eq!(last.assistant, "Answer: sky?");
        assert!(matches!(&last.status, TurnStatus::Failed(msg) if msg.contains("device lost")));
    }

    #[tokio::test]
    async fn blank_messages_return_history_untouched() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, false);
        let history = vec![ChatTurn::complete("hi", "hello")];

        let snapshots: Vec<Vec<ChatTurn>> = service.ask("   ", history.clone()).collect().await;
        assert_eq!(snapshots, vec![history]);
        assert!(!service.is_ready());
    }

    #[tokio::test]
    async fn missing_corpus_fails_the_turn() {
        let dir = TempDir::new().unwrap();
        let service = service(&dir, false);
        std::fs::remove_dir_all(dir.path().join("data")).unwrap();

        let snapshots: Vec<Vec<ChatTurn>> = service.ask("sky?", Vec::new()).collect().await;
        assert_eq!(snapshots.len(), 2);
        assert!(matches!(snapshots[1][0].status, TurnStatus::Failed(_)));
    }

    #[test]
    fn turn_status_serializes_with_a_tag() {
        let json = serde_json::to_value(TurnStatus::Failed("boom".into())).unwrap();
        assert_eq!(json, serde_json::json!({ "state": "failed", "message": "boom" }));
    }
}
