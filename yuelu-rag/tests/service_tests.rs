//! End-to-end behavior of the RAG service with deterministic fakes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt, stream};
use tempfile::TempDir;
use tokio::sync::Notify;
use yuelu_rag::{
    EmbeddingProvider, FragmentStream, GenerationRequest, IndexStore, LanguageModel, RagConfig,
    RagService, Result, TurnStatus,
};

const VOCAB: [&str; 6] = ["sky", "blue", "grass", "green", "color", "academy"];

/// Bag-of-keywords embedder: one dimension per vocabulary word.
#[derive(Default)]
struct KeywordEmbedder {
    calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = text.to_lowercase();
        Ok(VOCAB.iter().map(|w| lower.matches(w).count() as f32).collect())
    }

    fn dimensions(&self) -> usize {
        VOCAB.len()
    }

    fn name(&self) -> &str {
        "keywords"
    }
}

/// Keyword embedder whose next corpus batch can be held open.
#[derive(Default)]
struct GatedEmbedder {
    keywords: KeywordEmbedder,
    hold_next_batch: AtomicBool,
    batch_started: Notify,
    release_batch: Notify,
}

#[async_trait]
impl EmbeddingProvider for GatedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.keywords.embed(text).await
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if self.hold_next_batch.swap(false, Ordering::SeqCst) {
            self.batch_started.notify_one();
            self.release_batch.notified().await;
        }
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            vectors.push(self.keywords.embed(text).await?);
        }
        Ok(vectors)
    }

    fn dimensions(&self) -> usize {
        VOCAB.len()
    }
}

/// Answers with a fixed sentence, whatever the context.
struct FixedModel;

#[async_trait]
impl LanguageModel for FixedModel {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn stream(&self, _request: GenerationRequest) -> Result<FragmentStream> {
        let fragments = ["I ", "am ", "not ", "sure."].map(|f| Ok(f.to_string()));
        Ok(Box::pin(stream::iter(fragments)))
    }
}

struct Fixture {
    dir: TempDir,
    embedder: Arc<KeywordEmbedder>,
}

impl Fixture {
    fn new(documents: &[(&str, &str)]) -> Self {
        let dir = TempDir::new().unwrap();
        let corpus = dir.path().join("data");
        std::fs::create_dir_all(&corpus).unwrap();
        for (name, text) in documents {
            std::fs::write(corpus.join(name), text).unwrap();
        }
        Self { dir, embedder: Arc::new(KeywordEmbedder::default()) }
    }

    fn config(&self) -> RagConfig {
        RagConfig::builder()
            .corpus_dir(self.dir.path().join("data"))
            .vector_dir(self.dir.path().join("vector_store"))
            .embedding_dimensions(VOCAB.len())
            .embedding_batch_delay(Duration::ZERO)
            .build()
            .unwrap()
    }

    fn service(&self) -> RagService {
        RagService::builder()
            .config(self.config())
            .embedding_provider(self.embedder.clone())
            .language_model(Arc::new(FixedModel))
            .build()
            .unwrap()
    }

    fn store(&self) -> IndexStore {
        IndexStore::new(self.dir.path().join("vector_store"))
    }
}

fn sky_and_grass() -> Fixture {
    Fixture::new(&[("sky.md", "The sky is blue."), ("grass.md", "The grass is green.")])
}

#[tokio::test]
async fn sky_question_retrieves_the_sky_chunk_first() {
    let fixture = sky_and_grass();
    let service = fixture.service();

    let results = service.retrieve("What color is the sky?", 3).await.unwrap();
    assert_eq!(results[0].chunk.text, "The sky is blue.");
    assert!(results[0].score > results[1].score);
}

#[tokio::test]
async fn asking_for_more_results_than_chunks_returns_every_chunk() {
    let fixture = sky_and_grass();
    let service = fixture.service();

    let results = service.retrieve("sky", 5).await.unwrap();
    assert_eq!(results.len(), 2);
}

#[tokio::test]
async fn missing_artifacts_are_built_before_the_first_query() {
    let fixture = sky_and_grass();
    assert!(!fixture.store().exists());

    let service = fixture.service();
    service.retrieve("sky", 1).await.unwrap();

    assert!(fixture.store().exists());
    let index = fixture.store().load().unwrap();
    assert_eq!(index.chunks().len(), index.vectors().len());
    assert_eq!(index.len(), 2);
}

#[tokio::test]
async fn persisted_index_is_reused_without_re_embedding_the_corpus() {
    let fixture = sky_and_grass();
    fixture.service().ensure_ready().await.unwrap();
    let build_id = fixture.store().load().unwrap().build_id();
    let calls_after_build = fixture.embedder.calls.load(Ordering::SeqCst);

    let service = fixture.service();
    service.ensure_ready().await.unwrap();

    assert_eq!(service.index().await.build_id(), build_id);
    assert_eq!(fixture.embedder.calls.load(Ordering::SeqCst), calls_after_build);
}

#[tokio::test]
async fn concurrent_first_queries_build_only_once() {
    let fixture = sky_and_grass();
    let service = Arc::new(fixture.service());

    let results = futures::future::join_all((0..4).map(|_| {
        let service = Arc::clone(&service);
        async move { service.retrieve("sky", 1).await }
    }))
    .await;

    assert!(results.iter().all(|r| r.is_ok()));
    // Two corpus chunks plus one embedding per query.
    assert_eq!(fixture.embedder.calls.load(Ordering::SeqCst), 2 + 4);
}

#[tokio::test]
async fn stored_vectors_are_unit_length() {
    let fixture = Fixture::new(&[("sky.md", "sky sky blue"), ("academy.md", "The academy.")]);
    fixture.service().ensure_ready().await.unwrap();

    let index = fixture.store().load().unwrap();
    for row in 0..index.len() {
        let norm: f32 = index.vectors().row(row).unwrap().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5, "row {row} has norm {norm}");
    }
}

#[tokio::test]
async fn empty_retrieval_still_produces_an_answer() {
    let fixture = Fixture::new(&[]);
    let service = fixture.service();

    let answer = service.generate("Who founded the academy?").await.unwrap();
    assert!(answer.sources().is_empty());
    let text: String = answer.try_collect::<Vec<_>>().await.unwrap().concat();
    assert_eq!(text, "I am not sure.");
}

#[tokio::test]
async fn chat_turn_completes_with_the_full_answer() {
    let fixture = sky_and_grass();
    let service = fixture.service();

    let snapshots: Vec<_> = service.ask("What color is the sky?", Vec::new()).collect().await;
    let last = snapshots.last().unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].user, "What color is the sky?");
    assert_eq!(last[0].assistant, "I am not sure.");
    assert_eq!(last[0].status, TurnStatus::Complete);

    for pair in snapshots.windows(2) {
        assert!(pair[1][0].assistant.starts_with(&pair[0][0].assistant));
    }
}

#[tokio::test]
async fn queries_are_served_from_the_old_index_while_rebuilding() {
    let fixture = sky_and_grass();
    let embedder = Arc::new(GatedEmbedder::default());
    let service = Arc::new(
        RagService::builder()
            .config(fixture.config())
            .embedding_provider(embedder.clone())
            .language_model(Arc::new(FixedModel))
            .build()
            .unwrap(),
    );
    service.ensure_ready().await.unwrap();
    let old_build = service.index().await.build_id();

    embedder.hold_next_batch.store(true, Ordering::SeqCst);
    let rebuild = tokio::spawn({
        let service = Arc::clone(&service);
        async move { service.rebuild().await }
    });
    embedder.batch_started.notified().await;

    let results = tokio::time::timeout(Duration::from_secs(5), service.retrieve("sky", 1))
        .await
        .expect("retrieval waited for the rebuild")
        .unwrap();
    assert_eq!(results[0].chunk.text, "The sky is blue.");
    assert_eq!(service.index().await.build_id(), old_build);

    embedder.release_batch.notify_one();
    let new_build = rebuild.await.unwrap().unwrap();
    assert_ne!(new_build, old_build);
    assert_eq!(service.index().await.build_id(), new_build);
}
