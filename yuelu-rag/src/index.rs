//! Exact inner-product vector index and its on-disk form.
//!
//! A [`VectorIndex`] pairs a row-major matrix of unit vectors with the
//! chunks they were computed from; row `i` always belongs to `chunks[i]`.
//! [`IndexStore`] persists the two halves as separate artifacts and refuses
//! to load them unless they agree with each other.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::EmbeddingConfig;
use crate::document::{Chunk, SearchResult};
use crate::embedding::{EmbeddingProvider, embed_in_batches, normalize_l2};
use crate::error::{RagError, Result};
use crate::retry::retry_with_backoff;

/// File name of the vector artifact.
pub const VECTORS_FILE: &str = "vectors.bin";

/// File name of the chunk metadata artifact.
pub const MANIFEST_FILE: &str = "chunks.json";

const MAGIC: &[u8; 4] = b"YLVI";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8 + 16;

/// Flat storage of equally sized vectors with exhaustive inner-product search.
#[derive(Debug, Clone, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    data: Vec<f32>,
}

impl FlatIndex {
    /// Create an empty index for vectors of `dimension`.
    pub fn new(dimension: usize) -> Self {
        Self { dimension, data: Vec::new() }
    }

    /// Dimension of every stored vector.
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Number of stored vectors.
    pub fn len(&self) -> usize {
        if self.dimension == 0 { 0 } else { self.data.len() / self.dimension }
    }

    /// Whether the index holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a vector as the next row.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::DimensionMismatch`] for a wrongly sized vector.
    pub fn add(&mut self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(RagError::DimensionMismatch {
                expected: self.dimension,
                actual: vector.len(),
            });
        }
        self.data.extend_from_slice(vector);
        Ok(())
    }

    /// The vector stored at row `i`.
    pub fn row(&self, i: usize) -> Option<&[f32]> {
        let start = i.checked_mul(self.dimension)?;
        self.data.get(start..start + self.dimension)
    }

    /// Rows of the `k` highest inner products with `query`, best first.
    ///
    /// Equal scores keep row order.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(usize, f32)> {
        if k == 0 || self.dimension == 0 || query.len() != self.dimension {
            return Vec::new();
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dimension)
            .map(|row| crate::embedding::dot(row, query))
            .enumerate()
            .collect();

        scored.sort_by(|a, b| b.1.total_cmp(&a.1));
        scored.truncate(k);
        scored
    }
}

/// Chunk metadata persisted next to the vectors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexManifest {
    /// Identifies the build both artifacts came from.
    pub build_id: Uuid,
    /// Embedding model the vectors were computed with.
    pub embedding_model: String,
    /// Vector dimension.
    pub dimension: usize,
    /// Chunks in row order.
    pub chunks: Vec<Chunk>,
}

/// Searchable vectors plus the chunks they map back to.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorIndex {
    build_id: Uuid,
    embedding_model: String,
    vectors: FlatIndex,
    chunks: Vec<Chunk>,
}

impl VectorIndex {
    /// Pair `vectors` with `chunks`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::IndexCorrupt`] if the vector count and chunk count differ.
    pub fn new(
        build_id: Uuid,
        embedding_model: impl Into<String>,
        vectors: FlatIndex,
        chunks: Vec<Chunk>,
    ) -> Result<Self> {
        if vectors.len() != chunks.len() {
            return Err(RagError::IndexCorrupt(format!(
                "{} vectors but {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        Ok(Self { build_id, embedding_model: embedding_model.into(), vectors, chunks })
    }

    /// An index with nothing in it, used before the first load.
    pub fn empty(dimension: usize) -> Self {
        Self {
            build_id: Uuid::nil(),
            embedding_model: String::new(),
            vectors: FlatIndex::new(dimension),
            chunks: Vec::new(),
        }
    }

    /// Identifier of the build that produced this index.
    pub fn build_id(&self) -> Uuid {
        self.build_id
    }

    /// Embedding model the vectors were computed with.
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    /// Vector dimension.
    pub fn dimension(&self) -> usize {
        self.vectors.dimension()
    }

    /// Number of indexed chunks.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Whether the index holds no chunks.
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Indexed chunks in row order.
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// The underlying vectors.
    pub fn vectors(&self) -> &FlatIndex {
        &self.vectors
    }

    /// The `k` chunks most similar to the (normalized) `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<SearchResult> {
        self.vectors
            .search(query, k)
            .into_iter()
            .filter_map(|(row, score)| {
                self.chunks.get(row).map(|chunk| SearchResult { chunk: chunk.clone(), score })
            })
            .collect()
    }
}

/// Embed `chunks`, normalize the vectors and assemble a [`VectorIndex`].
///
/// Each batch is retried with the configured backoff when the provider
/// reports a transient failure. Any remaining failure aborts the build.
#[instrument(skip_all, fields(chunk_count = chunks.len(), model = %config.model))]
pub async fn build_index(
    chunks: Vec<Chunk>,
    provider: &dyn EmbeddingProvider,
    config: &EmbeddingConfig,
) -> Result<VectorIndex> {
    let dimension = provider.dimensions();
    let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
    let batch_size = config.batch_size.max(1);
    let mut vectors = FlatIndex::new(dimension);

    for (batch_index, batch) in texts.chunks(batch_size).enumerate() {
        if batch_index > 0 && config.batch_delay_ms > 0 {
            tokio::time::sleep(config.batch_delay()).await;
        }
        let embeddings = retry_with_backoff(&config.retry, || {
            embed_in_batches(provider, batch, batch_size, std::time::Duration::ZERO)
        })
        .await?;

        for mut embedding in embeddings {
            normalize_l2(&mut embedding);
            vectors.add(&embedding)?;
        }
        debug!(batch_index, embedded = vectors.len(), "embedded batch");
    }

    let index = VectorIndex::new(Uuid::new_v4(), config.model.clone(), vectors, chunks)?;
    info!(chunk_count = index.len(), build_id = %index.build_id(), "built vector index");
    Ok(index)
}

/// Reads and writes the two index artifacts under one directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    dir: PathBuf,
}

impl IndexStore {
    /// Create a store rooted at `dir`. Nothing is touched until save or load.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The directory holding the artifacts.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the vector artifact.
    pub fn vectors_path(&self) -> PathBuf {
        self.dir.join(VECTORS_FILE)
    }

    /// Path of the chunk metadata artifact.
    pub fn manifest_path(&self) -> PathBuf {
        self.dir.join(MANIFEST_FILE)
    }

    /// Whether both artifacts are present.
    pub fn exists(&self) -> bool {
        self.vectors_path().is_file() && self.manifest_path().is_file()
    }

    /// Persist `index`.
    ///
    /// Both artifacts are first written to temporary siblings and only
    /// renamed into place once both writes succeeded. On failure the
    /// temporary files are removed and any previous artifacts stay intact,
    /// including when the second rename fails after the first one.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Io`] or [`RagError::Serialization`].
    #[instrument(skip_all, fields(dir = %self.dir.display(), chunk_count = index.len()))]
    pub fn save(&self, index: &VectorIndex) -> Result<()> {
        fs::create_dir_all(&self.dir).map_err(|e| RagError::io(&self.dir, e))?;

        let vectors_path = self.vectors_path();
        let manifest_path = self.manifest_path();
        let vectors_tmp = vectors_path.with_extension("bin.tmp");
        let manifest_tmp = manifest_path.with_extension("json.tmp");

        let saved = self
            .write_artifacts(index, &vectors_tmp, &manifest_tmp)
            .and_then(|()| self.swap_in(&vectors_tmp, &manifest_tmp));
        if let Err(e) = saved {
            let _ = fs::remove_file(&vectors_tmp);
            let _ = fs::remove_file(&manifest_tmp);
            return Err(e);
        }

        info!(build_id = %index.build_id(), "persisted vector index");
        Ok(())
    }

    /// Rename both temporaries into place. If the manifest cannot be moved,
    /// the previous `vectors.bin` is put back (or the new one removed when
    /// there was none), so the pair on disk always comes from one build.
    fn swap_in(&self, vectors_tmp: &Path, manifest_tmp: &Path) -> Result<()> {
        let vectors_path = self.vectors_path();
        let manifest_path = self.manifest_path();
        let backup = vectors_path.with_extension("bin.bak");

        let had_previous = vectors_path.is_file();
        if had_previous {
            let _ = fs::remove_file(&backup);
            fs::hard_link(&vectors_path, &backup)
                .or_else(|_| fs::copy(&vectors_path, &backup).map(|_| ()))
                .map_err(|e| RagError::io(&backup, e))?;
        }

        if let Err(e) = fs::rename(vectors_tmp, &vectors_path) {
            let _ = fs::remove_file(&backup);
            return Err(RagError::io(&vectors_path, e));
        }

        if let Err(e) = fs::rename(manifest_tmp, &manifest_path) {
            let restored = if had_previous {
                fs::rename(&backup, &vectors_path)
            } else {
                fs::remove_file(&vectors_path)
            };
            if let Err(restore) = restored {
                warn!(path = %vectors_path.display(), error = %restore, "could not roll back vector artifact");
            }
            return Err(RagError::io(&manifest_path, e));
        }

        if had_previous {
            let _ = fs::remove_file(&backup);
        }
        Ok(())
    }

    fn write_artifacts(&self, index: &VectorIndex, vectors_tmp: &Path, manifest_tmp: &Path) -> Result<()> {
        fs::write(vectors_tmp, encode_vectors(index)).map_err(|e| RagError::io(vectors_tmp, e))?;

        let manifest = IndexManifest {
            build_id: index.build_id(),
            embedding_model: index.embedding_model().to_string(),
            dimension: index.dimension(),
            chunks: index.chunks().to_vec(),
        };
        let json = serde_json::to_vec(&manifest)?;
        fs::write(manifest_tmp, json).map_err(|e| RagError::io(manifest_tmp, e))
    }

    /// Load both artifacts and check that they belong together.
    ///
    /// # Errors
    ///
    /// - [`RagError::IndexNotFound`] if either artifact is missing
    /// - [`RagError::IndexCorrupt`] if an artifact is malformed or the two
    ///   disagree on build, dimension or length
    #[instrument(skip_all, fields(dir = %self.dir.display()))]
    pub fn load(&self) -> Result<VectorIndex> {
        let vectors_path = self.vectors_path();
        let manifest_path = self.manifest_path();
        for path in [&vectors_path, &manifest_path] {
            if !path.is_file() {
                warn!(path = %path.display(), "index artifact missing");
                return Err(RagError::IndexNotFound { path: path.clone() });
            }
        }

        let bytes = fs::read(&vectors_path).map_err(|e| RagError::io(&vectors_path, e))?;
        let (build_id, vectors) = decode_vectors(&bytes)?;

        let json = fs::read(&manifest_path).map_err(|e| RagError::io(&manifest_path, e))?;
        let manifest: IndexManifest = serde_json::from_slice(&json)
            .map_err(|e| RagError::IndexCorrupt(format!("unreadable {MANIFEST_FILE}: {e}")))?;

        if manifest.build_id != build_id {
            return Err(RagError::IndexCorrupt(format!(
                "{VECTORS_FILE} is from build {build_id} but {MANIFEST_FILE} is from build {}",
                manifest.build_id
            )));
        }
        if manifest.dimension != vectors.dimension() {
            return Err(RagError::IndexCorrupt(format!(
                "{VECTORS_FILE} has dimension {} but {MANIFEST_FILE} says {}",
                vectors.dimension(),
                manifest.dimension
            )));
        }
        if manifest.chunks.iter().enumerate().any(|(row, chunk)| chunk.id != row) {
            return Err(RagError::IndexCorrupt("chunk ids are not in row order".to_string()));
        }

        let index =
            VectorIndex::new(build_id, manifest.embedding_model, vectors, manifest.chunks)?;
        info!(chunk_count = index.len(), build_id = %build_id, "loaded vector index");
        Ok(index)
    }
}

fn encode_vectors(index: &VectorIndex) -> Vec<u8> {
    let vectors = index.vectors();
    let mut bytes = Vec::with_capacity(HEADER_LEN + std::mem::size_of_val(vectors.data.as_slice()));
    bytes.extend_from_slice(MAGIC);
    bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&(vectors.dimension() as u32).to_le_bytes());
    bytes.extend_from_slice(&(vectors.len() as u64).to_le_bytes());
    bytes.extend_from_slice(index.build_id().as_bytes());
    for &value in &vectors.data {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

fn decode_vectors(bytes: &[u8]) -> Result<(Uuid, FlatIndex)> {
    let corrupt = |msg: &str| RagError::IndexCorrupt(format!("{VECTORS_FILE}: {msg}"));

    if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
        return Err(corrupt("missing header"));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(&format!("unsupported format version {version}")));
    }
    let dimension = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let count = u64::from_le_bytes(count_bytes);
    let mut id_bytes = [0u8; 16];
    id_bytes.copy_from_slice(&bytes[20..36]);
    let build_id = Uuid::from_bytes(id_bytes);

    let body = &bytes[HEADER_LEN..];
    let expected_len = usize::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(dimension))
        .and_then(|n| n.checked_mul(std::mem::size_of::<f32>()))
        .ok_or_else(|| corrupt("header overflows"))?;
    if body.len() != expected_len {
        return Err(corrupt(&format!("expected {expected_len} bytes of vectors, found {}", body.len())));
    }
    if dimension == 0 && count > 0 {
        return Err(corrupt("zero dimension"));
    }

    let mut data = Vec::with_capacity(body.len() / 4);
    for chunk in body.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !value.is_finite() {
            return Err(corrupt("non-finite value"));
        }
        data.push(value);
    }

    Ok((build_id, FlatIndex { dimension, data }))
}

/// The index currently used for retrieval.
///
/// Searches work on an `Arc` snapshot, so a rebuild never blocks or tears
/// an in-flight search; [`replace`](Self::replace) swaps the reference in
/// one step.
#[derive(Debug)]
pub struct SharedIndex {
    current: RwLock<Arc<VectorIndex>>,
}

impl SharedIndex {
    /// Start with `index` as the active index.
    pub fn new(index: VectorIndex) -> Self {
        Self { current: RwLock::new(Arc::new(index)) }
    }

    /// The active index.
    pub async fn snapshot(&self) -> Arc<VectorIndex> {
        Arc::clone(&*self.current.read().await)
    }

    /// Make `index` the active index.
    pub async fn replace(&self, index: VectorIndex) {
        let mut current = self.current.write().await;
        *current = Arc::new(index);
    }
}
