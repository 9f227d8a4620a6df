//! Corpus loading and chunking.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::chunking::Chunker;
use crate::document::{Chunk, Document};
use crate::error::{RagError, Result};

/// List the documents with `extension` directly under `dir`, sorted by path.
///
/// # Errors
///
/// Returns [`RagError::Io`] if `dir` does not exist or cannot be read.
pub fn discover_documents(dir: impl AsRef<Path>, extension: &str) -> Result<Vec<PathBuf>> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        let source = std::io::Error::new(std::io::ErrorKind::NotFound, "corpus directory not found");
        return Err(RagError::io(dir, source));
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(dir).to_path_buf();
            let source = e.into_io_error().unwrap_or_else(|| std::io::Error::other("walk failed"));
            RagError::io(path, source)
        })?;
        if entry.file_type().is_file()
            && entry.path().extension().is_some_and(|ext| ext == extension)
        {
            files.push(entry.into_path());
        }
    }

    files.sort();
    Ok(files)
}

/// Loads documents from a corpus directory and cuts them into [`Chunk`]s.
///
/// Ingestion is deterministic: the same directory contents and chunker
/// settings always produce the same chunks in the same order.
pub struct CorpusIngestor {
    extension: String,
    chunker: Arc<dyn Chunker>,
}

impl CorpusIngestor {
    /// Create an ingestor reading files with `extension` (without the dot).
    pub fn new(extension: impl Into<String>, chunker: Arc<dyn Chunker>) -> Self {
        Self { extension: extension.into(), chunker }
    }

    /// Read every matching document in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`RagError::Io`] if the directory or any file cannot be read,
    /// including files that are not valid UTF-8.
    pub fn load_documents(&self, dir: impl AsRef<Path>) -> Result<Vec<Document>> {
        discover_documents(dir, &self.extension)?
            .into_iter()
            .map(|path| {
                let text = fs::read_to_string(&path).map_err(|e| RagError::io(&path, e))?;
                let id = path
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().into_owned())
                    .unwrap_or_default();
                Ok(Document { id, text, source: path })
            })
            .collect()
    }

    /// Split documents into chunks numbered by their position in the corpus.
    pub fn chunk_documents(&self, documents: &[Document]) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for document in documents {
            for (chunk_index, text) in self.chunker.split(&document.text).into_iter().enumerate() {
                chunks.push(Chunk {
                    id: chunks.len(),
                    text,
                    source: document.source.clone(),
                    chunk_index,
                });
            }
        }
        chunks
    }

    /// Load and chunk the whole corpus in `dir`.
    ///
    /// # Errors
    ///
    /// See [`load_documents`](Self::load_documents).
    pub fn ingest(&self, dir: impl AsRef<Path>) -> Result<Vec<Chunk>> {
        let dir = dir.as_ref();
        let documents = self.load_documents(dir)?;
        let chunks = self.chunk_documents(&documents);

        if chunks.is_empty() {
            warn!(corpus = %dir.display(), extension = %self.extension, "corpus produced no chunks");
        }
        info!(
            corpus = %dir.display(),
            document_count = documents.len(),
            chunk_count = chunks.len(),
            "ingested corpus"
        );
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::RecursiveChunker;

    fn ingestor(size: usize, overlap: usize) -> CorpusIngestor {
        CorpusIngestor::new("md", Arc::new(RecursiveChunker::new(size, overlap)))
    }

    #[test]
    fn discovers_only_top_level_files_with_the_extension() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("nested")).unwrap();
        fs::write(root.join("b.md"), "b").unwrap();
        fs::write(root.join("a.md"), "a").unwrap();
        fs::write(root.join("notes.txt"), "ignore").unwrap();
        fs::write(root.join("nested/c.md"), "ignore").unwrap();

        let files = discover_documents(root, "md").unwrap();
        let names: Vec<_> = files.iter().filter_map(|p| p.file_name()).collect();
        assert_eq!(names, vec!["a.md", "b.md"]);
    }

    #[test]
    fn missing_directory_is_an_io_error() {
        let temp = tempfile::tempdir().unwrap();
        let result = discover_documents(temp.path().join("absent"), "md");
        assert!(matches!(result, Err(RagError::Io { .. })));
    }

    #[test]
    fn chunk_ids_run_across_documents() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("a.md"), "a".repeat(25)).unwrap();
        fs::write(temp.path().join("b.md"), "short").unwrap();

        let chunks = ingestor(10, 2).ingest(temp.path()).unwrap();

        let ids: Vec<_> = chunks.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(chunks[2].chunk_index, 2);
        assert_eq!(chunks[3].chunk_index, 0);
        assert!(chunks[3].source.ends_with("b.md"));
        assert_eq!(chunks[3].text, "short");
    }

    #[test]
    fn ingestion_is_deterministic() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("sky.md"), "The sky is blue. The grass is green.").unwrap();
        fs::write(temp.path().join("lake.md"), "The lake is calm.\n\nThe hills are steep.").unwrap();

        let ingestor = ingestor(20, 5);
        assert_eq!(ingestor.ingest(temp.path()).unwrap(), ingestor.ingest(temp.path()).unwrap());
    }

    #[test]
    fn invalid_utf8_names_the_file() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("bad.md"), [0xff, 0xfe, 0x00]).unwrap();

        let err = ingestor(10, 2).ingest(temp.path()).unwrap_err();
        assert!(err.to_string().contains("bad.md"));
    }
}
