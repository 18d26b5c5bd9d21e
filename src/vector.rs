use std::fs;
use std::path::Path;
use std::sync::Arc;

use arroy::distances::DotProduct;
use arroy::{Database, Reader, Writer};
use heed::EnvOpenOptions;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::config::storage::ChunkStore;
use crate::embed::TextEmbedder;
use crate::error::CoreError;
use crate::retrieval::{rank_hits, DocumentRetriever, RetrievedChunk};

const INDEX_MAP_SIZE: usize = 1024 * 1024 * 1024;
const ARROY_INDEX: u16 = 0;

/// A chunk of text to be embedded and indexed.
#[derive(Debug, Clone)]
pub struct DocumentSource {
    pub source: String,
    pub chunk_number: i32,
    pub content: String,
    pub metadata: serde_json::Value,
}

/// An `arroy` index in an LMDB environment, plus the chunk texts behind it.
pub struct VectorStore {
    env: heed::Env,
    db: Database<DotProduct>,
    chunks: ChunkStore,
    embedder: Arc<dyn TextEmbedder>,
}

impl VectorStore {
    /// Opens an index that has already been built.
    pub fn open(
        index_dir: &Path,
        chunk_db: &Path,
        embedder: Arc<dyn TextEmbedder>,
    ) -> Result<Self, CoreError> {
        if !index_dir.join("data.mdb").is_file() {
            return Err(CoreError::IndexUnavailable(format!(
                "no vector index at {}",
                index_dir.display()
            )));
        }
        let chunks = ChunkStore::open(chunk_db)?;
        let env = unsafe { EnvOpenOptions::new().map_size(INDEX_MAP_SIZE).open(index_dir)? };
        let rtxn = env.read_txn()?;
        let db: Database<DotProduct> = env.open_database(&rtxn, None)?.ok_or_else(|| {
            CoreError::IndexUnavailable(format!("vector index at {} is empty", index_dir.display()))
        })?;
        drop(rtxn);
        info!("Opened vector index at {}", index_dir.display());
        Ok(Self {
            env,
            db,
            chunks,
            embedder,
        })
    }

    /// Creates (or reopens for writing) an index and its chunk table.
    pub fn create(
        index_dir: &Path,
        chunk_db: &Path,
        embedder: Arc<dyn TextEmbedder>,
    ) -> Result<Self, CoreError> {
        fs::create_dir_all(index_dir)?;
        let chunks = ChunkStore::create(chunk_db)?;
        let env = unsafe { EnvOpenOptions::new().map_size(INDEX_MAP_SIZE).open(index_dir)? };
        let mut wtxn = env.write_txn()?;
        let db: Database<DotProduct> = env.create_database(&mut wtxn, None)?;
        wtxn.commit()?;
        Ok(Self {
            env,
            db,
            chunks,
            embedder,
        })
    }

    pub fn chunks(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Embeds `documents`, stores their text and rebuilds the tree.
    pub fn add_documents_and_build(&self, documents: Vec<DocumentSource>) -> Result<usize, CoreError> {
        let contents: Vec<String> = documents.iter().map(|d| d.content.clone()).collect();
        let embeddings = self.embedder.embed(&contents)?;
        let dimensions = self.embedder.dimensions();

        let mut wtxn = self.env.write_txn()?;
        let writer = Writer::<DotProduct>::new(self.db, ARROY_INDEX, dimensions);

        for (i, doc) in documents.iter().enumerate() {
            let vector = embeddings.get(i).ok_or_else(|| {
                CoreError::Retrieval(format!("Missing embedding for document {}", i))
            })?;
            if vector.len() != dimensions {
                return Err(CoreError::Retrieval(format!(
                    "Embedding for document {} has {} dimensions, expected {}",
                    i,
                    vector.len(),
                    dimensions
                )));
            }
            let id = self
                .chunks
                .insert_chunk(&doc.source, doc.chunk_number, &doc.content, &doc.metadata)?;
            let item = u32::try_from(id)
                .map_err(|_| CoreError::Retrieval(format!("Chunk id {} does not fit the index", id)))?;
            writer.add_item(&mut wtxn, item, vector)?;
        }

        let mut rng = StdRng::seed_from_u64(42);
        writer.builder(&mut rng).build(&mut wtxn)?;
        wtxn.commit()?;

        info!("Indexed {} chunks", documents.len());
        Ok(documents.len())
    }
}

impl DocumentRetriever for VectorStore {
    fn retrieve(&self, query: &str, k: usize) -> Result<Vec<RetrievedChunk>, CoreError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let embeddings = self
            .embedder
            .embed(&[query.to_string()])
            .map_err(|e| CoreError::Retrieval(format!("Failed to embed query: {}", e)))?;
        let query_vector = embeddings.first().ok_or_else(|| {
            CoreError::Retrieval("Failed to generate embedding for query".to_string())
        })?;

        let rtxn = self.env.read_txn()?;
        let reader = Reader::<DotProduct>::open(&rtxn, ARROY_INDEX, self.db)
            .map_err(|e| CoreError::IndexUnavailable(format!("index has not been built: {}", e)))?;
        let hits = reader.nns(k).by_vector(&rtxn, query_vector)?;
        let ids: Vec<i64> = hits.into_iter().map(|(id, _)| id as i64).collect();
        debug!("Nearest chunk ids: {:?}", ids);

        let chunks = self.chunks.get_chunks_by_ids(&ids)?;
        Ok(rank_hits(
            chunks.into_iter().map(|c| (c.content, Some(c.source))),
            k,
        ))
    }
}
