//! Exact nearest-neighbour index over chunk embeddings, persisted as JSON.
//!
//! The index is built once per corpus version and loaded read-only by the
//! serving path. Similarity is cosine; results are ordered best first, with
//! ties kept in insertion order.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::embedder::{embed_chunks, Embedder};
use crate::error::{AdvisorError, AdvisorResult};
use crate::models::{Chunk, EmbeddedChunk, ScoredChunk};

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorIndex {
    model: String,
    dimension: usize,
    entries: Vec<EmbeddedChunk>,
}

impl VectorIndex {
    pub fn from_embedded(model: &str, entries: Vec<EmbeddedChunk>) -> AdvisorResult<Self> {
        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(AdvisorError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.len(),
            });
        }
        Ok(Self {
            model: model.to_string(),
            dimension,
            entries,
        })
    }

    /// Embeds every chunk and builds the index.
    pub async fn build(embedder: &dyn Embedder, chunks: &[Chunk]) -> AdvisorResult<Self> {
        tracing::info!("Embedding {} chunks with {}...", chunks.len(), embedder.model());
        let embedded = embed_chunks(embedder, chunks).await?;
        Self::from_embedded(embedder.model(), embedded)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Top `k` chunks by cosine similarity to `query`, best first.
    pub fn search(&self, query: &[f32], k: usize) -> AdvisorResult<Vec<ScoredChunk>> {
        if self.entries.is_empty() || k == 0 {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(AdvisorError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }

        let mut scored: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (i, cosine_similarity(query, &entry.embedding)))
            .collect();
        // Stable sort keeps insertion order among equal scores.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        Ok(scored
            .into_iter()
            .take(k)
            .map(|(i, score)| ScoredChunk {
                chunk: self.entries[i].chunk.clone(),
                score,
            })
            .collect())
    }

    pub fn save(&self, dir: &Path) -> AdvisorResult<()> {
        fs::create_dir_all(dir)?;
        let path = dir.join(INDEX_FILE);
        fs::write(&path, serde_json::to_vec(self)?)?;
        tracing::info!(
            "Saved index of {} chunks ({} dims) to {}",
            self.entries.len(),
            self.dimension,
            path.display()
        );
        Ok(())
    }

    pub fn load(dir: &Path) -> AdvisorResult<Self> {
        let path = dir.join(INDEX_FILE);
        if !path.exists() {
            return Err(AdvisorError::IndexMissing(path.display().to_string()));
        }
        let bytes = fs::read(&path)?;
        let index: VectorIndex = serde_json::from_slice(&bytes)?;

        if let Some(bad) = index.entries.iter().find(|e| e.embedding.len() != index.dimension) {
            return Err(AdvisorError::DimensionMismatch {
                expected: index.dimension,
                actual: bad.embedding.len(),
            });
        }

        tracing::debug!("Loaded index of {} chunks from {}", index.entries.len(), path.display());
        Ok(index)
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a < f32::EPSILON || norm_b < f32::EPSILON {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
