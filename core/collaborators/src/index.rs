//! Vector similarity index used by the neighbour analyzer.
//!
//! The engine never handles embeddings itself: it hands text to the index,
//! which embeds and searches. Distances follow the usual convention,
//! 0 = identical and larger = less similar.
use async_trait::async_trait;
use para_schemas::{Category, NoteId};
use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

use crate::error::{CollaboratorError, Result};

pub const CATEGORY_KEY: &str = "category";

#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn upsert(
        &self,
        id: &NoteId,
        text: &str,
        snippet: &str,
        metadata: HashMap<String, String>,
    ) -> Result<()>;

    async fn query(
        &self,
        text: &str,
        k: usize,
        category_filter: Option<Category>,
    ) -> Result<Vec<IndexHit>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: String,
    pub distance: f64,
    pub metadata: HashMap<String, String>,
}

impl IndexHit {
    pub fn category(&self) -> Option<Category> {
        self.metadata
            .get(CATEGORY_KEY)
            .and_then(|c| c.parse().ok())
    }
}

/// Turns text into a fixed-size vector.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic bag-of-words embedder: tokens are hashed into buckets and
/// the resulting vector is L2-normalized. Good enough for local use and
/// tests; swap in a real model behind `Embedder` for production.
pub struct HashingEmbedder {
    dimensions: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
        }
    }
}

impl Embedder for HashingEmbedder {
    fn embed(&self, text: &str) -> Vec<f32> {
        let mut embedding = vec![0.0f32; self.dimensions];

        let lower = text.to_lowercase();
        for token in lower
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| t.chars().count() > 2)
        {
            let bucket = (fnv1a(token) % self.dimensions as u64) as usize;
            embedding[bucket] += 1.0;
        }

        let norm: f32 = embedding.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for value in embedding.iter_mut() {
                *value /= norm;
            }
        }

        embedding
    }
}

fn fnv1a(token: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in token.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

struct IndexEntry {
    embedding: Vec<f32>,
    metadata: HashMap<String, String>,
}

/// In-memory index for local runs and tests.
pub struct InMemoryVectorIndex {
    embedder: Box<dyn Embedder>,
    entries: RwLock<HashMap<String, IndexEntry>>,
}

impl Default for InMemoryVectorIndex {
    fn default() -> Self {
        Self::new(Box::new(HashingEmbedder::default()))
    }
}

impl InMemoryVectorIndex {
    pub fn new(embedder: Box<dyn Embedder>) -> Self {
        Self {
            embedder,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn upsert(
        &self,
        id: &NoteId,
        text: &str,
        snippet: &str,
        mut metadata: HashMap<String, String>,
    ) -> Result<()> {
        let embedding = self.embedder.embed(text);
        metadata
            .entry("snippet".to_string())
            .or_insert_with(|| snippet.to_string());

        let mut entries = self
            .entries
            .write()
            .map_err(|_| CollaboratorError::Unavailable("vector index lock poisoned".into()))?;
        entries.insert(id.0.clone(), IndexEntry { embedding, metadata });

        debug!("Upserted note {} into in-memory index", id);
        Ok(())
    }

    async fn query(
        &self,
        text: &str,
        k: usize,
        category_filter: Option<Category>,
    ) -> Result<Vec<IndexHit>> {
        let query_embedding = self.embedder.embed(text);
        let entries = self
            .entries
            .read()
            .map_err(|_| CollaboratorError::Unavailable("vector index lock poisoned".into()))?;

        let wanted = category_filter.map(|c| c.as_str());
        let mut hits: Vec<IndexHit> = entries
            .iter()
            .filter(|(_, entry)| match wanted {
                Some(name) => entry.metadata.get(CATEGORY_KEY).map(String::as_str) == Some(name),
                None => true,
            })
            .map(|(id, entry)| IndexHit {
                id: id.clone(),
                distance: (1.0 - f64::from(cosine_similarity(&query_embedding, &entry.embedding)))
                    .max(0.0),
                metadata: entry.metadata.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            a.distance
                .total_cmp(&b.distance)
                .then_with(|| a.id.cmp(&b.id))
        });
        hits.truncate(k);

        Ok(hits)
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if mag_a == 0.0 || mag_b == 0.0 {
        0.0
    } else {
        dot / (mag_a * mag_b)
    }
}
