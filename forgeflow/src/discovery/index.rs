//! In-memory cosine vector index over the API corpus.
//!
//! Built once at startup from a single embedding batch; read-only for
//! the rest of the process lifetime and shared across pipeline runs.

use anyhow::{Context, Result};
use forgeflow_llm::Embedder;

use crate::discovery::corpus::ApiCorpus;

/// One retrieval hit: a corpus document index and its cosine similarity
/// to the query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Hit {
    pub doc_index: usize,
    pub similarity: f64,
}

pub struct VectorIndex {
    /// L2-normalized vectors, parallel to the corpus docs.
    vectors: Vec<Vec<f32>>,
}

impl VectorIndex {
    /// Embed every corpus document in one batch and build the index.
    pub async fn build(corpus: &ApiCorpus, embedder: &dyn Embedder) -> Result<Self> {
        let texts: Vec<String> = corpus.docs().iter().map(|d| d.embedding_text()).collect();
        let raw = embedder
            .embed_batch(&texts)
            .await
            .context("failed to embed corpus")?;
        anyhow::ensure!(
            raw.len() == texts.len(),
            "embedder returned {} vectors for {} documents",
            raw.len(),
            texts.len()
        );
        Ok(Self {
            vectors: raw.into_iter().map(normalize).collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Top-k documents by cosine similarity, best first.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<Hit> {
        let query = normalize(query.to_vec());
        let mut hits: Vec<Hit> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(doc_index, v)| Hit {
                doc_index,
                similarity: dot(&query, v) as f64,
            })
            .collect();
        hits.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(k);
        hits
    }

    /// Embed a query string and search.
    pub async fn search_text(
        &self,
        embedder: &dyn Embedder,
        query: &str,
        k: usize,
    ) -> Result<Vec<Hit>> {
        let vector = embedder
            .embed_one(query)
            .await
            .context("failed to embed query")?;
        Ok(self.search(&vector, k))
    }
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
