//! Semantic SQL cache
//!
//! Maps query text to embeddings and previously generated SQL. Lookups are
//! by cosine similarity over an append-only entry log, so two differently
//! worded questions with the same meaning can reuse the same SQL without a
//! second model call.

use crate::error::Result;
use crate::llm::EmbeddingProvider;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::{Arc, RwLock};

/// Vector embedding (simple f32 vector)
pub type Embedding = Vec<f32>;

/// One cached generation. Entries are appended and never updated in place;
/// duplicates are harmless because lookup always takes the best match.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub query_text: String,
    pub embedding: Embedding,
    pub sql: String,
    pub created_at: DateTime<Utc>,
}

/// A similarity lookup result.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub sql: String,
    pub similarity: f32,
}

/// In-memory semantic cache with an exact-text embedding memo in front of
/// the embedding provider.
///
/// Lookup is a linear scan over every stored entry, which is fine up to
/// tens of thousands of entries; beyond that a proper vector index is
/// warranted. There is no eviction.
pub struct SemanticSqlCache {
    provider: Arc<dyn EmbeddingProvider>,
    /// Exact query text -> embedding, so repeated text never re-embeds.
    embeddings: DashMap<String, Embedding>,
    /// Append-only log of validated generations.
    entries: RwLock<Vec<CacheEntry>>,
}

impl SemanticSqlCache {
    pub fn new(provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            provider,
            embeddings: DashMap::new(),
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Return the embedding for `text`, calling the provider only on the
    /// first sighting of that exact string. Provider errors propagate.
    pub async fn embed(&self, text: &str) -> Result<Embedding> {
        if let Some(cached) = self.embeddings.get(text) {
            return Ok(cached.value().clone());
        }

        let vector = self.provider.embed(text).await?;
        self.embeddings.insert(text.to_string(), vector.clone());
        Ok(vector)
    }

    /// Scan every stored entry and return the most similar one at or above
    /// `threshold`. On an exact similarity tie the earliest-inserted entry
    /// wins (strict `>` comparison during the scan).
    pub fn find_similar(&self, vector: &[f32], threshold: f32) -> Option<CacheHit> {
        let entries = self.entries.read().unwrap();

        let mut best: Option<CacheHit> = None;
        for entry in entries.iter() {
            let similarity = cosine_similarity(vector, &entry.embedding);
            let better = match &best {
                Some(hit) => similarity > hit.similarity,
                None => true,
            };
            if better {
                best = Some(CacheHit {
                    sql: entry.sql.clone(),
                    similarity,
                });
            }
        }

        best.filter(|hit| hit.similarity >= threshold)
    }

    /// Append a new entry. Callers only store SQL that already passed
    /// validation.
    pub fn store(&self, text: &str, vector: &[f32], sql: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.push(CacheEntry {
            query_text: text.to_string(),
            embedding: vector.to_vec(),
            sql: sql.to_string(),
            created_at: Utc::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().unwrap().is_empty()
    }
}

/// Compute cosine similarity between two vectors
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot_product / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::NlqError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingEmbedder {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if text == "boom" {
                return Err(NlqError::Provider("unreachable".to_string()));
            }
            Ok(vec![1.0, 0.0, 0.0])
        }
    }

    fn cache_with_counter() -> (SemanticSqlCache, Arc<CountingEmbedder>) {
        let embedder = Arc::new(CountingEmbedder {
            calls: AtomicUsize::new(0),
        });
        (SemanticSqlCache::new(embedder.clone()), embedder)
    }

    #[test]
    fn test_cosine_similarity() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 1.0);

        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[tokio::test]
    async fn embed_memoizes_exact_text() {
        let (cache, embedder) = cache_with_counter();

        cache.embed("show participants").await.unwrap();
        cache.embed("show participants").await.unwrap();

        assert_eq!(embedder.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn embed_propagates_provider_errors() {
        let (cache, _) = cache_with_counter();
        assert!(cache.embed("boom").await.is_err());
    }

    #[test]
    fn find_similar_respects_threshold() {
        let (cache, _) = cache_with_counter();
        cache.store("q1", &[1.0, 0.0], "SELECT 1;");

        // Orthogonal query vector: similarity 0, below any useful threshold.
        assert!(cache.find_similar(&[0.0, 1.0], 0.95).is_none());
        // Identical vector: similarity 1.
        let hit = cache.find_similar(&[1.0, 0.0], 0.95).unwrap();
        assert_eq!(hit.sql, "SELECT 1;");
        assert!(hit.similarity >= 0.95);
    }

    #[test]
    fn find_similar_prefers_most_similar_entry() {
        let (cache, _) = cache_with_counter();
        cache.store("far", &[0.8, 0.6], "SELECT 'far';");
        cache.store("near", &[1.0, 0.0], "SELECT 'near';");

        let hit = cache.find_similar(&[1.0, 0.0], 0.5).unwrap();
        assert_eq!(hit.sql, "SELECT 'near';");
    }

    #[test]
    fn find_similar_ties_break_on_insertion_order() {
        let (cache, _) = cache_with_counter();
        cache.store("first", &[1.0, 0.0], "SELECT 'first';");
        cache.store("second", &[1.0, 0.0], "SELECT 'second';");

        let hit = cache.find_similar(&[1.0, 0.0], 0.95).unwrap();
        assert_eq!(hit.sql, "SELECT 'first';");
    }

    #[test]
    fn duplicate_entries_are_harmless() {
        let (cache, _) = cache_with_counter();
        cache.store("q", &[1.0, 0.0], "SELECT 1;");
        cache.store("q", &[1.0, 0.0], "SELECT 1;");

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.find_similar(&[1.0, 0.0], 0.9).unwrap().sql, "SELECT 1;");
    }
}
