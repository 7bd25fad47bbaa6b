//! In-memory schema index
//!
//! Linear-scan cosine search over fragment embeddings with a small lexical
//! boost when the query mentions a table by name. Good enough for the
//! handful of tables this service documents; a hosted vector index slots
//! in behind the same trait.

use crate::error::{NlqError, Result};
use crate::schema_rag::retriever::VectorIndex;
use crate::schema_rag::schema::SchemaFragment;
use crate::semantic_cache::{cosine_similarity, Embedding};
use async_trait::async_trait;

struct IndexedFragment {
    fragment: SchemaFragment,
    embedding: Embedding,
}

pub struct InMemorySchemaIndex {
    fragments: Vec<IndexedFragment>,
    dimension: usize,
}

impl InMemorySchemaIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            fragments: Vec::new(),
            dimension,
        }
    }

    pub fn add_fragment(&mut self, fragment: SchemaFragment, embedding: Embedding) -> Result<()> {
        if embedding.len() != self.dimension {
            return Err(NlqError::Index(format!(
                "Embedding dimension {} doesn't match index dimension {}",
                embedding.len(),
                self.dimension
            )));
        }

        self.fragments.push(IndexedFragment {
            fragment,
            embedding,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemorySchemaIndex {
    async fn search(
        &self,
        query_text: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SchemaFragment>> {
        if vector.len() != self.dimension {
            return Err(NlqError::Index(format!(
                "Query embedding dimension {} doesn't match index dimension {}",
                vector.len(),
                self.dimension
            )));
        }

        let query_lower = query_text.to_lowercase();

        let mut scored: Vec<(f32, &SchemaFragment)> = self
            .fragments
            .iter()
            .map(|indexed| {
                let mut score = cosine_similarity(vector, &indexed.embedding);
                // Hybrid ranking: an explicit table-name mention outranks
                // pure vector proximity.
                if query_lower.contains(&indexed.fragment.table_name.to_lowercase()) {
                    score += 0.1;
                }
                (score, &indexed.fragment)
            })
            .collect();

        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.table_name.cmp(&b.1.table_name))
        });
        scored.truncate(k);

        Ok(scored.into_iter().map(|(_, f)| f.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(name: &str) -> SchemaFragment {
        SchemaFragment {
            table_name: name.to_string(),
            description: String::new(),
            columns: Vec::new(),
            relationships: Vec::new(),
        }
    }

    #[tokio::test]
    async fn search_orders_by_score_then_name() {
        let mut index = InMemorySchemaIndex::new(2);
        index.add_fragment(fragment("Beta"), vec![1.0, 0.0]).unwrap();
        index.add_fragment(fragment("Alpha"), vec![1.0, 0.0]).unwrap();
        index.add_fragment(fragment("Gamma"), vec![0.0, 1.0]).unwrap();

        let results = index.search("anything", &[1.0, 0.0], 3).await.unwrap();
        let names: Vec<&str> = results.iter().map(|f| f.table_name.as_str()).collect();

        // Equal-score fragments tie-break by table name ascending.
        assert_eq!(names, vec!["Alpha", "Beta", "Gamma"]);
    }

    #[tokio::test]
    async fn search_truncates_to_k() {
        let mut index = InMemorySchemaIndex::new(2);
        index.add_fragment(fragment("A"), vec![1.0, 0.0]).unwrap();
        index.add_fragment(fragment("B"), vec![0.9, 0.1]).unwrap();

        let results = index.search("anything", &[1.0, 0.0], 1).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn table_name_mention_boosts_rank() {
        let mut index = InMemorySchemaIndex::new(2);
        index.add_fragment(fragment("Participant"), vec![0.0, 1.0]).unwrap();
        index.add_fragment(fragment("Groups"), vec![1.0, 0.0]).unwrap();

        let results = index
            .search("count participant rows", &[1.0, 0.05], 2)
            .await
            .unwrap();
        // Groups is the better vector match but the query names the
        // Participant table... the boost alone is not enough here.
        assert_eq!(results[0].table_name, "Groups");

        let results = index
            .search("count participant rows", &[0.74, 0.67], 2)
            .await
            .unwrap();
        assert_eq!(results[0].table_name, "Participant");
    }

    #[tokio::test]
    async fn dimension_mismatch_is_an_error() {
        let index = InMemorySchemaIndex::new(3);
        assert!(index.search("q", &[1.0, 0.0], 5).await.is_err());
    }
}
