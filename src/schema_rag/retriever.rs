//! Schema retriever
//!
//! Thin front over a vector index of table descriptions. The index is
//! pre-populated out-of-band; retrieval must be deterministic for a fixed
//! index state and a fixed query.

use crate::error::Result;
use crate::schema_rag::schema::SchemaFragment;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Nearest-neighbor search over schema fragments. Implementations receive
/// the raw query text alongside the vector so they can apply hybrid
/// lexical+vector ranking; results are ordered by descending score with
/// ties broken by table name ascending.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(
        &self,
        query_text: &str,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<SchemaFragment>>;
}

pub struct SchemaRetriever {
    index: Arc<dyn VectorIndex>,
    top_k: usize,
}

impl SchemaRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, top_k: usize) -> Self {
        Self { index, top_k }
    }

    /// Retrieve up to `top_k` fragments relevant to the query. An
    /// unreachable index propagates as an error; there is no stale
    /// fallback.
    pub async fn search(&self, query_text: &str, vector: &[f32]) -> Result<Vec<SchemaFragment>> {
        let fragments = self.index.search(query_text, vector, self.top_k).await?;

        let table_names: Vec<&str> = fragments.iter().map(|f| f.table_name.as_str()).collect();
        debug!(?table_names, "relevant schema fragments retrieved");

        Ok(fragments)
    }
}
