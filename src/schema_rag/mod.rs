//! Schema retrieval
//!
//! Retrieves the schema fragments most relevant to a query using vector
//! search over table-description embeddings.

pub mod retriever;
pub mod schema;
pub mod vector_store;

pub use retriever::{SchemaRetriever, VectorIndex};
pub use schema::{SchemaColumn, SchemaFragment, SchemaRelationship};
pub use vector_store::InMemorySchemaIndex;
