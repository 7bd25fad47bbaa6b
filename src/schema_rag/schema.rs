//! Schema fragment model
//!
//! Read-only descriptions of tables, columns, and relationships as stored
//! in the schema index. The index itself is built out-of-band.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaColumn {
    pub column_name: String,
    pub data_type: String,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_foreign_key: bool,
    #[serde(default = "default_nullable")]
    pub is_nullable: bool,
    #[serde(default)]
    pub is_identity: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub business_context: String,
}

fn default_nullable() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaRelationship {
    pub from_table: String,
    pub from_column: String,
    pub to_table: String,
    pub to_column: String,
    #[serde(default)]
    pub description: String,
}

/// One table's worth of schema documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaFragment {
    pub table_name: String,
    #[serde(default)]
    pub description: String,
    pub columns: Vec<SchemaColumn>,
    #[serde(default)]
    pub relationships: Vec<SchemaRelationship>,
}

impl SchemaFragment {
    /// Flatten the fragment into searchable text for embedding.
    pub fn embedding_text(&self) -> String {
        let mut parts = Vec::new();
        parts.push(format!("Table: {}", self.table_name));

        if !self.description.is_empty() {
            parts.push(format!("Description: {}", self.description));
        }

        let column_names: Vec<&str> = self
            .columns
            .iter()
            .map(|c| c.column_name.as_str())
            .collect();
        parts.push(format!("Columns: {}", column_names.join(", ")));

        for column in &self.columns {
            if !column.business_context.is_empty() {
                parts.push(format!(
                    "{}: {}",
                    column.column_name, column.business_context
                ));
            }
        }

        parts.join(". ")
    }
}
