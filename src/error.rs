use crate::validator::SqlRejection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NlqError {
    #[error("Input error: {0}")]
    Input(String),

    #[error("Usage quota error: {0}")]
    Quota(String),

    #[error("Provider error: {0}")]
    Provider(String),

    #[error("Model returned an empty completion")]
    EmptyGeneration,

    #[error("Generated SQL failed validation: {0}")]
    Validation(SqlRejection),

    #[error("Schema index error: {0}")]
    Index(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, NlqError>;
