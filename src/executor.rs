//! Tenant-scoped SQL execution
//!
//! Runs already-validated statements against the datastore. Execution
//! failures are captured into the result rather than raised; the caller
//! decides success from the presence of an error message. No retries.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo, ValueRef};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Rows and column metadata from one statement, or the reason it failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SqlData {
    pub rows: Vec<serde_json::Value>,
    pub columns: Vec<String>,
    pub error_message: Option<String>,
}

/// A datastore-level execution failure. Non-fatal: the executor folds it
/// into `SqlData::error_message`.
#[derive(Debug, Clone)]
pub struct ExecutionError(pub String);

impl fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[async_trait]
pub trait Datastore: Send + Sync {
    async fn execute(&self, sql: &str) -> Result<SqlData, ExecutionError>;
}

pub struct QueryExecutor {
    datastore: Arc<dyn Datastore>,
}

impl QueryExecutor {
    pub fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self { datastore }
    }

    /// Execute a validated statement under the given tenant/event scope.
    /// The scope parameters the prompt instructs the model to use are
    /// bound here as integer literals before execution.
    pub async fn run(&self, application_id: i32, event_id: i32, sql: &str) -> SqlData {
        let bound = bind_scope_parameters(sql, application_id, event_id);
        debug!(application_id, event_id, sql = %bound, "executing validated SQL");

        match self.datastore.execute(&bound).await {
            Ok(data) => data,
            Err(err) => {
                warn!(%err, "query execution failed");
                SqlData {
                    rows: Vec::new(),
                    columns: Vec::new(),
                    error_message: Some(err.0),
                }
            }
        }
    }
}

/// Substitute the `@ApplicationId` / `@EventId` placeholders with integer
/// literals. Both values are integers supplied by the caller, never user
/// text, so plain substitution is injection-safe.
pub fn bind_scope_parameters(sql: &str, application_id: i32, event_id: i32) -> String {
    sql.replace("@ApplicationId", &application_id.to_string())
        .replace("@EventId", &event_id.to_string())
}

/// PostgreSQL datastore backed by an sqlx pool.
pub struct PgDatastore {
    pool: PgPool,
}

impl PgDatastore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Datastore for PgDatastore {
    async fn execute(&self, sql: &str) -> Result<SqlData, ExecutionError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| ExecutionError(e.to_string()))?;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut object = serde_json::Map::new();
            for (idx, column) in row.columns().iter().enumerate() {
                let value = match decode_column(row, idx) {
                    Ok(value) => value,
                    Err(reason) => {
                        warn!(column = column.name(), %reason, "failed to decode column value");
                        serde_json::Value::Null
                    }
                };
                object.insert(column.name().to_string(), value);
            }
            out.push(serde_json::Value::Object(object));
        }

        Ok(SqlData {
            rows: out,
            columns,
            error_message: None,
        })
    }
}

/// Decode one column of one row into a JSON value, tagged with the reason
/// when the value cannot be mapped.
fn decode_column(row: &PgRow, idx: usize) -> Result<serde_json::Value, String> {
    use serde_json::Value;

    let raw = row.try_get_raw(idx).map_err(|e| e.to_string())?;
    if raw.is_null() {
        return Ok(Value::Null);
    }

    let type_name = row.columns()[idx].type_info().name().to_string();

    match type_name.as_str() {
        "BOOL" => row
            .try_get::<bool, _>(idx)
            .map(Value::Bool)
            .map_err(|e| e.to_string()),
        "INT2" => row
            .try_get::<i16, _>(idx)
            .map(|v| Value::Number(v.into()))
            .map_err(|e| e.to_string()),
        "INT4" => row
            .try_get::<i32, _>(idx)
            .map(|v| Value::Number(v.into()))
            .map_err(|e| e.to_string()),
        "INT8" => row
            .try_get::<i64, _>(idx)
            .map(|v| Value::Number(v.into()))
            .map_err(|e| e.to_string()),
        "FLOAT4" => row
            .try_get::<f32, _>(idx)
            .map(|v| {
                serde_json::Number::from_f64(v as f64)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            })
            .map_err(|e| e.to_string()),
        "FLOAT8" => row
            .try_get::<f64, _>(idx)
            .map(|v| {
                serde_json::Number::from_f64(v)
                    .map(Value::Number)
                    .unwrap_or(Value::Null)
            })
            .map_err(|e| e.to_string()),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" => row
            .try_get::<String, _>(idx)
            .map(Value::String)
            .map_err(|e| e.to_string()),
        "UUID" => row
            .try_get::<uuid::Uuid, _>(idx)
            .map(|v| Value::String(v.to_string()))
            .map_err(|e| e.to_string()),
        "TIMESTAMPTZ" => row
            .try_get::<chrono::DateTime<chrono::Utc>, _>(idx)
            .map(|v| Value::String(v.to_rfc3339()))
            .map_err(|e| e.to_string()),
        "TIMESTAMP" => row
            .try_get::<chrono::NaiveDateTime, _>(idx)
            .map(|v| Value::String(v.to_string()))
            .map_err(|e| e.to_string()),
        "DATE" => row
            .try_get::<chrono::NaiveDate, _>(idx)
            .map(|v| Value::String(v.to_string()))
            .map_err(|e| e.to_string()),
        other => row
            .try_get::<String, _>(idx)
            .map(Value::String)
            .map_err(|_| format!("unsupported column type {}", other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parameters_are_bound_as_literals() {
        let sql = "SELECT 1 FROM Participant p \
                   JOIN Participant_ApplicationInstance pai ON p.Id = pai.ParticipantId \
                   WHERE p.ApplicationId = @ApplicationId AND pai.ApplicationInstanceId = @EventId";
        let bound = bind_scope_parameters(sql, 7, 42);

        assert!(bound.contains("p.ApplicationId = 7"));
        assert!(bound.contains("pai.ApplicationInstanceId = 42"));
        assert!(!bound.contains('@'));
    }

    #[tokio::test]
    async fn execution_failure_is_captured_not_raised() {
        struct FailingDatastore;

        #[async_trait]
        impl Datastore for FailingDatastore {
            async fn execute(&self, _sql: &str) -> Result<SqlData, ExecutionError> {
                Err(ExecutionError("relation \"missing\" does not exist".to_string()))
            }
        }

        let executor = QueryExecutor::new(Arc::new(FailingDatastore));
        let data = executor.run(1, 0, "SELECT * FROM missing;").await;

        assert!(data.rows.is_empty());
        assert!(data.error_message.unwrap().contains("does not exist"));
    }
}
