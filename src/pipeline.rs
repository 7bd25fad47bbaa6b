//! End-to-end natural-language query pipeline
//!
//! Processing steps for one request: quota check, query embedding,
//! semantic cache lookup, schema retrieval, prompt construction, SQL
//! generation, safety validation, execution, and usage accounting. A
//! request either completes or fails once; there are no retries, and
//! exactly one usage record is written per terminal outcome after the
//! quota gate.

use crate::config::PipelineConfig;
use crate::error::{NlqError, Result};
use crate::executor::{QueryExecutor, SqlData};
use crate::generator::{GeneratedSql, SqlGenerator, SqlSource};
use crate::prompt;
use crate::schema_rag::SchemaRetriever;
use crate::semantic_cache::SemanticSqlCache;
use crate::usage::{TokenLedger, UsageEvent, UsageStats, PARTICIPANT_NLQ_EVENT};
use crate::validator;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// One inbound natural-language question, scoped to a tenant and
/// optionally to an event (`event_id` 0 means unscoped).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub application_id: i32,
    #[serde(default)]
    pub event_id: i32,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub request_id: Option<String>,
}

/// Terminal result returned to the caller.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub query: String,
    #[serde(rename = "generatedSQL")]
    pub generated_sql: Option<String>,
    pub success: bool,
    pub data: Vec<serde_json::Value>,
    pub columns: Vec<String>,
    pub error: Option<String>,
    pub usage_stats: Option<UsageStats>,
    pub tokens_used: u32,
    pub source: Option<SqlSource>,
}

pub struct NlqPipeline {
    cache: SemanticSqlCache,
    retriever: SchemaRetriever,
    generator: SqlGenerator,
    executor: QueryExecutor,
    ledger: Arc<dyn TokenLedger>,
    config: PipelineConfig,
}

impl NlqPipeline {
    pub fn new(
        cache: SemanticSqlCache,
        retriever: SchemaRetriever,
        generator: SqlGenerator,
        executor: QueryExecutor,
        ledger: Arc<dyn TokenLedger>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            cache,
            retriever,
            generator,
            executor,
            ledger,
            config,
        }
    }

    /// Process one request end-to-end. Infrastructure failures (provider,
    /// index, validation) surface as errors; datastore execution failures
    /// are reported inside the result with `success = false`.
    pub async fn ask(&self, request: QueryRequest) -> Result<QueryResult> {
        let query = request.query.trim().to_string();
        if query.is_empty() {
            return Err(NlqError::Input("Query is required".to_string()));
        }

        let request_id = request
            .request_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_id = request
            .user_id
            .clone()
            .unwrap_or_else(|| "anonymous-user".to_string());

        info!(
            %request_id,
            application_id = request.application_id,
            event_id = request.event_id,
            %query,
            "processing natural language query"
        );

        let quota = self
            .ledger
            .check_quota(
                request.application_id,
                request.event_id,
                PARTICIPANT_NLQ_EVENT,
                &user_id,
                &request_id,
            )
            .await?;
        if !quota.allowed {
            return Err(NlqError::Quota(
                quota
                    .message
                    .unwrap_or_else(|| "usage quota exceeded".to_string()),
            ));
        }

        let embedding = self.cache.embed(&query).await?;

        if let Some(hit) = self
            .cache
            .find_similar(&embedding, self.config.similarity_threshold)
        {
            info!(
                similarity = hit.similarity,
                "semantic cache hit, reusing stored SQL"
            );
            let generation = GeneratedSql {
                sql: hit.sql,
                tokens_used: 0,
                source: SqlSource::CacheHit,
            };
            let data = self
                .executor
                .run(request.application_id, request.event_id, &generation.sql)
                .await;
            return Ok(self
                .finish(&request, &request_id, &user_id, &query, generation, data)
                .await);
        }

        // Cache miss: from here on tokens are being spent, so any terminal
        // outcome must be recorded with the best-known count.
        let mut tokens_used =
            (query.len() as f64 / self.config.chars_per_token as f64).ceil() as u32;

        match self
            .generate(&query, &request, &embedding, &mut tokens_used)
            .await
        {
            Ok((mut generation, data)) => {
                generation.tokens_used = tokens_used;
                Ok(self
                    .finish(&request, &request_id, &user_id, &query, generation, data)
                    .await)
            }
            Err(err) => {
                self.record_usage(
                    &request,
                    &request_id,
                    &user_id,
                    tokens_used,
                    false,
                    Some(err.to_string()),
                )
                .await;
                Err(err)
            }
        }
    }

    /// The generation path: schema retrieval, prompt build, model call,
    /// validation, cache store, execution. Generation tokens are added to
    /// `tokens_used` as soon as they are known so that failures later in
    /// the path are still charged for the model call.
    async fn generate(
        &self,
        query: &str,
        request: &QueryRequest,
        embedding: &[f32],
        tokens_used: &mut u32,
    ) -> Result<(GeneratedSql, SqlData)> {
        info!("searching for relevant schema");
        let fragments = self.retriever.search(query, embedding).await?;

        info!("building prompt context");
        let schema_context = prompt::build_schema_context(&fragments);
        let system_prompt =
            prompt::build_system_prompt(&schema_context, request.application_id, request.event_id);

        info!("generating SQL");
        let generation = self.generator.generate(&system_prompt, query).await?;
        *tokens_used += generation.tokens_used;

        info!(sql = %generation.sql, "validating SQL");
        if let Err(rejection) = validator::validate(&generation.sql) {
            warn!(%rejection, "generated SQL rejected");
            return Err(NlqError::Validation(rejection));
        }
        if self.config.enforce_tenant_scope {
            validator::enforce_tenant_scope(&generation.sql, request.application_id)
                .map_err(NlqError::Validation)?;
        }

        // Only validated SQL is ever cached.
        self.cache.store(query, embedding, &generation.sql);

        let data = self
            .executor
            .run(request.application_id, request.event_id, &generation.sql)
            .await;

        Ok((generation, data))
    }

    /// Record the terminal outcome and assemble the result. Ledger
    /// failures are logged, never propagated.
    async fn finish(
        &self,
        request: &QueryRequest,
        request_id: &str,
        user_id: &str,
        query: &str,
        generation: GeneratedSql,
        data: SqlData,
    ) -> QueryResult {
        let success = data.error_message.is_none();

        self.record_usage(
            request,
            request_id,
            user_id,
            generation.tokens_used,
            success,
            data.error_message.clone(),
        )
        .await;

        let usage_stats = match self.ledger.stats(request.application_id).await {
            Ok(stats) => Some(stats),
            Err(err) => {
                warn!(%err, "failed to fetch usage stats");
                None
            }
        };

        info!(
            success,
            tokens_used = generation.tokens_used,
            rows = data.rows.len(),
            "query processed"
        );

        QueryResult {
            query: query.to_string(),
            generated_sql: Some(generation.sql),
            success,
            data: data.rows,
            columns: data.columns,
            error: data.error_message,
            usage_stats,
            tokens_used: generation.tokens_used,
            source: Some(generation.source),
        }
    }

    async fn record_usage(
        &self,
        request: &QueryRequest,
        request_id: &str,
        user_id: &str,
        tokens: u32,
        success: bool,
        error_message: Option<String>,
    ) {
        let event = UsageEvent {
            application_id: request.application_id,
            event_id: request.event_id,
            user_id: user_id.to_string(),
            tokens,
            event_type: PARTICIPANT_NLQ_EVENT.to_string(),
            success,
            error_message,
            request_id: request_id.to_string(),
        };

        if let Err(err) = self.ledger.record(event).await {
            warn!(%err, "failed to record token usage");
        }
    }
}
