//! Token usage accounting
//!
//! Quota checks before generation and one usage record per terminal
//! outcome. The pipeline calls into this after every request but never
//! depends on a ledger write for correctness.

use crate::error::{NlqError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Mutex;
use uuid::Uuid;

/// Event type recorded for participant natural-language queries.
pub const PARTICIPANT_NLQ_EVENT: &str = "ParticipantNQL";

/// Aggregate usage for one tenant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_tokens: i64,
    pub total_requests: i64,
}

/// One terminal pipeline outcome, successful or not.
#[derive(Debug, Clone)]
pub struct UsageEvent {
    pub application_id: i32,
    pub event_id: i32,
    pub user_id: String,
    pub tokens: u32,
    pub event_type: String,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_id: String,
}

/// Outcome of a pre-generation quota check.
#[derive(Debug, Clone)]
pub struct QuotaDecision {
    pub allowed: bool,
    pub message: Option<String>,
}

#[async_trait]
pub trait TokenLedger: Send + Sync {
    async fn check_quota(
        &self,
        application_id: i32,
        event_id: i32,
        event_type: &str,
        user_id: &str,
        request_id: &str,
    ) -> Result<QuotaDecision>;

    async fn record(&self, event: UsageEvent) -> Result<()>;

    async fn stats(&self, application_id: i32) -> Result<UsageStats>;
}

/// PostgreSQL-backed ledger writing to the `ai_token_usage` table.
pub struct PgTokenLedger {
    pool: PgPool,
    monthly_token_quota: i64,
}

impl PgTokenLedger {
    pub fn new(pool: PgPool, monthly_token_quota: i64) -> Self {
        Self {
            pool,
            monthly_token_quota,
        }
    }
}

#[async_trait]
impl TokenLedger for PgTokenLedger {
    async fn check_quota(
        &self,
        application_id: i32,
        _event_id: i32,
        _event_type: &str,
        _user_id: &str,
        _request_id: &str,
    ) -> Result<QuotaDecision> {
        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(tokens), 0)
            FROM ai_token_usage
            WHERE application_id = $1
              AND created_at >= date_trunc('month', now())
            "#,
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NlqError::Database(e.to_string()))?;

        if used >= self.monthly_token_quota {
            return Ok(QuotaDecision {
                allowed: false,
                message: Some(format!(
                    "Monthly token quota exhausted ({} of {} used)",
                    used, self.monthly_token_quota
                )),
            });
        }

        Ok(QuotaDecision {
            allowed: true,
            message: None,
        })
    }

    async fn record(&self, event: UsageEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO ai_token_usage
                (id, application_id, event_id, user_id, tokens, event_type,
                 success, error_message, request_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event.application_id)
        .bind(event.event_id)
        .bind(event.user_id)
        .bind(event.tokens as i64)
        .bind(event.event_type)
        .bind(event.success)
        .bind(event.error_message)
        .bind(event.request_id)
        .execute(&self.pool)
        .await
        .map_err(|e| NlqError::Database(e.to_string()))?;

        Ok(())
    }

    async fn stats(&self, application_id: i32) -> Result<UsageStats> {
        let (total_tokens, total_requests): (i64, i64) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(tokens), 0), COUNT(*)
            FROM ai_token_usage
            WHERE application_id = $1
            "#,
        )
        .bind(application_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| NlqError::Database(e.to_string()))?;

        Ok(UsageStats {
            total_tokens,
            total_requests,
        })
    }
}

/// In-memory ledger for tests and local runs. Quota denial can be
/// scripted at construction.
pub struct InMemoryTokenLedger {
    events: Mutex<Vec<UsageEvent>>,
    deny_message: Option<String>,
}

impl InMemoryTokenLedger {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            deny_message: None,
        }
    }

    pub fn denying(message: &str) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            deny_message: Some(message.to_string()),
        }
    }

    pub fn events(&self) -> Vec<UsageEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl Default for InMemoryTokenLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TokenLedger for InMemoryTokenLedger {
    async fn check_quota(
        &self,
        _application_id: i32,
        _event_id: i32,
        _event_type: &str,
        _user_id: &str,
        _request_id: &str,
    ) -> Result<QuotaDecision> {
        match &self.deny_message {
            Some(message) => Ok(QuotaDecision {
                allowed: false,
                message: Some(message.clone()),
            }),
            None => Ok(QuotaDecision {
                allowed: true,
                message: None,
            }),
        }
    }

    async fn record(&self, event: UsageEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }

    async fn stats(&self, application_id: i32) -> Result<UsageStats> {
        let events = self.events.lock().unwrap();
        let relevant = events
            .iter()
            .filter(|e| e.application_id == application_id);

        let mut stats = UsageStats::default();
        for event in relevant {
            stats.total_tokens += event.tokens as i64;
            stats.total_requests += 1;
        }
        Ok(stats)
    }
}
