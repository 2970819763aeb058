use super::models::LlmTrace;
use crate::error::{AppResult, TraceError};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::prelude::FromRow;
use sqlx::PgPool;

/// Trace store boundary (read-only collaborator).
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// Exactly-one lookup. Fails with [`TraceError::DuplicateTraceId`] when
    /// more than one record shares the id; callers fall back to
    /// `find_first_by_trace_id` in that case.
    async fn find_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>>;

    /// Deterministic first-match fallback for the duplicate-id anomaly.
    async fn find_first_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>>;
}

#[derive(FromRow)]
struct TraceRow {
    trace_id: String,
    provider: Option<String>,
    model: Option<String>,
    request: Value,
    response: Option<Value>,
}

impl TraceRow {
    fn into_trace(self) -> AppResult<LlmTrace> {
        let request = serde_json::from_value(self.request)
            .map_err(|e| TraceError::Malformed(e.to_string()))?;
        let response = self
            .response
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| TraceError::Malformed(e.to_string()))?;

        Ok(LlmTrace {
            trace_id: self.trace_id,
            provider: self.provider,
            model: self.model,
            request,
            response,
        })
    }
}

pub struct PgTraceStore {
    pool: PgPool,
}

impl PgTraceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TraceStore for PgTraceStore {
    async fn find_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>> {
        // LIMIT 2 is enough to detect the multiplicity fault
        let mut rows = sqlx::query_as::<_, TraceRow>(
            r#"
            SELECT trace_id, provider, model, request, response
            FROM llm_traces
            WHERE trace_id = $1
            LIMIT 2
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        if rows.len() > 1 {
            return Err(TraceError::DuplicateTraceId(trace_id.to_string()).into());
        }

        rows.pop().map(TraceRow::into_trace).transpose()
    }

    async fn find_first_by_trace_id(&self, trace_id: &str) -> AppResult<Option<LlmTrace>> {
        let row = sqlx::query_as::<_, TraceRow>(
            r#"
            SELECT trace_id, provider, model, request, response
            FROM llm_traces
            WHERE trace_id = $1
            ORDER BY created_at ASC
            LIMIT 1
            "#,
        )
        .bind(trace_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TraceRow::into_trace).transpose()
    }
}
