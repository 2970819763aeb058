use super::models::CreditTransaction;
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use sqlx::PgPool;

/// Transaction store boundary consumed by the compensation engine.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Lazy stream of sweep candidates: PENDING/FAILED transactions created at
    /// or after `since` (unbounded when `since` is None). No ordering
    /// guarantee; candidates are independent.
    fn stream_candidates(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> BoxStream<'_, AppResult<CreditTransaction>>;

    /// Persist the transaction's mutable fields, returning the stored record.
    async fn save(&self, tx: &CreditTransaction) -> AppResult<CreditTransaction>;
}

pub struct PgTransactionStore {
    pool: PgPool,
}

impl PgTransactionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TransactionStore for PgTransactionStore {
    fn stream_candidates(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> BoxStream<'_, AppResult<CreditTransaction>> {
        // Same predicate as CreditTransaction::is_sweep_candidate, pushed into
        // SQL so the stream stays lazy.
        sqlx::query_as::<_, CreditTransaction>(
            r#"
            SELECT id, user_id, feature_tag, provider, model_id,
                   input_tokens, output_tokens, credits_deducted, billing_mode, estimated,
                   status, error_message, trace_id, created_at, updated_at
            FROM credit_transactions
            WHERE status IN ('PENDING', 'FAILED')
              AND ($1::timestamptz IS NULL OR created_at IS NULL OR created_at >= $1)
            "#,
        )
        .bind(since)
        .fetch(&self.pool)
        .map(|row| row.map_err(Into::into))
        .boxed()
    }

    async fn save(&self, tx: &CreditTransaction) -> AppResult<CreditTransaction> {
        let saved = sqlx::query_as::<_, CreditTransaction>(
            r#"
            UPDATE credit_transactions
            SET provider = $2, model_id = $3, input_tokens = $4, output_tokens = $5,
                credits_deducted = $6, billing_mode = $7, estimated = $8,
                status = $9, error_message = $10, updated_at = $11
            WHERE id = $1
            RETURNING id, user_id, feature_tag, provider, model_id,
                      input_tokens, output_tokens, credits_deducted, billing_mode, estimated,
                      status, error_message, trace_id, created_at, updated_at
            "#,
        )
        .bind(tx.id)
        .bind(&tx.provider)
        .bind(&tx.model_id)
        .bind(tx.input_tokens)
        .bind(tx.output_tokens)
        .bind(tx.credits_deducted)
        .bind(tx.billing_mode)
        .bind(tx.estimated)
        .bind(tx.status)
        .bind(&tx.error_message)
        .bind(tx.updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(saved)
    }
}
