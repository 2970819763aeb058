pub mod ledger;

pub use ledger::{CreditRateTable, PgCreditLedger};

use crate::billing::models::AiFeature;
use crate::error::AppResult;
use async_trait::async_trait;
use rust_decimal::Decimal;
use uuid::Uuid;

/// One deduction attempt against the credit ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeductionRequest {
    /// Idempotency key: a transaction is never deducted twice
    pub transaction_id: Uuid,
    pub user_id: String,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub feature: AiFeature,
    pub input_tokens: i32,
    pub output_tokens: i32,
}

/// Structured deduction result.
///
/// Insufficient funds is an expected business outcome, not a defect, and is
/// kept separate from other failures so callers never retry it. `Failed`
/// carries the ledger's message for the compatibility substring fallback.
#[derive(Debug, Clone, PartialEq)]
pub enum DeductionOutcome {
    Success { credits_deducted: Decimal },
    InsufficientFunds { message: String },
    Failed { message: String },
}

/// Credit ledger boundary.
///
/// INVARIANT: implementations must be idempotent per transaction id; the
/// retry wrapper may replay the whole pipeline after a failed status write.
#[async_trait]
pub trait CreditLedger: Send + Sync {
    async fn deduct(&self, request: &DeductionRequest) -> AppResult<DeductionOutcome>;
}
