use super::{CreditLedger, DeductionOutcome, DeductionRequest};
use crate::billing::models::AiFeature;
use crate::error::AppResult;
use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::PgPool;
use std::collections::HashMap;
use tracing::info;

/// Credits charged per 1000 tokens, by feature.
#[derive(Debug, Clone)]
pub struct CreditRateTable {
    rates: HashMap<AiFeature, Decimal>,
    default_rate: Decimal,
}

impl Default for CreditRateTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert(AiFeature::NovelGeneration, dec!(1.5));
        rates.insert(AiFeature::TextExpansion, dec!(1.2));
        rates.insert(AiFeature::AiChat, dec!(0.5));

        Self {
            rates,
            default_rate: dec!(1.0),
        }
    }
}

impl CreditRateTable {
    pub fn rate(&self, feature: AiFeature) -> Decimal {
        self.rates.get(&feature).copied().unwrap_or(self.default_rate)
    }

    /// Credit cost for a deduction: (input + output) / 1000 * per-feature rate.
    pub fn cost(&self, feature: AiFeature, input_tokens: i32, output_tokens: i32) -> Decimal {
        let total = Decimal::from(input_tokens as i64 + output_tokens as i64);
        (total / dec!(1000) * self.rate(feature)).round_dp(8)
    }
}

/// Postgres-backed credit ledger.
///
/// The deduction is recorded in `ledger_entries` keyed by transaction id
/// before the balance moves, inside one database transaction; a replayed
/// request hits the key conflict and reports the prior result.
pub struct PgCreditLedger {
    pool: PgPool,
    rates: CreditRateTable,
}

impl PgCreditLedger {
    pub fn new(pool: PgPool, rates: CreditRateTable) -> Self {
        Self { pool, rates }
    }
}

#[async_trait]
impl CreditLedger for PgCreditLedger {
    async fn deduct(&self, request: &DeductionRequest) -> AppResult<DeductionOutcome> {
        let cost = self
            .rates
            .cost(request.feature, request.input_tokens, request.output_tokens);

        let mut db_tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO ledger_entries (transaction_id, user_id, credits)
            VALUES ($1, $2, $3)
            ON CONFLICT (transaction_id) DO NOTHING
            "#,
        )
        .bind(request.transaction_id)
        .bind(&request.user_id)
        .bind(cost)
        .execute(&mut *db_tx)
        .await?;

        if inserted.rows_affected() == 0 {
            db_tx.rollback().await?;
            let prior: Decimal = sqlx::query_scalar(
                "SELECT credits FROM ledger_entries WHERE transaction_id = $1",
            )
            .bind(request.transaction_id)
            .fetch_one(&self.pool)
            .await?;

            info!(
                transaction_id = %request.transaction_id,
                "deduction already recorded, treating as success"
            );
            return Ok(DeductionOutcome::Success {
                credits_deducted: prior,
            });
        }

        let updated = sqlx::query(
            r#"
            UPDATE user_credits
            SET balance = balance - $2, updated_at = NOW()
            WHERE user_id = $1 AND balance >= $2
            "#,
        )
        .bind(&request.user_id)
        .bind(cost)
        .execute(&mut *db_tx)
        .await?;

        if updated.rows_affected() == 0 {
            db_tx.rollback().await?;

            let balance: Option<Decimal> =
                sqlx::query_scalar("SELECT balance FROM user_credits WHERE user_id = $1")
                    .bind(&request.user_id)
                    .fetch_optional(&self.pool)
                    .await?;

            return Ok(match balance {
                Some(balance) => DeductionOutcome::InsufficientFunds {
                    message: format!(
                        "insufficient credits: required {cost}, available {balance}"
                    ),
                },
                None => DeductionOutcome::Failed {
                    message: format!("no credit account for user {}", request.user_id),
                },
            });
        }

        db_tx.commit().await?;

        info!(
            transaction_id = %request.transaction_id,
            user_id = %request.user_id,
            feature = %request.feature,
            "deducted {} credits ({} in / {} out tokens)",
            cost, request.input_tokens, request.output_tokens
        );

        Ok(DeductionOutcome::Success {
            credits_deducted: cost,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cost_scales_with_tokens_and_rate() {
        let rates = CreditRateTable::default();

        // 1000 tokens at the default rate costs exactly one credit
        assert_eq!(rates.cost(AiFeature::TextSummary, 600, 400), dec!(1.0));

        // Per-feature rate applies
        assert_eq!(rates.cost(AiFeature::NovelGeneration, 1000, 1000), dec!(3.0));
        assert_eq!(rates.cost(AiFeature::AiChat, 100, 100), dec!(0.1));
    }

    #[test]
    fn unlisted_features_use_default_rate() {
        let rates = CreditRateTable::default();
        assert_eq!(rates.rate(AiFeature::SceneBeatGeneration), dec!(1.0));
        assert_eq!(rates.rate(AiFeature::SettingGeneration), dec!(1.0));
    }

    #[test]
    fn zero_tokens_cost_nothing() {
        let rates = CreditRateTable::default();
        assert_eq!(rates.cost(AiFeature::AiChat, 0, 0), dec!(0));
    }
}
