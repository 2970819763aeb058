//! Pure pipeline stages: everything here transforms values and returns a
//! tagged result, leaving all I/O to the engine.

use super::estimator;
use crate::billing::models::{keys, AiFeature, BillingMode, CreditTransaction};
use crate::trace::models::{LlmTrace, TaggedSources};

/// Check the fields without which a transaction can never be compensated.
pub fn validate_integrity(tx: &CreditTransaction) -> Result<(), String> {
    if !tx.has_required_fields() {
        return Err("transaction is missing required fields (user_id/feature_tag)".to_string());
    }
    Ok(())
}

/// Map the stored feature tag to the closed feature set.
pub fn resolve_feature(tx: &CreditTransaction) -> Result<AiFeature, String> {
    AiFeature::parse(&tx.feature_tag)
        .ok_or_else(|| format!("unknown feature tag: {}", tx.feature_tag))
}

/// Resolve provider and model identifiers, backfilling missing values from
/// the trace: top-level fields first, then the request's provider-specific
/// map, then the response's. First non-blank value wins per field.
pub fn resolve_identity(
    tx: &CreditTransaction,
    trace: Option<&LlmTrace>,
) -> (Option<String>, Option<String>) {
    let provider = TaggedSources::new()
        .push("transaction", tx.provider.as_deref())
        .push("trace", trace.and_then(|t| t.provider.as_deref()))
        .push(
            "request.providerSpecific",
            trace.and_then(|t| t.request_provider_specific(keys::PROVIDER)),
        )
        .push(
            "response.providerSpecific",
            trace.and_then(|t| t.response_provider_specific(keys::PROVIDER)),
        )
        .resolve()
        .map(|(_, value)| value.to_string());

    let model_id = TaggedSources::new()
        .push("transaction", tx.model_id.as_deref())
        .push("trace", trace.and_then(|t| t.model.as_deref()))
        .push(
            "request.providerSpecific",
            trace.and_then(|t| t.request_provider_specific(keys::MODEL_ID)),
        )
        .push(
            "response.providerSpecific",
            trace.and_then(|t| t.response_provider_specific(keys::MODEL_ID)),
        )
        .resolve()
        .map(|(_, value)| value.to_string());

    (provider, model_id)
}

/// Token counts and billing mode recovered for the ledger call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedUsage {
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub billing_mode: BillingMode,
}

impl ResolvedUsage {
    pub fn estimated(&self) -> bool {
        self.billing_mode == BillingMode::Estimated
    }
}

/// Recover usage in priority order: stored counts, trace usage metadata,
/// heuristic estimate. Non-positive counts after all fallbacks are a hard
/// failure for this cycle; the ledger is never called with zero usage.
pub fn reconstruct_usage(
    tx: &CreditTransaction,
    trace: Option<&LlmTrace>,
    feature: AiFeature,
) -> Result<ResolvedUsage, String> {
    let stored_in = tx.input_tokens.unwrap_or(0);
    let stored_out = tx.output_tokens.unwrap_or(0);

    let usage = if stored_in > 0 || stored_out > 0 {
        ResolvedUsage {
            input_tokens: stored_in,
            output_tokens: stored_out,
            billing_mode: BillingMode::Actual,
        }
    } else if let Some(real) = trace.and_then(|t| t.response_token_usage()) {
        ResolvedUsage {
            input_tokens: real.input_token_count.unwrap_or(0),
            output_tokens: real.output_token_count.unwrap_or(0),
            billing_mode: BillingMode::Actual,
        }
    } else {
        let input_tokens = estimator::estimate_input_tokens(trace);
        ResolvedUsage {
            input_tokens,
            output_tokens: estimator::estimate_output_tokens(trace, input_tokens, feature),
            billing_mode: BillingMode::Estimated,
        }
    };

    if usage.input_tokens <= 0 && usage.output_tokens <= 0 {
        return Err("unable to recover token usage; trace missing or empty".to_string());
    }

    Ok(usage)
}

/// Compatibility fallback: classify ledger failure text as an
/// insufficient-funds rejection. Matches the known phrase and its Chinese
/// translation, case-insensitively.
pub fn is_insufficient_funds_message(message: &str) -> bool {
    message.contains("积分余额不足") || message.to_lowercase().contains("insufficient")
}
