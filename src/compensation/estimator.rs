use crate::billing::models::AiFeature;
use crate::trace::models::LlmTrace;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Rough token estimate for a text blob: one token per ~2.5 characters,
/// splitting the difference between CJK (~1 char/token) and English
/// (~4 chars/token). Blank text yields 0, anything else at least 1.
pub fn rough_token_estimate(text: &str) -> i32 {
    if text.trim().is_empty() {
        return 0;
    }
    let len = text.chars().count() as f64;
    ((len / 2.5).ceil() as i32).max(1)
}

/// Output multiplier applied when neither real usage metadata nor response
/// content is available. Exact decimals: binary floats misrepresent these
/// ratios (100 * 1.1 lands just above 110) and ceil would over-count.
pub fn output_multiplier(feature: AiFeature) -> Decimal {
    match feature {
        AiFeature::TextExpansion => dec!(1.5),
        AiFeature::TextSummary | AiFeature::SceneToSummary => dec!(0.3),
        AiFeature::TextRefactor => dec!(1.1),
        AiFeature::NovelGeneration => dec!(2.0),
        AiFeature::AiChat => dec!(0.8),
        _ => dec!(1.0),
    }
}

/// Estimate input tokens from the request message contents, floored at 1.
pub fn estimate_input_tokens(trace: Option<&LlmTrace>) -> i32 {
    let sum: i32 = trace
        .map(|t| {
            t.request
                .messages
                .iter()
                .filter_map(|m| m.content.as_deref())
                .map(rough_token_estimate)
                .sum()
        })
        .unwrap_or(0);

    sum.max(1)
}

/// Estimate output tokens: the actual response content when present,
/// otherwise the feature multiplier applied to the input estimate.
pub fn estimate_output_tokens(
    trace: Option<&LlmTrace>,
    input_tokens: i32,
    feature: AiFeature,
) -> i32 {
    if let Some(content) = trace.and_then(|t| t.response_content()) {
        if !content.trim().is_empty() {
            return rough_token_estimate(content);
        }
    }

    (Decimal::from(input_tokens) * output_multiplier(feature))
        .ceil()
        .to_i32()
        .unwrap_or(i32::MAX)
}
