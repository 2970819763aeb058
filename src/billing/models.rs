use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;
use sqlx::Type;
use std::fmt;
use uuid::Uuid;

/// Keys probed inside provider-specific trace maps when backfilling
/// identifiers onto a transaction.
pub mod keys {
    pub const PROVIDER: &str = "provider";
    pub const MODEL_ID: &str = "modelId";
}

/// Transaction status enum
///
/// INVARIANT: once a transaction reaches Invalid, NoFunds or Compensated it is
/// never re-processed by the sweep. Pending and Failed are the only
/// re-enterable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[sqlx(type_name = "transaction_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionStatus {
    Pending,
    Failed,
    Invalid,
    NoFunds,
    Compensated,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "PENDING",
            TransactionStatus::Failed => "FAILED",
            TransactionStatus::Invalid => "INVALID",
            TransactionStatus::NoFunds => "NO_FUNDS",
            TransactionStatus::Compensated => "COMPENSATED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Invalid | TransactionStatus::NoFunds | TransactionStatus::Compensated
        )
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Whether the token counts behind a deduction are authoritative or derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "billing_mode", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingMode {
    Actual,
    Estimated,
}

/// Closed set of AI operations a transaction can bill for.
///
/// The wire form is the SCREAMING_SNAKE_CASE tag stored on the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AiFeature {
    TextExpansion,
    TextSummary,
    SceneToSummary,
    TextRefactor,
    NovelGeneration,
    AiChat,
    SettingGeneration,
    SceneBeatGeneration,
}

impl AiFeature {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiFeature::TextExpansion => "TEXT_EXPANSION",
            AiFeature::TextSummary => "TEXT_SUMMARY",
            AiFeature::SceneToSummary => "SCENE_TO_SUMMARY",
            AiFeature::TextRefactor => "TEXT_REFACTOR",
            AiFeature::NovelGeneration => "NOVEL_GENERATION",
            AiFeature::AiChat => "AI_CHAT",
            AiFeature::SettingGeneration => "SETTING_GENERATION",
            AiFeature::SceneBeatGeneration => "SCENE_BEAT_GENERATION",
        }
    }

    /// Parse a stored feature tag. Unknown tags are a permanent data fault.
    pub fn parse(tag: &str) -> Option<Self> {
        match tag {
            "TEXT_EXPANSION" => Some(AiFeature::TextExpansion),
            "TEXT_SUMMARY" => Some(AiFeature::TextSummary),
            "SCENE_TO_SUMMARY" => Some(AiFeature::SceneToSummary),
            "TEXT_REFACTOR" => Some(AiFeature::TextRefactor),
            "NOVEL_GENERATION" => Some(AiFeature::NovelGeneration),
            "AI_CHAT" => Some(AiFeature::AiChat),
            "SETTING_GENERATION" => Some(AiFeature::SettingGeneration),
            "SCENE_BEAT_GENERATION" => Some(AiFeature::SceneBeatGeneration),
            _ => None,
        }
    }
}

impl fmt::Display for AiFeature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Credit deduction attempt created by the synchronous billing path.
///
/// The sweep only reads these records and advances their status; it never
/// creates new ones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: String,
    /// String form of [`AiFeature`]
    pub feature_tag: String,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub input_tokens: Option<i32>,
    pub output_tokens: Option<i32>,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub credits_deducted: Option<Decimal>,
    pub billing_mode: Option<BillingMode>,
    pub estimated: bool,
    pub status: TransactionStatus,
    pub error_message: Option<String>,
    pub trace_id: Option<String>,
    /// Nullable: legacy rows exist without a creation time
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// A transaction missing a non-blank user id or feature tag can never be
    /// compensated and must be parked as Invalid.
    pub fn has_required_fields(&self) -> bool {
        !self.user_id.trim().is_empty() && !self.feature_tag.trim().is_empty()
    }

    /// Candidate predicate for the sweep: re-enterable status, and created at
    /// or after the window. Records without a creation time are always
    /// included, conservatively.
    pub fn is_sweep_candidate(&self, since: Option<DateTime<Utc>>) -> bool {
        if !matches!(self.status, TransactionStatus::Pending | TransactionStatus::Failed) {
            return false;
        }
        match (since, self.created_at) {
            (Some(since), Some(created)) => created >= since,
            _ => true,
        }
    }

    /// Advance the status. Every write path goes through here so that
    /// `updated_at` is always refreshed.
    pub fn touch(&mut self, status: TransactionStatus, error_message: Option<String>) {
        self.status = status;
        self.error_message = error_message;
        self.updated_at = Utc::now();
    }
}
