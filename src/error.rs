use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Compensation error: {0}")]
    Compensation(#[from] CompensationError),

    #[error("Trace store error: {0}")]
    Trace(#[from] TraceError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether the per-transaction retry wrapper should re-attempt after this error.
    ///
    /// Only transient faults re-enter the retry loop; permanent data faults and
    /// business rejections are terminal by the time they surface as errors.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Database(_) => true,
            AppError::Compensation(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Faults raised by the compensation pipeline, one variant per class
/// of failure the sweep distinguishes.
#[derive(Error, Debug)]
pub enum CompensationError {
    #[error("transaction has permanently invalid data: {0}")]
    PermanentData(String),

    #[error("no usable token counts after all fallbacks: {0}")]
    UsageUnavailable(String),

    #[error("deduction rejected by the ledger: {0}")]
    BusinessRejection(String),

    #[error("transient compensation failure: {0}")]
    Transient(String),
}

impl CompensationError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, CompensationError::Transient(_))
    }
}

/// Trace lookup errors
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("more than one trace shares trace id {0}")]
    DuplicateTraceId(String),

    #[error("malformed trace payload: {0}")]
    Malformed(String),
}

impl From<anyhow::Error> for AppError {
    fn from(error: anyhow::Error) -> Self {
        AppError::Internal(format!("Error converting: {:?}", error))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(error: config::ConfigError) -> Self {
        AppError::Config(error.to_string())
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
