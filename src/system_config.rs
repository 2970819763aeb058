use crate::error::AppResult;
use async_trait::async_trait;
use sqlx::PgPool;
use tracing::warn;

/// Well-known configuration keys.
pub mod keys {
    /// Absolute sweep cutoff (RFC 3339 or bare local date-time)
    pub const BILLING_PROCESS_SINCE_TIME: &str = "billing.process.since_time";
    /// Relative sweep window in hours
    pub const BILLING_PROCESS_SINCE_HOURS: &str = "billing.process.since_hours";
}

/// Runtime-tunable key/value configuration store.
#[async_trait]
pub trait SystemConfigStore: Send + Sync {
    /// Absent keys return None
    async fn get_string(&self, key: &str) -> AppResult<Option<String>>;

    /// Non-numeric values are treated as absent, not fatal
    async fn get_int(&self, key: &str) -> AppResult<Option<i64>>;
}

pub struct PgSystemConfigStore {
    pool: PgPool,
}

impl PgSystemConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SystemConfigStore for PgSystemConfigStore {
    async fn get_string(&self, key: &str) -> AppResult<Option<String>> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM system_config WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await?;

        Ok(value)
    }

    async fn get_int(&self, key: &str) -> AppResult<Option<i64>> {
        let raw = self.get_string(key).await?;

        Ok(raw.and_then(|v| match v.trim().parse::<i64>() {
            Ok(n) => Some(n),
            Err(_) => {
                warn!("ignoring non-numeric system config value for {key}: {v}");
                None
            }
        }))
    }
}
