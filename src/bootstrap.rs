use std::sync::Arc;
use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use crate::billing::repository::PgTransactionStore;
use crate::compensation::{CompensationEngine, SweepScheduler};
use crate::config::Config;
use crate::credit::{CreditRateTable, PgCreditLedger};
use crate::error::AppResult;
use crate::system_config::PgSystemConfigStore;
use crate::trace::store::PgTraceStore;

/// Wire the database pool, run migrations and assemble the sweep scheduler.
pub async fn initialize(config: &Config) -> AppResult<SweepScheduler> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await?;
    info!("✓ Database pool established");

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("✓ Migrations applied");

    let engine = CompensationEngine::new(
        Arc::new(PgTransactionStore::new(pool.clone())),
        Arc::new(PgTraceStore::new(pool.clone())),
        Arc::new(PgCreditLedger::new(pool.clone(), CreditRateTable::default())),
        Arc::new(PgSystemConfigStore::new(pool)),
    )
    .with_concurrency(config.sweep_concurrency);

    info!(
        "✓ Compensation engine ready (concurrency: {}, cadence: {}s)",
        config.sweep_concurrency, config.sweep_interval_secs
    );

    Ok(SweepScheduler::new(
        Arc::new(engine),
        Duration::from_secs(config.sweep_interval_secs),
    ))
}
