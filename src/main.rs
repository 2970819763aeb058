mod billing;
mod bootstrap;
mod compensation;
mod config;
mod credit;
mod error;
mod system_config;
mod trace;

use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sweeper=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = config::Config::from_env()?;
    info!("🚀 Starting billing compensation sweeper");

    let scheduler = bootstrap::initialize(&config).await?;
    let handle = scheduler.start();
    info!(
        "✓ Sweep scheduler running every {}s",
        config.sweep_interval_secs
    );

    handle.await?;
    Ok(())
}
