//! Shelfscore maintenance worker
//!
//! Runs scheduled retention sweeps against the billing control plane.

mod maintenance;

use shelfscore_billing::BillingConfig;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "shelfscore_worker=info,shelfscore_billing=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL not set"))?;
    let billing_config = BillingConfig::from_env()?;

    let pool = shelfscore_shared::create_pool(&database_url, 3).await?;

    let scheduler = JobScheduler::new().await?;

    // Hourly retention sweep over processed webhook event ids
    {
        let pool = pool.clone();
        let retention_days = billing_config.idempotency_retention_days;
        scheduler
            .add(Job::new_async("0 15 * * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    maintenance::cleanup_webhook_events(&pool, retention_days).await;
                })
            })?)
            .await?;
    }

    // Daily sweep over aged usage events
    {
        let pool = pool.clone();
        let retention_days = billing_config.usage_retention_days;
        scheduler
            .add(Job::new_async("0 30 4 * * *", move |_uuid, _lock| {
                let pool = pool.clone();
                Box::pin(async move {
                    maintenance::cleanup_usage_events(&pool, retention_days).await;
                })
            })?)
            .await?;
    }

    scheduler.start().await?;
    tracing::info!("Shelfscore worker started");

    // Keep the process alive until terminated.
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shelfscore worker shutting down");

    Ok(())
}
