//! Shelfscore API server

use std::sync::Arc;

use shelfscore_api::{routes, AppState, Config};
use shelfscore_api::auth::JwtVerifier;
use shelfscore_api::scoring::RemoteScoringBackend;
use shelfscore_billing::{
    BillingConfig, BillingEmailService, EntitlementStore, LimitTable, LockService, LockSettings,
    QuotaLedger, WebhookIngestor,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "shelfscore_api=info,shelfscore_billing=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let billing_config = BillingConfig::from_env()?;
    let limits = LimitTable::from_env();

    // Database
    let pool =
        shelfscore_shared::create_pool(&config.database_url, config.database_max_connections)
            .await?;
    let migration_pool = shelfscore_shared::create_migration_pool(&config.database_url).await?;
    shelfscore_shared::run_migrations(&migration_pool).await?;
    migration_pool.close().await;
    tracing::info!("Database migrations applied");

    // Lock service (falls back to in-memory when Redis is unreachable)
    let locks = LockService::connect(
        &config.redis_url,
        LockSettings {
            ttl_ms: billing_config.lock_ttl_ms,
            acquire_attempts: billing_config.lock_acquire_attempts,
            retry_delay_ms: billing_config.lock_retry_delay_ms,
        },
    )
    .await;

    // Services, constructed once and injected
    let email = BillingEmailService::from_env();
    let quota = QuotaLedger::new(pool.clone(), locks, limits);
    let ingestor = Arc::new(WebhookIngestor::new(
        pool.clone(),
        email,
        limits,
        &billing_config,
    ));
    let entitlements = EntitlementStore::new(pool.clone());

    let state = AppState {
        pool,
        quota,
        ingestor,
        entitlements,
        scoring: Arc::new(RemoteScoringBackend::new(config.scoring_service_url.clone())),
        jwt: JwtVerifier::new(&config.jwt_secret),
    };

    let app = routes::create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!(address = %config.bind_address, "Shelfscore API listening");
    axum::serve(listener, app).await?;

    Ok(())
}
