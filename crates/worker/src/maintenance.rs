//! Maintenance jobs
//!
//! Retention sweeps over the control plane's append-only tables. None of
//! this affects correctness: processed webhook ids only need to outlive the
//! provider's retry horizon, and usage events are analytics.

use shelfscore_billing::IdempotencyLog;
use sqlx::PgPool;
use tracing::{error, info};

/// Purge finalized webhook event records past the retention window
pub async fn cleanup_webhook_events(pool: &PgPool, retention_days: i64) {
    let log = IdempotencyLog::new(pool.clone());
    match log.purge_older_than(retention_days).await {
        Ok(deleted) if deleted > 0 => {
            info!(
                deleted,
                retention_days, "Cleaned up old webhook event records"
            );
        }
        Ok(_) => {}
        Err(e) => {
            error!(error = %e, "Failed to cleanup webhook event records");
        }
    }
}

/// Purge usage events past the analytics retention window
pub async fn cleanup_usage_events(pool: &PgPool, retention_days: i64) {
    let result = sqlx::query(
        r#"
        DELETE FROM usage_events
        WHERE created_at < NOW() - ($1 || ' days')::INTERVAL
        "#,
    )
    .bind(retention_days.to_string())
    .execute(pool)
    .await;

    match result {
        Ok(rows) => {
            if rows.rows_affected() > 0 {
                info!(
                    deleted = rows.rows_affected(),
                    retention_days, "Cleaned up old usage events"
                );
            }
        }
        Err(e) => {
            error!(error = %e, "Failed to cleanup usage events");
        }
    }
}
