//! Idempotency log for webhook events
//!
//! Durable record of processed provider event ids. The provider delivers
//! at least once, so the same event id may arrive any number of times and
//! concurrently; claiming is a single `INSERT ... ON CONFLICT DO NOTHING`
//! so exactly one delivery wins the right to process.
//!
//! A claim is finalized once processing succeeds and released (deleted) when
//! it fails, so the provider's retry re-attempts the event instead of being
//! swallowed. Finalized records are garbage-collected after a retention
//! window without affecting correctness.

use sqlx::PgPool;
use time::OffsetDateTime;

use crate::error::BillingResult;

/// Outcome of trying to claim an event id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller holds exclusive processing rights
    Acquired,
    /// The event id was already claimed (processed, or in flight elsewhere)
    AlreadyProcessed,
}

/// A finalized idempotency record
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IdempotencyRecord {
    pub event_id: String,
    pub event_type: String,
    pub outcome: String,
    pub processed_at: OffsetDateTime,
}

/// sqlx-backed idempotency log
#[derive(Clone)]
pub struct IdempotencyLog {
    pool: PgPool,
}

impl IdempotencyLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// Only one concurrent caller gets `Acquired`; everyone else sees
    /// `AlreadyProcessed` regardless of arrival order.
    pub async fn claim(&self, event_id: &str, event_type: &str) -> BillingResult<Claim> {
        let claimed: Option<(String,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events (event_id, event_type, outcome, processed_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO NOTHING
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(if claimed.is_some() {
            Claim::Acquired
        } else {
            Claim::AlreadyProcessed
        })
    }

    /// Record the final outcome of a successfully processed event
    pub async fn finalize(&self, event_id: &str, outcome: &str) -> BillingResult<()> {
        sqlx::query(
            "UPDATE webhook_events SET outcome = $2, processed_at = NOW() WHERE event_id = $1",
        )
        .bind(event_id)
        .bind(outcome)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Drop a claim after failed processing so the provider retry is
    /// re-attempted. Only in-flight claims are released; finalized records
    /// stay put.
    pub async fn release(&self, event_id: &str) -> BillingResult<()> {
        sqlx::query("DELETE FROM webhook_events WHERE event_id = $1 AND outcome = 'processing'")
            .bind(event_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Look up a finalized record
    pub async fn get(&self, event_id: &str) -> BillingResult<Option<IdempotencyRecord>> {
        let record: Option<IdempotencyRecord> = sqlx::query_as(
            r#"
            SELECT event_id, event_type, outcome, processed_at
            FROM webhook_events
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Delete finalized records older than the retention window.
    /// Returns how many were removed.
    pub async fn purge_older_than(&self, retention_days: i64) -> BillingResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM webhook_events
            WHERE processed_at < NOW() - ($1 || ' days')::INTERVAL
              AND outcome <> 'processing'
            "#,
        )
        .bind(retention_days.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_claim_is_exclusive() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = shelfscore_shared::create_pool(&url, 3).await.expect("pool");
        let log = IdempotencyLog::new(pool);

        let event_id = format!("evt_{}", uuid::Uuid::new_v4());
        assert_eq!(log.claim(&event_id, "subscription_created").await.unwrap(), Claim::Acquired);
        assert_eq!(
            log.claim(&event_id, "subscription_created").await.unwrap(),
            Claim::AlreadyProcessed
        );

        // Released claims can be re-claimed (provider retry path).
        log.release(&event_id).await.unwrap();
        assert_eq!(log.claim(&event_id, "subscription_created").await.unwrap(), Claim::Acquired);

        // Finalized claims cannot.
        log.finalize(&event_id, "success").await.unwrap();
        log.release(&event_id).await.unwrap();
        assert_eq!(
            log.claim(&event_id, "subscription_created").await.unwrap(),
            Claim::AlreadyProcessed
        );
    }
}
