//! Entitlement store
//!
//! Durable record of what each user is entitled to: tier, subscription
//! status, and the provider identifiers that webhook events are matched
//! against. Records are created at registration (free/none), never deleted,
//! and mutated only by the entitlement state machine via the webhook
//! ingestor.

use shelfscore_shared::{SubscriptionStatus, SubscriptionTier};
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};

/// One user's entitlement state
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EntitlementRecord {
    pub user_id: Uuid,
    pub tier: SubscriptionTier,
    pub subscription_status: SubscriptionStatus,
    pub current_period_end: Option<OffsetDateTime>,
    pub provider_subscription_id: Option<String>,
    pub provider_customer_id: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl EntitlementRecord {
    /// Fresh record for a newly registered user
    pub fn new_free(user_id: Uuid, now: OffsetDateTime) -> Self {
        Self {
            user_id,
            tier: SubscriptionTier::Free,
            subscription_status: SubscriptionStatus::None,
            current_period_end: None,
            provider_subscription_id: None,
            provider_customer_id: None,
            updated_at: now,
        }
    }

    /// Invariant: premium tier requires an active, past-due, or cancelled
    /// (still within paid period) subscription.
    pub fn invariant_holds(&self) -> bool {
        match self.tier {
            SubscriptionTier::Free => true,
            SubscriptionTier::Premium => matches!(
                self.subscription_status,
                SubscriptionStatus::Active
                    | SubscriptionStatus::PastDue
                    | SubscriptionStatus::Cancelled
            ),
        }
    }
}

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for EntitlementRecord {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;
        let tier: String = row.try_get("tier")?;
        let status: String = row.try_get("subscription_status")?;
        Ok(Self {
            user_id: row.try_get("user_id")?,
            tier: tier.parse().unwrap_or(SubscriptionTier::Free),
            subscription_status: status.parse().unwrap_or(SubscriptionStatus::None),
            current_period_end: row.try_get("current_period_end")?,
            provider_subscription_id: row.try_get("provider_subscription_id")?,
            provider_customer_id: row.try_get("provider_customer_id")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// sqlx-backed store for entitlement records
#[derive(Clone)]
pub struct EntitlementStore {
    pool: PgPool,
}

impl EntitlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create the initial free/none record for a user. Idempotent: an
    /// existing record is left untouched.
    pub async fn create_for_user(&self, user_id: Uuid) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO entitlements (user_id, tier, subscription_status, updated_at)
            VALUES ($1, 'free', 'none', NOW())
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load the entitlement record for a user
    pub async fn get(&self, user_id: Uuid) -> BillingResult<Option<EntitlementRecord>> {
        let record: Option<EntitlementRecord> = sqlx::query_as(
            r#"
            SELECT user_id, tier, subscription_status, current_period_end,
                   provider_subscription_id, provider_customer_id, updated_at
            FROM entitlements
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Find the entitlement owning a provider subscription id
    pub async fn find_by_subscription(
        &self,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<EntitlementRecord>> {
        let record: Option<EntitlementRecord> = sqlx::query_as(
            r#"
            SELECT user_id, tier, subscription_status, current_period_end,
                   provider_subscription_id, provider_customer_id, updated_at
            FROM entitlements
            WHERE provider_subscription_id = $1
            "#,
        )
        .bind(provider_subscription_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Persist a transitioned record inside an open transaction, so that
    /// entitlement and quota mutations from one webhook event commit or
    /// roll back together.
    pub async fn persist_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        record: &EntitlementRecord,
    ) -> BillingResult<()> {
        if !record.invariant_holds() {
            return Err(BillingError::Internal(format!(
                "entitlement invariant violated for user {}: tier={} status={}",
                record.user_id, record.tier, record.subscription_status
            )));
        }

        let updated = sqlx::query(
            r#"
            UPDATE entitlements
            SET tier = $2,
                subscription_status = $3,
                current_period_end = $4,
                provider_subscription_id = $5,
                provider_customer_id = $6,
                updated_at = NOW()
            WHERE user_id = $1
            "#,
        )
        .bind(record.user_id)
        .bind(record.tier.to_string())
        .bind(record.subscription_status.to_string())
        .bind(record.current_period_end)
        .bind(&record.provider_subscription_id)
        .bind(&record.provider_customer_id)
        .execute(&mut **tx)
        .await?;

        if updated.rows_affected() == 0 {
            return Err(BillingError::UserNotFound(record.user_id.to_string()));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_free_record() {
        let now = OffsetDateTime::now_utc();
        let record = EntitlementRecord::new_free(Uuid::new_v4(), now);
        assert_eq!(record.tier, SubscriptionTier::Free);
        assert_eq!(record.subscription_status, SubscriptionStatus::None);
        assert!(record.provider_subscription_id.is_none());
        assert!(record.invariant_holds());
    }

    #[test]
    fn test_invariant_rejects_premium_without_live_subscription() {
        let now = OffsetDateTime::now_utc();
        let mut record = EntitlementRecord::new_free(Uuid::new_v4(), now);
        record.tier = SubscriptionTier::Premium;
        record.subscription_status = SubscriptionStatus::None;
        assert!(!record.invariant_holds());

        record.subscription_status = SubscriptionStatus::Expired;
        assert!(!record.invariant_holds());

        for ok in [
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
        ] {
            record.subscription_status = ok;
            assert!(record.invariant_holds(), "premium + {} should hold", ok);
        }
    }
}
