//! Quota ledger
//!
//! Decides whether to admit a metered operation for a user, applies the
//! lazy period-reset policy, and records consumption atomically.
//!
//! ## Concurrency
//!
//! Operations on the same `(user, resource)` counter are serialized by a
//! short-lived lease from the lock service. The lease is an optimization,
//! not the correctness mechanism: the compare-and-increment is a single
//! conditional `UPDATE` at the storage layer, so even in the lock service's
//! fail-open degraded mode a counter can never exceed its limit.
//!
//! ## Period resets
//!
//! Resets are self-healing on read rather than scheduler-driven: whenever a
//! counter is consulted past its `period_reset_at`, it is zeroed and the
//! reset time advances to the next boundary computed from *now*, so any
//! number of skipped periods is corrected in one step.

use serde::Serialize;
use shelfscore_shared::{PeriodKind, ResourceType, SubscriptionTier};
use sqlx::{PgPool, Postgres, Transaction};
use time::{Duration, OffsetDateTime, Time};
use uuid::Uuid;

use crate::config::{LimitTable, UNLIMITED};
use crate::error::{BillingError, BillingResult};
use crate::events::{AuditEventBuilder, AuditEventType, BillingEventLogger};
use crate::lock::LockService;

/// Admission decision for one resource
#[derive(Debug, Clone, Serialize)]
pub struct Admission {
    pub allowed: bool,
    pub used: i64,
    pub limit: i64,
    /// `-1` when the limit is unlimited
    pub remaining: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_at: OffsetDateTime,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub requires_upgrade: bool,
}

impl Admission {
    /// Admission after a successful consume; `used` already includes it
    fn granted(used: i64, limit: i64, reset_at: OffsetDateTime) -> Self {
        Self {
            allowed: true,
            used,
            limit,
            remaining: if limit == UNLIMITED { UNLIMITED } else { limit - used },
            reset_at,
            requires_upgrade: false,
        }
    }

    /// Denial at the limit; the counter was not touched
    fn denied(used: i64, limit: i64, reset_at: OffsetDateTime) -> Self {
        Self {
            allowed: false,
            used,
            limit,
            remaining: 0,
            reset_at,
            requires_upgrade: true,
        }
    }

    /// Read-only view of a counter (no consumption)
    fn snapshot(used: i64, limit: i64, reset_at: OffsetDateTime) -> Self {
        let allowed = limit == UNLIMITED || used < limit;
        Self {
            allowed,
            used,
            limit,
            remaining: if limit == UNLIMITED { UNLIMITED } else { (limit - used).max(0) },
            reset_at,
            requires_upgrade: !allowed,
        }
    }
}

/// Per-resource quota view for one user
#[derive(Debug, Clone, Serialize)]
pub struct QuotaStatus {
    pub scan: Admission,
    pub ai_question: Admission,
    pub export: Admission,
}

/// Compute the next reset boundary after `now` for a period kind:
/// next-day midnight UTC for daily, first-of-next-month midnight UTC for
/// monthly.
pub fn next_reset(now: OffsetDateTime, kind: PeriodKind) -> BillingResult<OffsetDateTime> {
    match kind {
        PeriodKind::Daily => Ok(now.replace_time(Time::MIDNIGHT) + Duration::days(1)),
        PeriodKind::Monthly => {
            let start_of_month = now
                .replace_day(1)
                .map_err(|e| BillingError::Internal(format!("period boundary: {}", e)))?
                .replace_time(Time::MIDNIGHT);
            let next = (start_of_month + Duration::days(32))
                .replace_day(1)
                .map_err(|e| BillingError::Internal(format!("period boundary: {}", e)))?
                .replace_time(Time::MIDNIGHT);
            Ok(next)
        }
    }
}

fn lease_key(user_id: Uuid, resource: ResourceType) -> String {
    format!("quota:{}:{}", user_id, resource)
}

/// The quota ledger service
#[derive(Clone)]
pub struct QuotaLedger {
    pool: PgPool,
    locks: LockService,
    limits: LimitTable,
    events: BillingEventLogger,
}

impl QuotaLedger {
    pub fn new(pool: PgPool, locks: LockService, limits: LimitTable) -> Self {
        Self {
            events: BillingEventLogger::new(pool.clone()),
            pool,
            locks,
            limits,
        }
    }

    async fn tier_for(&self, user_id: Uuid) -> BillingResult<SubscriptionTier> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tier FROM entitlements WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let (tier,) = row.ok_or_else(|| BillingError::UserNotFound(user_id.to_string()))?;
        Ok(tier.parse().unwrap_or(SubscriptionTier::Free))
    }

    /// Admit or reject one unit of consumption for `(user, resource)`.
    ///
    /// Fails with `UserNotFound` when the user has no entitlement record and
    /// `QuotaBusy` when the lease stayed contended; the latter is a
    /// backpressure signal the caller retries at its own layer.
    pub async fn check_and_consume(
        &self,
        user_id: Uuid,
        resource: ResourceType,
    ) -> BillingResult<Admission> {
        let tier = self.tier_for(user_id).await?;
        let limit = self.limits.limit_for(tier, resource);

        let key = lease_key(user_id, resource);
        if !self.locks.acquire_with_retry(&key).await {
            tracing::debug!(user_id = %user_id, resource = %resource, "Quota lease contended");
            return Err(BillingError::QuotaBusy { resource });
        }

        let result = self.consume_under_lease(user_id, resource, limit).await;
        self.locks.release(&key).await;
        let admission = result?;

        self.events
            .record_usage_detached(user_id, resource, admission.allowed, admission.used, admission.limit);

        if !admission.allowed {
            tracing::info!(
                user_id = %user_id,
                resource = %resource,
                used = admission.used,
                limit = admission.limit,
                "Quota exhausted"
            );
            self.events.log_event_detached(
                AuditEventBuilder::new(user_id, AuditEventType::QuotaDenied).data(
                    serde_json::json!({
                        "resource": resource.to_string(),
                        "used": admission.used,
                        "limit": admission.limit,
                    }),
                ),
            );
        }

        Ok(admission)
    }

    async fn consume_under_lease(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        limit: i64,
    ) -> BillingResult<Admission> {
        let now = OffsetDateTime::now_utc();
        let kind = resource.period_kind();
        let fresh_reset = next_reset(now, kind)?;

        // Counters are created lazily on first consumption attempt.
        sqlx::query(
            r#"
            INSERT INTO quota_counters (user_id, resource_type, period_kind, used, limit_value, period_reset_at)
            VALUES ($1, $2, $3, 0, $4, $5)
            ON CONFLICT (user_id, resource_type) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(resource.to_string())
        .bind(kind.to_string())
        .bind(limit)
        .bind(fresh_reset)
        .execute(&self.pool)
        .await?;

        // Self-healing reset: the condition makes this idempotent under
        // concurrent callers, and computing the boundary from `now` absorbs
        // any number of skipped periods.
        sqlx::query(
            r#"
            UPDATE quota_counters
            SET used = 0, period_reset_at = $3, period_kind = $4, updated_at = NOW()
            WHERE user_id = $1 AND resource_type = $2 AND period_reset_at <= $5
            "#,
        )
        .bind(user_id)
        .bind(resource.to_string())
        .bind(fresh_reset)
        .bind(kind.to_string())
        .bind(now)
        .execute(&self.pool)
        .await?;

        // Atomic compare-and-increment. Unlimited counters still advance so
        // analytics keep a usage trail.
        let consumed: Option<(i64, OffsetDateTime)> = sqlx::query_as(
            r#"
            UPDATE quota_counters
            SET used = used + 1, limit_value = $3, updated_at = NOW()
            WHERE user_id = $1 AND resource_type = $2 AND ($3 = -1 OR used < $3)
            RETURNING used, period_reset_at
            "#,
        )
        .bind(user_id)
        .bind(resource.to_string())
        .bind(limit)
        .fetch_optional(&self.pool)
        .await?;

        match consumed {
            Some((used, reset_at)) => Ok(Admission::granted(used, limit, reset_at)),
            None => {
                let (used, reset_at): (i64, OffsetDateTime) = sqlx::query_as(
                    r#"
                    SELECT used, period_reset_at FROM quota_counters
                    WHERE user_id = $1 AND resource_type = $2
                    "#,
                )
                .bind(user_id)
                .bind(resource.to_string())
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| {
                    BillingError::Internal(format!(
                        "quota counter vanished for {} {}",
                        user_id, resource
                    ))
                })?;

                Ok(Admission::denied(used, limit, reset_at))
            }
        }
    }

    /// Read-only per-resource quota view, applying the same lazy-reset
    /// check without consuming.
    pub async fn status(&self, user_id: Uuid) -> BillingResult<QuotaStatus> {
        let tier = self.tier_for(user_id).await?;
        let now = OffsetDateTime::now_utc();

        Ok(QuotaStatus {
            scan: self.status_for(user_id, tier, ResourceType::Scan, now).await?,
            ai_question: self.status_for(user_id, tier, ResourceType::AiQuestion, now).await?,
            export: self.status_for(user_id, tier, ResourceType::Export, now).await?,
        })
    }

    async fn status_for(
        &self,
        user_id: Uuid,
        tier: SubscriptionTier,
        resource: ResourceType,
        now: OffsetDateTime,
    ) -> BillingResult<Admission> {
        let limit = self.limits.limit_for(tier, resource);
        let kind = resource.period_kind();

        let row: Option<(i64, OffsetDateTime)> = sqlx::query_as(
            r#"
            SELECT used, period_reset_at FROM quota_counters
            WHERE user_id = $1 AND resource_type = $2
            "#,
        )
        .bind(user_id)
        .bind(resource.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(Admission::snapshot(0, limit, next_reset(now, kind)?)),
            Some((_, reset_at)) if now >= reset_at => {
                // Read-repair a counter that slept through its boundary.
                let fresh_reset = next_reset(now, kind)?;
                sqlx::query(
                    r#"
                    UPDATE quota_counters
                    SET used = 0, period_reset_at = $3, updated_at = NOW()
                    WHERE user_id = $1 AND resource_type = $2 AND period_reset_at <= $4
                    "#,
                )
                .bind(user_id)
                .bind(resource.to_string())
                .bind(fresh_reset)
                .bind(now)
                .execute(&self.pool)
                .await?;

                Ok(Admission::snapshot(0, limit, fresh_reset))
            }
            Some((used, reset_at)) => Ok(Admission::snapshot(used, limit, reset_at)),
        }
    }
}

/// Stamp every existing counter unlimited (subscription upgrade effect)
pub async fn apply_unlimited_grant(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
) -> BillingResult<()> {
    sqlx::query(
        "UPDATE quota_counters SET limit_value = -1, updated_at = NOW() WHERE user_id = $1",
    )
    .bind(user_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

/// Clamp every counter back to the free-tier limit table (expiry effect).
/// `used` is clamped down too so the counter invariant survives the shrink.
pub async fn apply_free_tier_reset(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    limits: &LimitTable,
) -> BillingResult<()> {
    for resource in ResourceType::ALL {
        let limit = limits.limit_for(SubscriptionTier::Free, resource);
        if limit == UNLIMITED {
            sqlx::query(
                r#"
                UPDATE quota_counters SET limit_value = $3, updated_at = NOW()
                WHERE user_id = $1 AND resource_type = $2
                "#,
            )
            .bind(user_id)
            .bind(resource.to_string())
            .bind(limit)
            .execute(&mut **tx)
            .await?;
        } else {
            sqlx::query(
                r#"
                UPDATE quota_counters
                SET limit_value = $3, used = LEAST(used, $3), updated_at = NOW()
                WHERE user_id = $1 AND resource_type = $2
                "#,
            )
            .bind(user_id)
            .bind(resource.to_string())
            .bind(limit)
            .execute(&mut **tx)
            .await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_daily_reset_is_next_midnight() {
        let now = datetime!(2025-06-15 14:30:00 UTC);
        let reset = next_reset(now, PeriodKind::Daily).unwrap();
        assert_eq!(reset, datetime!(2025-06-16 00:00:00 UTC));
    }

    #[test]
    fn test_daily_reset_at_midnight_advances_a_full_day() {
        let now = datetime!(2025-06-15 00:00:00 UTC);
        let reset = next_reset(now, PeriodKind::Daily).unwrap();
        assert_eq!(reset, datetime!(2025-06-16 00:00:00 UTC));
    }

    #[test]
    fn test_monthly_reset_is_first_of_next_month() {
        let now = datetime!(2025-06-15 14:30:00 UTC);
        let reset = next_reset(now, PeriodKind::Monthly).unwrap();
        assert_eq!(reset, datetime!(2025-07-01 00:00:00 UTC));
    }

    #[test]
    fn test_monthly_reset_rolls_over_the_year() {
        let now = datetime!(2025-12-31 23:59:59 UTC);
        let reset = next_reset(now, PeriodKind::Monthly).unwrap();
        assert_eq!(reset, datetime!(2026-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_monthly_reset_from_january_31() {
        let now = datetime!(2025-01-31 08:00:00 UTC);
        let reset = next_reset(now, PeriodKind::Monthly).unwrap();
        assert_eq!(reset, datetime!(2025-02-01 00:00:00 UTC));
    }

    #[test]
    fn test_granted_admission_math() {
        let reset = datetime!(2025-07-01 00:00:00 UTC);
        let admission = Admission::granted(30, 30, reset);
        assert!(admission.allowed);
        assert_eq!(admission.remaining, 0);
        assert!(!admission.requires_upgrade);

        let unlimited = Admission::granted(1_000, UNLIMITED, reset);
        assert!(unlimited.allowed);
        assert_eq!(unlimited.remaining, UNLIMITED);
    }

    #[test]
    fn test_denied_admission_math() {
        let reset = datetime!(2025-07-01 00:00:00 UTC);
        let admission = Admission::denied(30, 30, reset);
        assert!(!admission.allowed);
        assert_eq!(admission.remaining, 0);
        assert_eq!(admission.used, 30);
        assert!(admission.requires_upgrade);
    }

    #[test]
    fn test_snapshot_admission_math() {
        let reset = datetime!(2025-07-01 00:00:00 UTC);
        let open = Admission::snapshot(12, 30, reset);
        assert!(open.allowed);
        assert_eq!(open.remaining, 18);

        let exhausted = Admission::snapshot(30, 30, reset);
        assert!(!exhausted.allowed);
        assert_eq!(exhausted.remaining, 0);
        assert!(exhausted.requires_upgrade);

        // A counter whose limit shrank below its usage never reports
        // negative remaining.
        let shrunk = Admission::snapshot(45, 30, reset);
        assert!(!shrunk.allowed);
        assert_eq!(shrunk.remaining, 0);
    }

    #[test]
    fn test_lease_key_is_per_user_per_resource() {
        let user = Uuid::new_v4();
        assert_ne!(
            lease_key(user, ResourceType::Scan),
            lease_key(user, ResourceType::Export)
        );
        assert_ne!(
            lease_key(user, ResourceType::Scan),
            lease_key(Uuid::new_v4(), ResourceType::Scan)
        );
    }

    #[tokio::test]
    #[ignore] // Requires database
    async fn test_check_and_consume_against_live_db() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL required");
        let pool = shelfscore_shared::create_pool(&url, 3).await.expect("pool");
        let ledger = QuotaLedger::new(
            pool.clone(),
            LockService::new_in_memory(Default::default()),
            LimitTable::with_free_limits(2, 0, 1),
        );

        let user_id = Uuid::new_v4();
        sqlx::query("INSERT INTO users (id, email) VALUES ($1, $2)")
            .bind(user_id)
            .bind(format!("{}@example.com", user_id))
            .execute(&pool)
            .await
            .expect("user");
        crate::entitlement::EntitlementStore::new(pool.clone())
            .create_for_user(user_id)
            .await
            .expect("entitlement");

        let first = ledger.check_and_consume(user_id, ResourceType::Scan).await.unwrap();
        assert!(first.allowed);
        let second = ledger.check_and_consume(user_id, ResourceType::Scan).await.unwrap();
        assert!(second.allowed);
        assert_eq!(second.remaining, 0);
        let third = ledger.check_and_consume(user_id, ResourceType::Scan).await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.used, 2);
    }
}
