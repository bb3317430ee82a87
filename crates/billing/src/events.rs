//! Billing audit events and usage records
//!
//! Append-only logging of control-plane decisions: entitlement transitions,
//! quota denials, and per-admission usage events. The audit trail answers
//! "why is this user on this tier?" after the fact; usage events feed
//! analytics. Both are best-effort writes that must never block the
//! operation that produced them.

use serde::{Deserialize, Serialize};
use shelfscore_shared::ResourceType;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::BillingResult;

/// Types of billing audit events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditEventType {
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionCancelled,
    SubscriptionResumed,
    SubscriptionExpired,
    PaymentFailed,
    PaymentRecovered,
    TierChanged,
    QuotaDenied,
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuditEventType::SubscriptionCreated => "SUBSCRIPTION_CREATED",
            AuditEventType::SubscriptionUpdated => "SUBSCRIPTION_UPDATED",
            AuditEventType::SubscriptionCancelled => "SUBSCRIPTION_CANCELLED",
            AuditEventType::SubscriptionResumed => "SUBSCRIPTION_RESUMED",
            AuditEventType::SubscriptionExpired => "SUBSCRIPTION_EXPIRED",
            AuditEventType::PaymentFailed => "PAYMENT_FAILED",
            AuditEventType::PaymentRecovered => "PAYMENT_RECOVERED",
            AuditEventType::TierChanged => "TIER_CHANGED",
            AuditEventType::QuotaDenied => "QUOTA_DENIED",
        };
        write!(f, "{}", s)
    }
}

/// Builder for audit events
pub struct AuditEventBuilder {
    user_id: Uuid,
    event_type: AuditEventType,
    event_data: serde_json::Value,
    provider_event_id: Option<String>,
    provider_subscription_id: Option<String>,
}

impl AuditEventBuilder {
    pub fn new(user_id: Uuid, event_type: AuditEventType) -> Self {
        Self {
            user_id,
            event_type,
            event_data: serde_json::json!({}),
            provider_event_id: None,
            provider_subscription_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.event_data = data;
        self
    }

    pub fn provider_event(mut self, event_id: impl Into<String>) -> Self {
        self.provider_event_id = Some(event_id.into());
        self
    }

    pub fn provider_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.provider_subscription_id = Some(subscription_id.into());
        self
    }
}

/// Service for writing audit and usage records
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append an audit event without blocking the caller
    pub fn log_event_detached(&self, builder: AuditEventBuilder) {
        let logger = self.clone();
        tokio::spawn(async move {
            let user_id = builder.user_id;
            if let Err(e) = logger.log_event(builder).await {
                tracing::warn!(user_id = %user_id, error = %e, "Failed to log audit event");
            }
        });
    }

    /// Append an audit event
    pub async fn log_event(&self, builder: AuditEventBuilder) -> BillingResult<Uuid> {
        let event_id: (Uuid,) = sqlx::query_as(
            r#"
            INSERT INTO billing_events (
                user_id, event_type, event_data, provider_event_id, provider_subscription_id
            )
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(builder.user_id)
        .bind(builder.event_type.to_string())
        .bind(&builder.event_data)
        .bind(&builder.provider_event_id)
        .bind(&builder.provider_subscription_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(event_id.0)
    }

    /// Append a usage event for one admission decision
    pub async fn record_usage(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        allowed: bool,
        used: i64,
        limit_value: i64,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            INSERT INTO usage_events (user_id, resource_type, allowed, used, limit_value)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(user_id)
        .bind(resource.to_string())
        .bind(allowed)
        .bind(used)
        .bind(limit_value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record usage without blocking the caller. Failures are logged and
    /// dropped; admission must never wait on analytics.
    pub fn record_usage_detached(
        &self,
        user_id: Uuid,
        resource: ResourceType,
        allowed: bool,
        used: i64,
        limit_value: i64,
    ) {
        let logger = self.clone();
        tokio::spawn(async move {
            if let Err(e) = logger
                .record_usage(user_id, resource, allowed, used, limit_value)
                .await
            {
                tracing::warn!(
                    user_id = %user_id,
                    resource = %resource,
                    error = %e,
                    "Failed to record usage event"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_type_display() {
        assert_eq!(AuditEventType::SubscriptionCreated.to_string(), "SUBSCRIPTION_CREATED");
        assert_eq!(AuditEventType::QuotaDenied.to_string(), "QUOTA_DENIED");
        assert_eq!(AuditEventType::TierChanged.to_string(), "TIER_CHANGED");
    }

    #[test]
    fn test_event_builder() {
        let user_id = Uuid::new_v4();
        let builder = AuditEventBuilder::new(user_id, AuditEventType::TierChanged)
            .data(serde_json::json!({"from": "free", "to": "premium"}))
            .provider_subscription("sub_123");

        assert_eq!(builder.user_id, user_id);
        assert_eq!(builder.event_type, AuditEventType::TierChanged);
        assert_eq!(builder.provider_subscription_id, Some("sub_123".to_string()));
        assert!(builder.provider_event_id.is_none());
    }
}
