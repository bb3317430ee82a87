//! Webhook ingestion
//!
//! Validates inbound billing events (signature, freshness), deduplicates
//! them against the idempotency log, and dispatches them through the
//! entitlement state machine.
//!
//! The provider signs the raw payload bytes with HMAC-SHA256; verification
//! happens before any parsing, and rejected payloads are never echoed into
//! logs. Parsing produces a tagged `BillingEvent` union exactly once at this
//! boundary; event kinds we do not know are acknowledged as ignored so the
//! provider does not retry them forever.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use sqlx::PgPool;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::config::{BillingConfig, LimitTable};
use crate::email::BillingEmailService;
use crate::entitlement::EntitlementStore;
use crate::error::{BillingError, BillingResult};
use crate::events::{AuditEventBuilder, AuditEventType, BillingEventLogger};
use crate::idempotency::{Claim, IdempotencyLog};
use crate::quota;
use crate::state_machine::{self, BillingEvent, SideEffect};

type HmacSha256 = Hmac<Sha256>;

/// Provider event envelope: `{meta: {...}, data: {id, attributes}}`
#[derive(Debug, Deserialize)]
pub struct WebhookEnvelope {
    pub meta: EventMeta,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventMeta {
    /// Delivery-unique event id, the idempotency key
    pub event_id: String,
    pub event_name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub event_created_at: OffsetDateTime,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    /// The provider's subscription id for subscription events
    pub id: String,
    #[serde(default)]
    pub attributes: EventAttributes,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventAttributes {
    /// Our user id, echoed back from checkout custom data
    pub user_id: Option<Uuid>,
    pub customer_id: Option<String>,
    pub status: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub renews_at: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub ends_at: Option<OffsetDateTime>,
}

/// Ingestion outcome reported back to the transport layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Success,
    AlreadyProcessed,
    Ignored,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestResult {
    pub status: IngestStatus,
}

impl IngestResult {
    fn of(status: IngestStatus) -> Self {
        Self { status }
    }
}

/// Verify the provider's HMAC-SHA256 hex signature over the raw payload.
/// Comparison is constant-time.
pub fn verify_signature(payload: &[u8], signature_hex: &str, secret: &str) -> BillingResult<()> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::Config("invalid webhook secret".to_string()))?;
    mac.update(payload);
    let expected = mac.finalize().into_bytes();

    let provided = hex::decode(signature_hex.trim()).map_err(|_| BillingError::InvalidSignature)?;

    if expected.as_slice().ct_eq(provided.as_slice()).into() {
        Ok(())
    } else {
        Err(BillingError::InvalidSignature)
    }
}

/// Reject events outside the anti-replay window. The window is symmetric to
/// tolerate minor clock skew between us and the provider.
pub fn ensure_fresh(
    event_created_at: OffsetDateTime,
    now: OffsetDateTime,
    window_secs: i64,
) -> BillingResult<()> {
    let age_seconds = (now - event_created_at).whole_seconds();
    if age_seconds.abs() > window_secs {
        return Err(BillingError::StaleEvent { age_seconds });
    }
    Ok(())
}

/// Decode a verified envelope into the closed event union
pub fn decode_event(envelope: &WebhookEnvelope) -> BillingResult<BillingEvent> {
    let subscription_id = envelope.data.id.clone();
    let attributes = &envelope.data.attributes;

    let event = match envelope.meta.event_name.as_str() {
        "subscription_created" => BillingEvent::SubscriptionCreated {
            subscription_id,
            customer_id: attributes.customer_id.clone(),
            user_id: attributes.user_id.ok_or_else(|| {
                BillingError::MalformedEvent(
                    "subscription_created without a user reference".to_string(),
                )
            })?,
            renews_at: attributes.renews_at,
        },
        "subscription_updated" => BillingEvent::SubscriptionUpdated {
            subscription_id,
            status: attributes.status.as_deref().and_then(|s| s.parse().ok()),
            renews_at: attributes.renews_at,
        },
        "subscription_cancelled" => BillingEvent::SubscriptionCancelled {
            subscription_id,
            ends_at: attributes.ends_at,
        },
        "subscription_resumed" => BillingEvent::SubscriptionResumed { subscription_id },
        "subscription_expired" => BillingEvent::SubscriptionExpired { subscription_id },
        "subscription_payment_failed" => BillingEvent::PaymentFailed { subscription_id },
        "subscription_payment_recovered" => BillingEvent::PaymentRecovered { subscription_id },
        other => BillingEvent::Unknown {
            event_name: other.to_string(),
        },
    };

    Ok(event)
}

fn audit_type(event: &BillingEvent) -> Option<AuditEventType> {
    match event {
        BillingEvent::SubscriptionCreated { .. } => Some(AuditEventType::SubscriptionCreated),
        BillingEvent::SubscriptionUpdated { .. } => Some(AuditEventType::SubscriptionUpdated),
        BillingEvent::SubscriptionCancelled { .. } => Some(AuditEventType::SubscriptionCancelled),
        BillingEvent::SubscriptionResumed { .. } => Some(AuditEventType::SubscriptionResumed),
        BillingEvent::SubscriptionExpired { .. } => Some(AuditEventType::SubscriptionExpired),
        BillingEvent::PaymentFailed { .. } => Some(AuditEventType::PaymentFailed),
        BillingEvent::PaymentRecovered { .. } => Some(AuditEventType::PaymentRecovered),
        BillingEvent::Unknown { .. } => None,
    }
}

/// Webhook ingestor: verify, dedupe, dispatch
pub struct WebhookIngestor {
    pool: PgPool,
    entitlements: EntitlementStore,
    idempotency: IdempotencyLog,
    email: BillingEmailService,
    event_logger: BillingEventLogger,
    limits: LimitTable,
    webhook_secret: String,
    replay_window_secs: i64,
}

impl WebhookIngestor {
    pub fn new(
        pool: PgPool,
        email: BillingEmailService,
        limits: LimitTable,
        config: &BillingConfig,
    ) -> Self {
        Self {
            entitlements: EntitlementStore::new(pool.clone()),
            idempotency: IdempotencyLog::new(pool.clone()),
            event_logger: BillingEventLogger::new(pool.clone()),
            pool,
            email,
            limits,
            webhook_secret: config.webhook_secret.clone(),
            replay_window_secs: config.replay_window_secs,
        }
    }

    /// Ingest one raw webhook delivery.
    ///
    /// Side effects of an event occur at most once even though the provider
    /// may deliver it any number of times: duplicate event ids report
    /// `already_processed`, and a failed dispatch leaves no idempotency
    /// record so the provider's retry re-attempts it.
    pub async fn ingest(&self, payload: &str, signature: &str) -> BillingResult<IngestResult> {
        verify_signature(payload.as_bytes(), signature, &self.webhook_secret)?;

        // Parse only after the signature held.
        let envelope: WebhookEnvelope = serde_json::from_str(payload)
            .map_err(|e| BillingError::MalformedEvent(e.to_string()))?;

        let now = OffsetDateTime::now_utc();
        ensure_fresh(envelope.meta.event_created_at, now, self.replay_window_secs)?;

        let event = decode_event(&envelope)?;
        let event_id = envelope.meta.event_id.as_str();

        if let BillingEvent::Unknown { event_name } = &event {
            tracing::info!(
                event_id = %event_id,
                event_name = %event_name,
                "Unhandled provider event kind - acknowledging without processing"
            );
            return Ok(IngestResult::of(IngestStatus::Ignored));
        }

        match self.idempotency.claim(event_id, event.name()).await? {
            Claim::AlreadyProcessed => {
                tracing::info!(
                    event_id = %event_id,
                    event_name = %event.name(),
                    "Duplicate webhook event - idempotency log hit"
                );
                return Ok(IngestResult::of(IngestStatus::AlreadyProcessed));
            }
            Claim::Acquired => {}
        }

        match self.apply_event(&envelope, &event, now).await {
            Ok(()) => {
                if let Err(e) = self.idempotency.finalize(event_id, "success").await {
                    // The claim row still dedupes; only the outcome label is lost.
                    tracing::error!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to finalize idempotency record"
                    );
                }
                tracing::info!(
                    event_id = %event_id,
                    event_name = %event.name(),
                    "Webhook event processed"
                );
                Ok(IngestResult::of(IngestStatus::Success))
            }
            Err(e) => {
                // Drop the claim so the provider retry is re-attempted.
                if let Err(release_err) = self.idempotency.release(event_id).await {
                    tracing::error!(
                        event_id = %event_id,
                        error = %release_err,
                        "Failed to release idempotency claim after error"
                    );
                }
                Err(e)
            }
        }
    }

    /// Resolve the target entitlement, run the state machine, and persist
    /// the transition atomically with its quota effects.
    async fn apply_event(
        &self,
        envelope: &WebhookEnvelope,
        event: &BillingEvent,
        now: OffsetDateTime,
    ) -> BillingResult<()> {
        let record = match event {
            BillingEvent::SubscriptionCreated { user_id, subscription_id, .. } => self
                .entitlements
                .get(*user_id)
                .await?
                .ok_or_else(|| BillingError::UnknownSubscription(subscription_id.clone()))?,
            other => {
                let subscription_id = other.subscription_id().unwrap_or_default();
                self.entitlements
                    .find_by_subscription(subscription_id)
                    .await?
                    .ok_or_else(|| BillingError::UnknownSubscription(subscription_id.to_string()))?
            }
        };

        let previous_tier = record.tier;
        let transition = state_machine::apply(&record, event, now)?;

        if !transition.changed {
            tracing::info!(
                user_id = %record.user_id,
                event_name = %event.name(),
                "Redundant webhook event absorbed without mutation"
            );
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        self.entitlements.persist_in_tx(&mut tx, &transition.record).await?;
        for effect in &transition.effects {
            match effect {
                SideEffect::GrantUnlimitedQuotas => {
                    quota::apply_unlimited_grant(&mut tx, record.user_id).await?;
                }
                SideEffect::ResetQuotasToFreeTier => {
                    quota::apply_free_tier_reset(&mut tx, record.user_id, &self.limits).await?;
                }
                // Notifications run after commit, off the request path.
                _ => {}
            }
        }
        tx.commit().await?;

        self.log_audit(envelope, event, &record.user_id, previous_tier, &transition.record.tier)
            .await;
        self.dispatch_notifications(record.user_id, transition.effects);

        tracing::info!(
            user_id = %record.user_id,
            event_name = %event.name(),
            status = %transition.record.subscription_status,
            tier = %transition.record.tier,
            "Entitlement transitioned"
        );

        Ok(())
    }

    async fn log_audit(
        &self,
        envelope: &WebhookEnvelope,
        event: &BillingEvent,
        user_id: &Uuid,
        previous_tier: shelfscore_shared::SubscriptionTier,
        new_tier: &shelfscore_shared::SubscriptionTier,
    ) {
        let Some(audit_type) = audit_type(event) else {
            return;
        };

        let mut builder = AuditEventBuilder::new(*user_id, audit_type)
            .data(serde_json::json!({
                "from_tier": previous_tier.to_string(),
                "to_tier": new_tier.to_string(),
            }))
            .provider_event(&envelope.meta.event_id);
        if let Some(subscription_id) = event.subscription_id() {
            builder = builder.provider_subscription(subscription_id);
        }

        if let Err(e) = self.event_logger.log_event(builder).await {
            tracing::warn!(user_id = %user_id, error = %e, "Failed to log billing audit event");
        }

        if previous_tier != *new_tier {
            self.event_logger.log_event_detached(
                AuditEventBuilder::new(*user_id, AuditEventType::TierChanged).data(
                    serde_json::json!({
                        "from_tier": previous_tier.to_string(),
                        "to_tier": new_tier.to_string(),
                        "cause": event.name(),
                    }),
                ),
            );
        }
    }

    /// Run notification side effects asynchronously; failures are logged,
    /// never surfaced to the provider.
    fn dispatch_notifications(&self, user_id: Uuid, effects: Vec<SideEffect>) {
        let wants_email = effects.iter().any(|e| {
            matches!(
                e,
                SideEffect::SendWelcomeEmail
                    | SideEffect::SendCancellationNotice { .. }
                    | SideEffect::SendPaymentFailedNotice
                    | SideEffect::SendDowngradeNotice
            )
        });
        if !wants_email {
            return;
        }

        let email = self.email.clone();
        let pool = self.pool.clone();
        tokio::spawn(async move {
            let row: Result<Option<(String,)>, sqlx::Error> =
                sqlx::query_as("SELECT email FROM users WHERE id = $1")
                    .bind(user_id)
                    .fetch_optional(&pool)
                    .await;

            let to = match row {
                Ok(Some((email,))) => email,
                Ok(None) => {
                    tracing::warn!(user_id = %user_id, "No user row for notification email");
                    return;
                }
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Failed to look up user email");
                    return;
                }
            };

            for effect in effects {
                let result = match effect {
                    SideEffect::SendWelcomeEmail => email.send_premium_welcome(&to).await,
                    SideEffect::SendCancellationNotice { ends_at } => {
                        email.send_subscription_cancelled(&to, ends_at).await
                    }
                    SideEffect::SendPaymentFailedNotice => email.send_payment_failed(&to).await,
                    SideEffect::SendDowngradeNotice => email.send_downgraded_to_free(&to).await,
                    _ => Ok(false),
                };
                if let Err(e) = result {
                    tracing::warn!(user_id = %user_id, error = %e, "Notification send failed");
                }
            }
        });
    }
}
