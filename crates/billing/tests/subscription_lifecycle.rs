//! End-to-end lifecycle tests over the public decode + transition API.
//!
//! These drive the same path the webhook ingestor does — envelope decode
//! followed by the state machine — without needing a database.

#![allow(clippy::unwrap_used)]

use shelfscore_billing::state_machine::{apply, BillingEvent, SideEffect};
use shelfscore_billing::webhooks::{decode_event, WebhookEnvelope};
use shelfscore_billing::{BillingError, EntitlementRecord};
use shelfscore_shared::{SubscriptionStatus, SubscriptionTier};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

const USER: &str = "7f0a1f4e-8f3e-4b63-9f2e-1af0f8a9b001";

fn now() -> OffsetDateTime {
    OffsetDateTime::from_unix_timestamp(1_755_000_000).unwrap()
}

fn envelope(event_name: &str, attributes: &str) -> WebhookEnvelope {
    let payload = format!(
        r#"{{
            "meta": {{
                "event_id": "evt_{}",
                "event_name": "{}",
                "event_created_at": "2025-08-12T12:00:00Z"
            }},
            "data": {{"id": "sub_01", "attributes": {}}}
        }}"#,
        event_name, event_name, attributes
    );
    serde_json::from_str(&payload).unwrap()
}

fn decoded(event_name: &str, attributes: &str) -> BillingEvent {
    decode_event(&envelope(event_name, attributes)).unwrap()
}

#[test]
fn full_lifecycle_create_cancel_expire() {
    let user_id: Uuid = USER.parse().unwrap();
    let record = EntitlementRecord::new_free(user_id, now());

    // Checkout completes: the provider announces the new subscription.
    let created = decoded(
        "subscription_created",
        &format!(
            r#"{{"user_id": "{}", "customer_id": "cust_01", "renews_at": "2025-09-12T00:00:00Z"}}"#,
            USER
        ),
    );
    let t = apply(&record, &created, now()).unwrap();
    assert_eq!(t.record.tier, SubscriptionTier::Premium);
    assert_eq!(t.record.subscription_status, SubscriptionStatus::Active);
    assert!(t.effects.contains(&SideEffect::GrantUnlimitedQuotas));

    // The user cancels; premium rides out the paid period.
    let cancelled = decoded(
        "subscription_cancelled",
        r#"{"ends_at": "2025-09-12T00:00:00Z"}"#,
    );
    let t = apply(&t.record, &cancelled, now()).unwrap();
    assert_eq!(t.record.subscription_status, SubscriptionStatus::Cancelled);
    assert_eq!(t.record.tier, SubscriptionTier::Premium);

    // The paid period lapses.
    let expired = decoded("subscription_expired", "{}");
    let t = apply(&t.record, &expired, now() + Duration::days(31)).unwrap();
    assert_eq!(t.record.subscription_status, SubscriptionStatus::Expired);
    assert_eq!(t.record.tier, SubscriptionTier::Free);
    assert!(t.effects.contains(&SideEffect::ResetQuotasToFreeTier));
}

#[test]
fn cancel_then_resume_within_period() {
    let user_id: Uuid = USER.parse().unwrap();
    let record = EntitlementRecord::new_free(user_id, now());

    let created = decoded(
        "subscription_created",
        &format!(r#"{{"user_id": "{}", "renews_at": "2025-09-12T00:00:00Z"}}"#, USER),
    );
    let t = apply(&record, &created, now()).unwrap();

    let cancelled = decoded("subscription_cancelled", "{}");
    let t = apply(&t.record, &cancelled, now()).unwrap();

    let resumed = decoded("subscription_resumed", "{}");
    let t = apply(&t.record, &resumed, now() + Duration::days(1)).unwrap();
    assert_eq!(t.record.subscription_status, SubscriptionStatus::Active);
    assert_eq!(t.record.tier, SubscriptionTier::Premium);
    assert!(t.effects.is_empty());
}

#[test]
fn unmatched_subscription_is_surfaced_not_dropped() {
    let user_id: Uuid = USER.parse().unwrap();
    // A free record with no provider subscription on file.
    let record = EntitlementRecord::new_free(user_id, now());

    let expired = decoded("subscription_expired", "{}");
    let err = apply(&record, &expired, now()).unwrap_err();
    assert!(matches!(err, BillingError::UnknownSubscription(id) if id == "sub_01"));
}

#[test]
fn redundant_distinct_deliveries_converge() {
    // Two near-simultaneous deliveries with different event ids describing
    // the same transition: the second application must be a no-op.
    let user_id: Uuid = USER.parse().unwrap();
    let record = EntitlementRecord::new_free(user_id, now());

    let created = decoded(
        "subscription_created",
        &format!(r#"{{"user_id": "{}"}}"#, USER),
    );
    let first = apply(&record, &created, now()).unwrap();
    assert!(first.changed);

    let second = apply(&first.record, &created, now()).unwrap();
    assert!(!second.changed);
    assert!(second.effects.is_empty());
    assert_eq!(second.record.tier, first.record.tier);
    assert_eq!(second.record.subscription_status, first.record.subscription_status);
}

#[test]
fn out_of_order_payment_recovery_is_rejected_cleanly() {
    // payment_recovered arriving before any payment_failed: the record is
    // active, so the event is absorbed rather than corrupting state.
    let user_id: Uuid = USER.parse().unwrap();
    let record = EntitlementRecord::new_free(user_id, now());

    let created = decoded(
        "subscription_created",
        &format!(r#"{{"user_id": "{}"}}"#, USER),
    );
    let t = apply(&record, &created, now()).unwrap();

    let recovered = decoded("subscription_payment_recovered", "{}");
    let t2 = apply(&t.record, &recovered, now()).unwrap();
    assert!(!t2.changed);
    assert_eq!(t2.record.subscription_status, SubscriptionStatus::Active);
}
