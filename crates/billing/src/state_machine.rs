//! Entitlement state machine
//!
//! Pure transition logic mapping (current entitlement, billing event) to a
//! new entitlement record plus side-effect instructions. No I/O happens
//! here; the webhook ingestor persists the result and runs the effects.
//!
//! Status graph:
//!
//! ```text
//! none -> active -> {past_due, cancelled} -> expired
//! past_due -> active            (payment recovered)
//! cancelled -> active           (resumed, only before current_period_end)
//! expired -> active             (only via a fresh subscription_created)
//! ```
//!
//! Webhook deliveries are at-least-once and unordered, and near-simultaneous
//! duplicate deliveries may carry distinct event ids. Transitions that would
//! land on the state the record is already in are therefore absorbed as
//! no-ops instead of rejected, so redundant deliveries neither error nor
//! repeat their side effects.

use shelfscore_shared::{SubscriptionStatus, SubscriptionTier};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::entitlement::EntitlementRecord;
use crate::error::{BillingError, BillingResult};

/// A billing provider event, decoded once at the ingestor boundary
#[derive(Debug, Clone, PartialEq)]
pub enum BillingEvent {
    SubscriptionCreated {
        subscription_id: String,
        customer_id: Option<String>,
        user_id: Uuid,
        renews_at: Option<OffsetDateTime>,
    },
    SubscriptionUpdated {
        subscription_id: String,
        status: Option<SubscriptionStatus>,
        renews_at: Option<OffsetDateTime>,
    },
    SubscriptionCancelled {
        subscription_id: String,
        ends_at: Option<OffsetDateTime>,
    },
    SubscriptionResumed {
        subscription_id: String,
    },
    SubscriptionExpired {
        subscription_id: String,
    },
    PaymentFailed {
        subscription_id: String,
    },
    PaymentRecovered {
        subscription_id: String,
    },
    /// Forward compatibility: an event kind we do not handle
    Unknown {
        event_name: String,
    },
}

impl BillingEvent {
    /// The subscription id the event targets, if it targets one
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::SubscriptionCreated { subscription_id, .. }
            | Self::SubscriptionUpdated { subscription_id, .. }
            | Self::SubscriptionCancelled { subscription_id, .. }
            | Self::SubscriptionResumed { subscription_id }
            | Self::SubscriptionExpired { subscription_id }
            | Self::PaymentFailed { subscription_id }
            | Self::PaymentRecovered { subscription_id } => Some(subscription_id),
            Self::Unknown { .. } => None,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::SubscriptionCreated { .. } => "subscription_created",
            Self::SubscriptionUpdated { .. } => "subscription_updated",
            Self::SubscriptionCancelled { .. } => "subscription_cancelled",
            Self::SubscriptionResumed { .. } => "subscription_resumed",
            Self::SubscriptionExpired { .. } => "subscription_expired",
            Self::PaymentFailed { .. } => "subscription_payment_failed",
            Self::PaymentRecovered { .. } => "subscription_payment_recovered",
            Self::Unknown { event_name } => event_name,
        }
    }
}

/// Instructions the ingestor executes after persisting a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SideEffect {
    /// Stamp every existing counter unlimited
    GrantUnlimitedQuotas,
    /// Clamp every counter back to the free-tier limit table
    ResetQuotasToFreeTier,
    SendWelcomeEmail,
    SendCancellationNotice { ends_at: Option<OffsetDateTime> },
    SendPaymentFailedNotice,
    SendDowngradeNotice,
}

/// Result of applying one event to one record
#[derive(Debug, Clone)]
pub struct Transition {
    pub record: EntitlementRecord,
    pub effects: Vec<SideEffect>,
    /// False when the event was absorbed as a redundant delivery
    pub changed: bool,
}

impl Transition {
    fn unchanged(record: EntitlementRecord) -> Self {
        Self {
            record,
            effects: Vec::new(),
            changed: false,
        }
    }
}

fn invalid(record: &EntitlementRecord, event: &BillingEvent) -> BillingError {
    BillingError::InvalidTransition {
        from: record.subscription_status.to_string(),
        event: event.name().to_string(),
    }
}

/// Apply one event to one entitlement record.
///
/// The caller has already resolved `record` from the event payload's stated
/// subscription id (or, for `subscription_created`, its user reference);
/// the id is re-checked here so a mis-resolved record can never transition.
pub fn apply(
    record: &EntitlementRecord,
    event: &BillingEvent,
    now: OffsetDateTime,
) -> BillingResult<Transition> {
    use SubscriptionStatus as S;

    // Events other than created must target the record's own subscription.
    if !matches!(event, BillingEvent::SubscriptionCreated { .. } | BillingEvent::Unknown { .. }) {
        let target = event.subscription_id().unwrap_or_default();
        match record.provider_subscription_id.as_deref() {
            Some(own) if own == target => {}
            _ => return Err(BillingError::UnknownSubscription(target.to_string())),
        }
    }

    let mut next = record.clone();
    next.updated_at = now;

    match event {
        BillingEvent::SubscriptionCreated {
            subscription_id,
            customer_id,
            renews_at,
            ..
        } => {
            // Redundant delivery of a creation we already applied.
            if record.subscription_status == S::Active
                && record.provider_subscription_id.as_deref() == Some(subscription_id)
            {
                return Ok(Transition::unchanged(next));
            }

            next.tier = SubscriptionTier::Premium;
            next.subscription_status = S::Active;
            next.provider_subscription_id = Some(subscription_id.clone());
            next.provider_customer_id = customer_id.clone();
            next.current_period_end = *renews_at;

            Ok(Transition {
                record: next,
                effects: vec![SideEffect::GrantUnlimitedQuotas, SideEffect::SendWelcomeEmail],
                changed: true,
            })
        }

        BillingEvent::SubscriptionUpdated { status, renews_at, .. } => {
            if let Some(renews_at) = renews_at {
                next.current_period_end = Some(*renews_at);
            }
            if let Some(status) = status {
                next.subscription_status = *status;
            }
            // Only a fresh subscription_created leaves the expired state.
            if record.subscription_status == S::Expired
                && next.subscription_status != S::Expired
            {
                return Err(invalid(record, event));
            }
            // A payload that reports the subscription gone downgrades the tier.
            if next.subscription_status == S::Expired {
                next.tier = SubscriptionTier::Free;
                if record.subscription_status == S::Expired && record.tier == SubscriptionTier::Free {
                    return Ok(Transition::unchanged(next));
                }
                return Ok(Transition {
                    record: next,
                    effects: vec![SideEffect::ResetQuotasToFreeTier, SideEffect::SendDowngradeNotice],
                    changed: true,
                });
            }

            let changed = next.subscription_status != record.subscription_status
                || next.current_period_end != record.current_period_end;
            Ok(Transition {
                record: next,
                effects: Vec::new(),
                changed,
            })
        }

        BillingEvent::SubscriptionCancelled { ends_at, .. } => match record.subscription_status {
            S::Cancelled => Ok(Transition::unchanged(next)),
            S::Active | S::PastDue => {
                next.subscription_status = S::Cancelled;
                if let Some(ends_at) = ends_at {
                    next.current_period_end = Some(*ends_at);
                }
                // Grace period: premium is retained until current_period_end.
                let effects = vec![SideEffect::SendCancellationNotice {
                    ends_at: next.current_period_end,
                }];
                Ok(Transition {
                    record: next,
                    effects,
                    changed: true,
                })
            }
            _ => Err(invalid(record, event)),
        },

        BillingEvent::SubscriptionResumed { .. } => match record.subscription_status {
            S::Active => Ok(Transition::unchanged(next)),
            S::Cancelled => {
                // Resumption is only honored while the paid period is still
                // running; past that point the subscription must be recreated.
                if let Some(period_end) = record.current_period_end {
                    if now >= period_end {
                        return Err(invalid(record, event));
                    }
                }
                next.subscription_status = S::Active;
                Ok(Transition {
                    record: next,
                    effects: Vec::new(),
                    changed: true,
                })
            }
            _ => Err(invalid(record, event)),
        },

        BillingEvent::SubscriptionExpired { .. } => match record.subscription_status {
            S::Expired => Ok(Transition::unchanged(next)),
            S::Cancelled | S::PastDue => {
                next.subscription_status = S::Expired;
                next.tier = SubscriptionTier::Free;
                Ok(Transition {
                    record: next,
                    effects: vec![SideEffect::ResetQuotasToFreeTier, SideEffect::SendDowngradeNotice],
                    changed: true,
                })
            }
            _ => Err(invalid(record, event)),
        },

        BillingEvent::PaymentFailed { .. } => match record.subscription_status {
            S::PastDue => Ok(Transition::unchanged(next)),
            S::Active => {
                next.subscription_status = S::PastDue;
                Ok(Transition {
                    record: next,
                    effects: vec![SideEffect::SendPaymentFailedNotice],
                    changed: true,
                })
            }
            _ => Err(invalid(record, event)),
        },

        BillingEvent::PaymentRecovered { .. } => match record.subscription_status {
            S::Active => Ok(Transition::unchanged(next)),
            S::PastDue => {
                next.subscription_status = S::Active;
                Ok(Transition {
                    record: next,
                    effects: Vec::new(),
                    changed: true,
                })
            }
            _ => Err(invalid(record, event)),
        },

        BillingEvent::Unknown { event_name } => Err(BillingError::MalformedEvent(format!(
            "unknown event dispatched to state machine: {}",
            event_name
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    const SUB: &str = "sub_01";

    fn now() -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(1_755_000_000).unwrap()
    }

    fn free_record() -> EntitlementRecord {
        EntitlementRecord::new_free(Uuid::new_v4(), now())
    }

    fn premium_record(status: SubscriptionStatus) -> EntitlementRecord {
        let mut record = free_record();
        record.tier = SubscriptionTier::Premium;
        record.subscription_status = status;
        record.provider_subscription_id = Some(SUB.to_string());
        record.provider_customer_id = Some("cust_01".to_string());
        record.current_period_end = Some(now() + Duration::days(14));
        record
    }

    fn created_event(user_id: Uuid) -> BillingEvent {
        BillingEvent::SubscriptionCreated {
            subscription_id: SUB.to_string(),
            customer_id: Some("cust_01".to_string()),
            user_id,
            renews_at: Some(now() + Duration::days(30)),
        }
    }

    #[test]
    fn test_created_upgrades_to_premium() {
        let record = free_record();
        let transition = apply(&record, &created_event(record.user_id), now()).unwrap();

        assert!(transition.changed);
        assert_eq!(transition.record.tier, SubscriptionTier::Premium);
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(transition.record.provider_subscription_id.as_deref(), Some(SUB));
        assert!(transition.effects.contains(&SideEffect::GrantUnlimitedQuotas));
        assert!(transition.effects.contains(&SideEffect::SendWelcomeEmail));
        assert!(transition.record.invariant_holds());
    }

    #[test]
    fn test_created_is_absorbed_when_already_active() {
        let record = premium_record(SubscriptionStatus::Active);
        let transition = apply(&record, &created_event(record.user_id), now()).unwrap();
        assert!(!transition.changed);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_created_revives_expired_record() {
        // The only path back to active from expired.
        let mut record = premium_record(SubscriptionStatus::Expired);
        record.tier = SubscriptionTier::Free;
        let transition = apply(&record, &created_event(record.user_id), now()).unwrap();
        assert!(transition.changed);
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(transition.record.tier, SubscriptionTier::Premium);
    }

    #[test]
    fn test_cancel_keeps_premium_until_period_end() {
        let record = premium_record(SubscriptionStatus::Active);
        let ends_at = now() + Duration::days(9);
        let event = BillingEvent::SubscriptionCancelled {
            subscription_id: SUB.to_string(),
            ends_at: Some(ends_at),
        };

        let transition = apply(&record, &event, now()).unwrap();
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Cancelled);
        assert_eq!(transition.record.tier, SubscriptionTier::Premium);
        assert_eq!(transition.record.current_period_end, Some(ends_at));
        assert_eq!(
            transition.effects,
            vec![SideEffect::SendCancellationNotice { ends_at: Some(ends_at) }]
        );
    }

    #[test]
    fn test_cancel_twice_is_absorbed() {
        let record = premium_record(SubscriptionStatus::Cancelled);
        let event = BillingEvent::SubscriptionCancelled {
            subscription_id: SUB.to_string(),
            ends_at: None,
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert!(!transition.changed);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_resume_before_period_end() {
        let record = premium_record(SubscriptionStatus::Cancelled);
        let event = BillingEvent::SubscriptionResumed {
            subscription_id: SUB.to_string(),
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Active);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_resume_after_period_end_is_rejected() {
        let mut record = premium_record(SubscriptionStatus::Cancelled);
        record.current_period_end = Some(now() - Duration::days(1));
        let event = BillingEvent::SubscriptionResumed {
            subscription_id: SUB.to_string(),
        };
        assert!(matches!(
            apply(&record, &event, now()),
            Err(BillingError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_expired_downgrades_and_resets_quotas() {
        let record = premium_record(SubscriptionStatus::Cancelled);
        let event = BillingEvent::SubscriptionExpired {
            subscription_id: SUB.to_string(),
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Expired);
        assert_eq!(transition.record.tier, SubscriptionTier::Free);
        assert!(transition.effects.contains(&SideEffect::ResetQuotasToFreeTier));
    }

    #[test]
    fn test_expired_from_active_is_rejected() {
        let record = premium_record(SubscriptionStatus::Active);
        let event = BillingEvent::SubscriptionExpired {
            subscription_id: SUB.to_string(),
        };
        assert!(matches!(
            apply(&record, &event, now()),
            Err(BillingError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_payment_failure_and_recovery_cycle() {
        let record = premium_record(SubscriptionStatus::Active);
        let failed = BillingEvent::PaymentFailed {
            subscription_id: SUB.to_string(),
        };
        let transition = apply(&record, &failed, now()).unwrap();
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(transition.record.tier, SubscriptionTier::Premium);
        assert_eq!(transition.effects, vec![SideEffect::SendPaymentFailedNotice]);

        let recovered = BillingEvent::PaymentRecovered {
            subscription_id: SUB.to_string(),
        };
        let transition = apply(&transition.record, &recovered, now()).unwrap();
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::Active);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_duplicate_payment_failed_is_absorbed() {
        let record = premium_record(SubscriptionStatus::PastDue);
        let event = BillingEvent::PaymentFailed {
            subscription_id: SUB.to_string(),
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert!(!transition.changed);
        assert!(transition.effects.is_empty());
    }

    #[test]
    fn test_subscription_id_mismatch_is_unknown_subscription() {
        let record = premium_record(SubscriptionStatus::Active);
        let event = BillingEvent::SubscriptionCancelled {
            subscription_id: "sub_other".to_string(),
            ends_at: None,
        };
        assert!(matches!(
            apply(&record, &event, now()),
            Err(BillingError::UnknownSubscription(_))
        ));
    }

    #[test]
    fn test_no_event_but_created_reactivates_expired() {
        // Total-order invariant: from expired, nothing except a fresh
        // subscription_created may produce active.
        let mut record = premium_record(SubscriptionStatus::Expired);
        record.tier = SubscriptionTier::Free;

        let events = [
            BillingEvent::SubscriptionResumed { subscription_id: SUB.to_string() },
            BillingEvent::PaymentRecovered { subscription_id: SUB.to_string() },
            BillingEvent::PaymentFailed { subscription_id: SUB.to_string() },
            BillingEvent::SubscriptionCancelled { subscription_id: SUB.to_string(), ends_at: None },
            BillingEvent::SubscriptionUpdated {
                subscription_id: SUB.to_string(),
                status: Some(SubscriptionStatus::Active),
                renews_at: None,
            },
        ];
        for event in events {
            let result = apply(&record, &event, now());
            match result {
                Ok(transition) => assert_ne!(
                    transition.record.subscription_status,
                    SubscriptionStatus::Active,
                    "{} must not reactivate an expired record",
                    event.name()
                ),
                Err(_) => {}
            }
        }
    }

    #[test]
    fn test_updated_syncs_status_and_period() {
        let record = premium_record(SubscriptionStatus::Active);
        let renews_at = now() + Duration::days(60);
        let event = BillingEvent::SubscriptionUpdated {
            subscription_id: SUB.to_string(),
            status: Some(SubscriptionStatus::PastDue),
            renews_at: Some(renews_at),
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert!(transition.changed);
        assert_eq!(transition.record.subscription_status, SubscriptionStatus::PastDue);
        assert_eq!(transition.record.current_period_end, Some(renews_at));
    }

    #[test]
    fn test_updated_with_no_change_is_absorbed() {
        let record = premium_record(SubscriptionStatus::Active);
        let event = BillingEvent::SubscriptionUpdated {
            subscription_id: SUB.to_string(),
            status: Some(SubscriptionStatus::Active),
            renews_at: None,
        };
        let transition = apply(&record, &event, now()).unwrap();
        assert!(!transition.changed);
    }
}
