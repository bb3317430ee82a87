//! Billing configuration
//!
//! Everything the control plane needs from the environment: the webhook
//! signing secret, the anti-replay window, lock tuning, the idempotency
//! retention window, and the per-tier quota limit table.
//!
//! Quota limits are configurable via environment variables:
//! - `QUOTA_FREE_SCANS_PER_MONTH`: free-tier scans per month (default: 30)
//! - `QUOTA_FREE_AI_QUESTIONS_PER_DAY`: free-tier AI questions per day (default: 0)
//! - `QUOTA_FREE_EXPORTS_PER_MONTH`: free-tier exports per month (default: 1)

use shelfscore_shared::{ResourceType, SubscriptionTier};

use crate::error::{BillingError, BillingResult};

/// Sentinel meaning "no limit" in counters and admissions
pub const UNLIMITED: i64 = -1;

fn env_i64(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Configuration for the billing control plane
#[derive(Debug, Clone)]
pub struct BillingConfig {
    /// Shared secret for webhook HMAC verification
    pub webhook_secret: String,
    /// Anti-replay window for webhook events, in seconds
    pub replay_window_secs: i64,
    /// TTL of a quota lease, in milliseconds
    pub lock_ttl_ms: u64,
    /// How many times to try acquiring a contended lease before failing busy
    pub lock_acquire_attempts: u32,
    /// Spacing between lease acquisition attempts, in milliseconds
    pub lock_retry_delay_ms: u64,
    /// How long processed webhook event ids are retained, in days
    pub idempotency_retention_days: i64,
    /// How long usage events are retained, in days
    pub usage_retention_days: i64,
}

impl BillingConfig {
    /// Create config from environment variables
    pub fn from_env() -> BillingResult<Self> {
        Ok(Self {
            webhook_secret: std::env::var("BILLING_WEBHOOK_SECRET")
                .map_err(|_| BillingError::Config("BILLING_WEBHOOK_SECRET not set".to_string()))?,
            replay_window_secs: env_i64("BILLING_REPLAY_WINDOW_SECS", 300),
            lock_ttl_ms: env_u64("QUOTA_LOCK_TTL_MS", 5_000),
            lock_acquire_attempts: env_u64("QUOTA_LOCK_ACQUIRE_ATTEMPTS", 3) as u32,
            lock_retry_delay_ms: env_u64("QUOTA_LOCK_RETRY_DELAY_MS", 50),
            idempotency_retention_days: env_i64("WEBHOOK_RETENTION_DAYS", 30),
            usage_retention_days: env_i64("USAGE_RETENTION_DAYS", 90),
        })
    }
}

/// Per-tier, per-resource quota limits
///
/// Premium is unlimited across the board; free-tier limits come from the
/// environment with sane defaults. `-1` means unlimited.
#[derive(Debug, Clone, Copy)]
pub struct LimitTable {
    free_scans_per_month: i64,
    free_ai_questions_per_day: i64,
    free_exports_per_month: i64,
}

impl LimitTable {
    /// Load the limit table from environment variables
    pub fn from_env() -> Self {
        Self {
            free_scans_per_month: env_i64("QUOTA_FREE_SCANS_PER_MONTH", 30),
            free_ai_questions_per_day: env_i64("QUOTA_FREE_AI_QUESTIONS_PER_DAY", 0),
            free_exports_per_month: env_i64("QUOTA_FREE_EXPORTS_PER_MONTH", 1),
        }
    }

    /// Build a table with explicit free-tier limits (used by tests)
    pub fn with_free_limits(scans: i64, ai_questions: i64, exports: i64) -> Self {
        Self {
            free_scans_per_month: scans,
            free_ai_questions_per_day: ai_questions,
            free_exports_per_month: exports,
        }
    }

    /// Resolve the applicable limit for a tier and resource
    pub fn limit_for(&self, tier: SubscriptionTier, resource: ResourceType) -> i64 {
        match tier {
            SubscriptionTier::Premium => UNLIMITED,
            SubscriptionTier::Free => match resource {
                ResourceType::Scan => self.free_scans_per_month,
                ResourceType::AiQuestion => self.free_ai_questions_per_day,
                ResourceType::Export => self.free_exports_per_month,
            },
        }
    }
}

impl Default for LimitTable {
    fn default() -> Self {
        Self::from_env()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_premium_is_unlimited_everywhere() {
        let table = LimitTable::with_free_limits(30, 0, 1);
        for resource in ResourceType::ALL {
            assert_eq!(table.limit_for(SubscriptionTier::Premium, resource), UNLIMITED);
        }
    }

    #[test]
    fn test_free_limits_resolve_per_resource() {
        let table = LimitTable::with_free_limits(30, 0, 1);
        assert_eq!(table.limit_for(SubscriptionTier::Free, ResourceType::Scan), 30);
        assert_eq!(table.limit_for(SubscriptionTier::Free, ResourceType::AiQuestion), 0);
        assert_eq!(table.limit_for(SubscriptionTier::Free, ResourceType::Export), 1);
    }
}
