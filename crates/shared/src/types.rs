//! Common types used across Shelfscore

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use uuid::Uuid;

// =============================================================================
// ID Wrappers
// =============================================================================

/// User ID wrapper
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for UserId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

// =============================================================================
// Enums
// =============================================================================

/// Subscription tier for billing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Premium,
}

impl Default for SubscriptionTier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for SubscriptionTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

impl FromStr for SubscriptionTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Self::Free),
            "premium" => Ok(Self::Premium),
            other => Err(format!("unknown subscription tier: {}", other)),
        }
    }
}

/// Subscription status as mirrored from the billing provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Never subscribed
    None,
    Active,
    PastDue,
    Cancelled,
    Expired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::None
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Active => write!(f, "active"),
            Self::PastDue => write!(f, "past_due"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Expired => write!(f, "expired"),
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "active" => Ok(Self::Active),
            "past_due" => Ok(Self::PastDue),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown subscription status: {}", other)),
        }
    }
}

/// Metered resource types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    Scan,
    AiQuestion,
    Export,
}

impl ResourceType {
    /// All metered resource types, in display order
    pub const ALL: [ResourceType; 3] = [Self::Scan, Self::AiQuestion, Self::Export];

    /// The usage period this resource is metered over
    pub fn period_kind(&self) -> PeriodKind {
        match self {
            Self::Scan => PeriodKind::Monthly,
            Self::AiQuestion => PeriodKind::Daily,
            Self::Export => PeriodKind::Monthly,
        }
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::AiQuestion => write!(f, "ai_question"),
            Self::Export => write!(f, "export"),
        }
    }
}

impl FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(Self::Scan),
            "ai_question" => Ok(Self::AiQuestion),
            "export" => Ok(Self::Export),
            other => Err(format!("unknown resource type: {}", other)),
        }
    }
}

/// Usage period granularity for a quota counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PeriodKind {
    Daily,
    Monthly,
}

impl std::fmt::Display for PeriodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Daily => write!(f, "daily"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_round_trip() {
        assert_eq!("premium".parse::<SubscriptionTier>(), Ok(SubscriptionTier::Premium));
        assert_eq!(SubscriptionTier::Free.to_string(), "free");
        assert!("enterprise".parse::<SubscriptionTier>().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SubscriptionStatus::None,
            SubscriptionStatus::Active,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Cancelled,
            SubscriptionStatus::Expired,
        ] {
            assert_eq!(status.to_string().parse::<SubscriptionStatus>(), Ok(status));
        }
    }

    #[test]
    fn test_resource_period_kinds() {
        assert_eq!(ResourceType::Scan.period_kind(), PeriodKind::Monthly);
        assert_eq!(ResourceType::AiQuestion.period_kind(), PeriodKind::Daily);
        assert_eq!(ResourceType::Export.period_kind(), PeriodKind::Monthly);
    }

    #[test]
    fn test_resource_display() {
        assert_eq!(ResourceType::AiQuestion.to_string(), "ai_question");
        assert_eq!("ai_question".parse::<ResourceType>(), Ok(ResourceType::AiQuestion));
    }
}
