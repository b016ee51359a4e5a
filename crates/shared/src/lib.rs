//! Common types used across Tollgate
//!
//! Domain enums shared by the billing core and whatever transport embeds
//! it: plan tiers, subscription lifecycle statuses, and billing cycles.

use serde::{Deserialize, Serialize};

// =============================================================================
// Plan tiers
// =============================================================================

/// Plan tier for billing
///
/// Ordered by typical seat capacity: personal → business → company → custom.
/// `Free` covers organizations without a paid subscription (including trials).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Personal,
    Business,
    Company,
    Custom,
    Free,
}

impl Default for PlanTier {
    fn default() -> Self {
        Self::Free
    }
}

impl std::fmt::Display for PlanTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Personal => write!(f, "personal"),
            Self::Business => write!(f, "business"),
            Self::Company => write!(f, "company"),
            Self::Custom => write!(f, "custom"),
            Self::Free => write!(f, "free"),
        }
    }
}

impl std::str::FromStr for PlanTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "personal" => Ok(Self::Personal),
            "business" => Ok(Self::Business),
            "company" => Ok(Self::Company),
            "custom" => Ok(Self::Custom),
            "free" => Ok(Self::Free),
            _ => Err(format!("Invalid plan tier: {}", s)),
        }
    }
}

// =============================================================================
// Subscription status
// =============================================================================

/// Internal subscription state
///
/// State changes are driven solely by inbound payment-processor events or
/// explicit administrator action; there is no transition-validity table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Cancelled,
    Incomplete,
    IncompleteExpired,
    Unpaid,
    Paused,
    ScheduledForCancellation,
    Expired,
}

impl Default for SubscriptionStatus {
    fn default() -> Self {
        Self::Active
    }
}

impl SubscriptionStatus {
    /// Map a payment-processor status string to the internal state.
    ///
    /// Returns `None` for unrecognized values; the caller decides the
    /// fail-open default.
    pub fn from_provider(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "canceled" => Some(Self::Cancelled),
            "past_due" => Some(Self::PastDue),
            "trialing" => Some(Self::Trialing),
            "incomplete" => Some(Self::Incomplete),
            "incomplete_expired" => Some(Self::IncompleteExpired),
            "unpaid" => Some(Self::Unpaid),
            "paused" => Some(Self::Paused),
            _ => None,
        }
    }

    /// Whether this status grants access to gated features.
    pub fn is_entitled(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Trialing => "trialing",
            Self::PastDue => "past_due",
            Self::Cancelled => "cancelled",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Unpaid => "unpaid",
            Self::Paused => "paused",
            Self::ScheduledForCancellation => "scheduled_for_cancellation",
            Self::Expired => "expired",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Billing cycle
// =============================================================================

/// Billing cycle for a paid plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl BillingCycle {
    /// Parse a billing cycle, accepting both "monthly"/"yearly" and the
    /// provider's "month"/"year" interval strings.
    pub fn normalize(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "monthly" | "month" => Some(Self::Monthly),
            "yearly" | "year" | "annual" => Some(Self::Yearly),
            _ => None,
        }
    }
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_round_trips_through_display_and_from_str() {
        for tier in [
            PlanTier::Personal,
            PlanTier::Business,
            PlanTier::Company,
            PlanTier::Custom,
            PlanTier::Free,
        ] {
            assert_eq!(tier.to_string().parse::<PlanTier>(), Ok(tier));
        }
    }

    #[test]
    fn provider_status_mapping_covers_known_values() {
        assert_eq!(
            SubscriptionStatus::from_provider("active"),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("canceled"),
            Some(SubscriptionStatus::Cancelled)
        );
        assert_eq!(
            SubscriptionStatus::from_provider("incomplete_expired"),
            Some(SubscriptionStatus::IncompleteExpired)
        );
        assert_eq!(SubscriptionStatus::from_provider("bogus"), None);
    }

    #[test]
    fn billing_cycle_accepts_provider_interval_strings() {
        assert_eq!(BillingCycle::normalize("monthly"), Some(BillingCycle::Monthly));
        assert_eq!(BillingCycle::normalize("Month"), Some(BillingCycle::Monthly));
        assert_eq!(BillingCycle::normalize("year"), Some(BillingCycle::Yearly));
        assert_eq!(BillingCycle::normalize("weekly"), None);
    }

    #[test]
    fn entitled_statuses() {
        assert!(SubscriptionStatus::Active.is_entitled());
        assert!(SubscriptionStatus::Trialing.is_entitled());
        assert!(!SubscriptionStatus::PastDue.is_entitled());
        assert!(!SubscriptionStatus::ScheduledForCancellation.is_entitled());
    }
}
