//! Billing error types

use serde::Serialize;
use time::OffsetDateTime;
use tollgate_shared::{PlanTier, SubscriptionStatus};

pub type BillingResult<T> = Result<T, BillingError>;

/// Structured payload returned when a gated action is denied for exceeding
/// the monthly metered allowance. Serialized as-is into the denial response.
#[derive(Debug, Clone, Serialize)]
pub struct MinutesDenial {
    pub message: String,
    /// Stable machine-readable code: `MONTHLY_MINUTES_LIMIT_EXCEEDED`
    pub error_code: &'static str,
    pub current_usage: f64,
    pub monthly_limit: f64,
    pub usage_percentage: u32,
    #[serde(with = "time::serde::rfc3339")]
    pub reset_date: OffsetDateTime,
    pub upgrade_required: bool,
}

/// Structured payload returned when a gated action requires an active
/// subscription and none qualifies.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionDenial {
    pub message: String,
    /// `NO_SUBSCRIPTION` or `INACTIVE_SUBSCRIPTION`
    pub error_code: &'static str,
    pub current_status: Option<SubscriptionStatus>,
    pub upgrade_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Pricing plan with tier {0} not found")]
    InvalidTier(String),

    #[error("Pricing plan {0} is not active")]
    PlanInactive(PlanTier),

    #[error("Requested {requested} seats exceeds the limit of {limit} seats for {tier} plan")]
    SeatLimitExceeded {
        requested: i32,
        limit: i32,
        tier: PlanTier,
    },

    #[error("Invalid billing cycle: {0}. Must be 'monthly'/'month' or 'yearly'/'year'")]
    InvalidBillingCycle(String),

    #[error("{}", .0.message)]
    MinutesLimitExceeded(Box<MinutesDenial>),

    #[error("{}", .0.message)]
    SubscriptionRequired(Box<SubscriptionDenial>),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payment provider error: {0}")]
    Provider(String),

    #[error("Stripe error: {0}")]
    Stripe(#[from] stripe::StripeError),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<sqlx::Error> for BillingError {
    fn from(e: sqlx::Error) -> Self {
        BillingError::Database(e.to_string())
    }
}

impl BillingError {
    /// Whether this error is a definitive, successfully-computed entitlement
    /// violation. Guards fail closed on these and open on everything else.
    pub fn is_entitlement_violation(&self) -> bool {
        matches!(
            self,
            BillingError::MinutesLimitExceeded(_) | BillingError::SubscriptionRequired(_)
        )
    }

    /// Whether a provider-side subscription update failed in a state that
    /// cannot be recovered in place (the subscription must be replaced).
    pub fn is_unrecoverable_update(&self) -> bool {
        match self {
            BillingError::Provider(msg) => {
                msg.contains("incomplete_expired") || msg.contains("cannot update")
            }
            BillingError::Stripe(e) => {
                let msg = e.to_string();
                msg.contains("incomplete_expired") || msg.contains("cannot update")
            }
            _ => false,
        }
    }
}
