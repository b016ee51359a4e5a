// Billing crate clippy configuration
// These are intentional patterns in this crate:
#![allow(clippy::too_many_arguments)] // Some provider operations require many parameters
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Tollgate Billing Core
//!
//! Tenant billing entitlement for multi-tenant deployments.
//!
//! ## Features
//!
//! - **Subscription Ledger**: Append-only, versioned history of every
//!   subscription state change
//! - **Reconciliation**: Turns payment-provider webhook events into ledger
//!   appends, with event dedup and tenant identity resolution
//! - **Usage Accounting**: Metered minutes and seat facts against monthly
//!   cycles anchored on tenant creation
//! - **Seat & Plan Updates**: Validated seat/plan changes pushed out to the
//!   payment provider
//! - **Entitlement Guards**: Fail-open access checks with structured denials
//! - **Invariants**: Runnable consistency checks over the ledger

pub mod catalog;
pub mod client;
pub mod config;
pub mod cycle;
pub mod entitlement;
pub mod error;
pub mod gateway;
pub mod invariants;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod provider;
pub mod reconcile;
pub mod resolve;
pub mod seats;
pub mod store;
pub mod subscriptions;
pub mod usage;


// Catalog
pub use catalog::{infer_tier_from_plan_id, PlanDefinition};

// Client
pub use client::{StripeClient, StripeConfig};

// Config
pub use config::{LedgerConfig, UsageLimitsConfig};

// Cycle
pub use cycle::{cycle_bounds, cycle_start};

// Entitlement
pub use entitlement::{
    EntitlementGuard, INACTIVE_SUBSCRIPTION_CODE, MINUTES_LIMIT_CODE, NO_SUBSCRIPTION_CODE,
};

// Error
pub use error::{BillingError, BillingResult, MinutesDenial, SubscriptionDenial};

// Gateway
pub use gateway::StripeGateway;

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Ledger
pub use ledger::{
    FieldChange, LedgerService, NewSubscriptionRecord, SubscriptionChanges, SubscriptionRecord,
    SubscriptionTimeline, TimelineEntry, TimelineSummary,
};

// Provider
pub use provider::{
    BillingEvent, CancellationDetails, PaymentProvider, ProviderCheckoutSession, ProviderCustomer,
    ProviderInvoice, ProviderSubscription, SubscriptionUpdate,
};

// Reconcile
pub use reconcile::{ReconcileEngine, ReconcileOutcome};

// Resolve
pub use resolve::{OrgResolver, ResolvedOrg};

// Seats
pub use seats::{SeatService, SeatUsageSummary, SeatValidationResult};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Usage
pub use usage::{
    MonthlyMinutesUsage, ResetHistoryEntry, ResetOutcome, UsageEvent, UsageEventKind, UsageService,
    UsageSummary,
};

use std::sync::Arc;

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub ledger: LedgerService,
    pub reconcile: ReconcileEngine,
    pub subscriptions: SubscriptionService,
    pub seats: SeatService,
    pub usage: UsageService,
    pub entitlement: EntitlementGuard,
    pub invariants: InvariantChecker,
}

impl BillingService {
    /// Create a new billing service from environment variables
    pub fn from_env(pool: PgPool) -> BillingResult<Self> {
        Ok(Self::build(
            StripeClient::from_env()?,
            pool,
            LedgerConfig::from_env(),
            UsageLimitsConfig::from_env(),
        ))
    }

    /// Create a new billing service with explicit config
    pub fn new(
        config: StripeConfig,
        pool: PgPool,
        ledger_config: LedgerConfig,
        usage_limits: UsageLimitsConfig,
    ) -> Self {
        Self::build(StripeClient::new(config), pool, ledger_config, usage_limits)
    }

    fn build(
        stripe: StripeClient,
        pool: PgPool,
        ledger_config: LedgerConfig,
        usage_limits: UsageLimitsConfig,
    ) -> Self {
        let store: Arc<dyn store::SubscriptionStore> =
            Arc::new(postgres::PgSubscriptionStore::new(pool.clone()));
        let events: Arc<dyn store::UsageEventStore> =
            Arc::new(postgres::PgUsageEventStore::new(pool.clone()));
        let dedup: Arc<dyn store::EventDedupStore> =
            Arc::new(postgres::PgEventDedupStore::new(pool.clone()));
        let catalog: Arc<dyn store::PlanCatalog> =
            Arc::new(postgres::PgPlanCatalog::new(pool.clone()));
        let orgs: Arc<dyn store::OrganizationDirectory> =
            Arc::new(postgres::PgOrganizationDirectory::new(pool));
        let provider: Arc<dyn PaymentProvider> = Arc::new(StripeGateway::new(stripe));

        let ledger = LedgerService::new(store.clone(), ledger_config);
        let usage = UsageService::new(events, orgs, store.clone(), catalog.clone(), usage_limits);

        Self {
            reconcile: ReconcileEngine::new(ledger.clone(), provider.clone(), dedup),
            subscriptions: SubscriptionService::new(ledger.clone(), provider, catalog.clone()),
            seats: SeatService::new(ledger.clone(), catalog),
            entitlement: EntitlementGuard::new(usage.clone(), ledger.clone()),
            invariants: InvariantChecker::new(store),
            ledger,
            usage,
        }
    }

    /// Parse and reconcile a raw webhook body. The transport layer verifies
    /// the provider signature before handing the bytes over.
    pub async fn handle_webhook(&self, body: &[u8]) -> BillingResult<ReconcileOutcome> {
        let event = BillingEvent::from_slice(body)?;
        self.reconcile.handle_event(&event).await
    }
}
