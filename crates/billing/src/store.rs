//! Storage and collaborator interfaces
//!
//! The core never talks to Postgres or the wider application directly; it
//! goes through these traits. Production wires the sqlx implementations in
//! [`crate::postgres`]; the test suite (and embedded/demo setups) use
//! [`crate::memory`].

use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use tollgate_shared::PlanTier;

use crate::catalog::PlanDefinition;
use crate::error::BillingResult;
use crate::ledger::SubscriptionRecord;
use crate::usage::{UsageEvent, UsageEventKind};

/// Persistence for the append-only subscription ledger.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Insert a fully-formed record. Records are immutable after insert.
    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord>;

    /// Flip `is_current` off and stamp `superseded_at` on one record. The
    /// only mutation the ledger ever performs.
    async fn supersede(&self, record_id: Uuid, at: OffsetDateTime) -> BillingResult<()>;

    /// Current record for an organization, optionally narrowed to one
    /// external subscription id.
    async fn current(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// All records for an organization, version descending.
    async fn history(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Vec<SubscriptionRecord>>;

    /// Most recently created record carrying this external subscription id,
    /// regardless of currency or organization.
    async fn latest_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>>;

    /// Records for (org, external id) created within `window` before now,
    /// newest first. Backs the duplicate-delivery heuristic.
    async fn created_within(
        &self,
        org_id: Uuid,
        external_id: &str,
        window: Duration,
    ) -> BillingResult<Vec<SubscriptionRecord>>;
}

/// Persistence for append-only usage facts. Aggregates are always derived
/// on read; implementations must not pre-aggregate.
#[async_trait]
pub trait UsageEventStore: Send + Sync {
    async fn insert(&self, event: UsageEvent) -> BillingResult<UsageEvent>;

    /// Events for an organization, newest first, optionally filtered by kind.
    async fn events(
        &self,
        org_id: Uuid,
        kind: Option<UsageEventKind>,
    ) -> BillingResult<Vec<UsageEvent>>;

    /// Sum of quantities for a kind, optionally bounded below by `since`.
    async fn sum_quantity(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<f64>;

    /// Count of events for a kind, optionally bounded below by `since`.
    async fn count(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<u64>;
}

/// Dedup ledger keyed by the payment provider's own event id.
///
/// `claim` must be atomic: exactly one concurrent caller for a given event
/// id may receive `true`. An event whose recorded outcome is `failed` may
/// be claimed again, so provider redelivery retries it.
#[async_trait]
pub trait EventDedupStore: Send + Sync {
    async fn claim(&self, event_id: &str, event_type: &str) -> BillingResult<bool>;

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()>;
}

/// Read access to the pricing catalog (owned by an external collaborator).
#[async_trait]
pub trait PlanCatalog: Send + Sync {
    async fn find_by_tier(&self, tier: PlanTier) -> BillingResult<Option<PlanDefinition>>;

    async fn find_by_product(
        &self,
        provider_product_id: &str,
    ) -> BillingResult<Option<PlanDefinition>>;

    /// Active plans ordered by seat limit ascending.
    async fn list_active(&self) -> BillingResult<Vec<PlanDefinition>>;
}

/// Minimal view of the organizations service: the usage cycle is anchored
/// on the tenant's creation instant.
#[async_trait]
pub trait OrganizationDirectory: Send + Sync {
    async fn created_at(&self, org_id: Uuid) -> BillingResult<Option<OffsetDateTime>>;
}
