//! Postgres store implementations
//!
//! sqlx-backed implementations of the storage traits. Schema lives in
//! `migrations/`; records and facts are insert-only apart from the single
//! supersede update the ledger performs.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use tollgate_shared::PlanTier;

use crate::catalog::PlanDefinition;
use crate::error::{BillingError, BillingResult};
use crate::ledger::SubscriptionRecord;
use crate::store::{
    EventDedupStore, OrganizationDirectory, PlanCatalog, SubscriptionStore, UsageEventStore,
};
use crate::usage::{UsageEvent, UsageEventKind};

// =============================================================================
// Subscription ledger
// =============================================================================

pub struct PgSubscriptionStore {
    pool: PgPool,
}

impl PgSubscriptionStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SubscriptionStore for PgSubscriptionStore {
    async fn insert(&self, record: SubscriptionRecord) -> BillingResult<SubscriptionRecord> {
        let saved = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            INSERT INTO subscription_records (
                id, organization_id, external_subscription_id, seats_count, status,
                is_current, version, previous_version_id, created_at, superseded_at,
                change_reason, change_metadata, is_scheduled_for_cancellation,
                scheduled_cancellation_date, cancellation_reason, cancellation_feedback,
                cancellation_comment, provider_customer_id, provider_price_id,
                provider_product_id, provider_payment_method_id, provider_plan_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22)
            RETURNING *
            "#,
        )
        .bind(record.id)
        .bind(record.organization_id)
        .bind(&record.external_subscription_id)
        .bind(record.seats_count)
        .bind(record.status)
        .bind(record.is_current)
        .bind(record.version)
        .bind(record.previous_version_id)
        .bind(record.created_at)
        .bind(record.superseded_at)
        .bind(&record.change_reason)
        .bind(&record.change_metadata)
        .bind(record.is_scheduled_for_cancellation)
        .bind(record.scheduled_cancellation_date)
        .bind(&record.cancellation_reason)
        .bind(&record.cancellation_feedback)
        .bind(&record.cancellation_comment)
        .bind(&record.provider_customer_id)
        .bind(&record.provider_price_id)
        .bind(&record.provider_product_id)
        .bind(&record.provider_payment_method_id)
        .bind(&record.provider_plan_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn supersede(&self, record_id: Uuid, at: OffsetDateTime) -> BillingResult<()> {
        let result = sqlx::query(
            "UPDATE subscription_records SET is_current = FALSE, superseded_at = $2 WHERE id = $1",
        )
        .bind(record_id)
        .bind(at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(BillingError::NotFound(format!(
                "Subscription record {} not found",
                record_id
            )));
        }
        Ok(())
    }

    async fn current(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscription_records
            WHERE organization_id = $1
              AND is_current = TRUE
              AND ($2::text IS NULL OR external_subscription_id = $2)
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(org_id)
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn history(
        &self,
        org_id: Uuid,
        external_id: Option<&str>,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscription_records
            WHERE organization_id = $1
              AND ($2::text IS NULL OR external_subscription_id = $2)
            ORDER BY version DESC, created_at DESC
            "#,
        )
        .bind(org_id)
        .bind(external_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn latest_by_external_id(
        &self,
        external_id: &str,
    ) -> BillingResult<Option<SubscriptionRecord>> {
        let record = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscription_records
            WHERE external_subscription_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn created_within(
        &self,
        org_id: Uuid,
        external_id: &str,
        window: Duration,
    ) -> BillingResult<Vec<SubscriptionRecord>> {
        let records = sqlx::query_as::<_, SubscriptionRecord>(
            r#"
            SELECT * FROM subscription_records
            WHERE organization_id = $1
              AND external_subscription_id = $2
              AND created_at >= NOW() - make_interval(secs => $3)
            ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .bind(external_id)
        .bind(window.as_secs_f64())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }
}

// =============================================================================
// Usage facts
// =============================================================================

pub struct PgUsageEventStore {
    pool: PgPool,
}

impl PgUsageEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl UsageEventStore for PgUsageEventStore {
    async fn insert(&self, event: UsageEvent) -> BillingResult<UsageEvent> {
        let saved = sqlx::query_as::<_, UsageEvent>(
            r#"
            INSERT INTO usage_events (id, organization_id, user_id, kind, metadata, quantity, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(event.id)
        .bind(event.organization_id)
        .bind(event.user_id)
        .bind(event.kind)
        .bind(&event.metadata)
        .bind(event.quantity)
        .bind(event.created_at)
        .fetch_one(&self.pool)
        .await?;
        Ok(saved)
    }

    async fn events(
        &self,
        org_id: Uuid,
        kind: Option<UsageEventKind>,
    ) -> BillingResult<Vec<UsageEvent>> {
        let events = sqlx::query_as::<_, UsageEvent>(
            r#"
            SELECT * FROM usage_events
            WHERE organization_id = $1
              AND ($2::varchar IS NULL OR kind = $2)
            ORDER BY created_at DESC
            "#,
        )
        .bind(org_id)
        .bind(kind)
        .fetch_all(&self.pool)
        .await?;
        Ok(events)
    }

    async fn sum_quantity(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<f64> {
        let total: f64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(SUM(quantity), 0)::float8 FROM usage_events
            WHERE organization_id = $1
              AND kind = $2
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            "#,
        )
        .bind(org_id)
        .bind(kind)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn count(
        &self,
        org_id: Uuid,
        kind: UsageEventKind,
        since: Option<OffsetDateTime>,
    ) -> BillingResult<u64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM usage_events
            WHERE organization_id = $1
              AND kind = $2
              AND ($3::timestamptz IS NULL OR created_at >= $3)
            "#,
        )
        .bind(org_id)
        .bind(kind)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }
}

// =============================================================================
// Event dedup
// =============================================================================

pub struct PgEventDedupStore {
    pool: PgPool,
}

impl PgEventDedupStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventDedupStore for PgEventDedupStore {
    /// Atomic claim: the insert either takes the event id or hits the
    /// primary key and returns nothing. Exactly one concurrent caller wins.
    /// An event whose previous delivery failed may be reclaimed, so the
    /// provider's redelivery gets another attempt.
    async fn claim(&self, event_id: &str, event_type: &str) -> BillingResult<bool> {
        let claimed: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO billing_webhook_events (event_id, event_type, status, received_at)
            VALUES ($1, $2, 'processing', NOW())
            ON CONFLICT (event_id) DO UPDATE
                SET status = 'processing', received_at = NOW()
                WHERE billing_webhook_events.status = 'failed'
            RETURNING event_id
            "#,
        )
        .bind(event_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;
        Ok(claimed.is_some())
    }

    async fn record_outcome(
        &self,
        event_id: &str,
        outcome: &str,
        error: Option<&str>,
    ) -> BillingResult<()> {
        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET status = $2, error = $3, processed_at = NOW()
            WHERE event_id = $1
            "#,
        )
        .bind(event_id)
        .bind(outcome)
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// =============================================================================
// Plan catalog
// =============================================================================

pub struct PgPlanCatalog {
    pool: PgPool,
}

impl PgPlanCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PlanCatalog for PgPlanCatalog {
    async fn find_by_tier(&self, tier: PlanTier) -> BillingResult<Option<PlanDefinition>> {
        let plan = sqlx::query_as::<_, PlanDefinition>(
            "SELECT * FROM pricing_plans WHERE tier = $1 LIMIT 1",
        )
        .bind(tier)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn find_by_product(
        &self,
        provider_product_id: &str,
    ) -> BillingResult<Option<PlanDefinition>> {
        let plan = sqlx::query_as::<_, PlanDefinition>(
            "SELECT * FROM pricing_plans WHERE provider_product_id = $1 LIMIT 1",
        )
        .bind(provider_product_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(plan)
    }

    async fn list_active(&self) -> BillingResult<Vec<PlanDefinition>> {
        let plans = sqlx::query_as::<_, PlanDefinition>(
            "SELECT * FROM pricing_plans WHERE is_active = TRUE ORDER BY seat_limit ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(plans)
    }
}

// =============================================================================
// Organization directory
// =============================================================================

pub struct PgOrganizationDirectory {
    pool: PgPool,
}

impl PgOrganizationDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OrganizationDirectory for PgOrganizationDirectory {
    async fn created_at(&self, org_id: Uuid) -> BillingResult<Option<OffsetDateTime>> {
        let created_at: Option<OffsetDateTime> =
            sqlx::query_scalar("SELECT created_at FROM organizations WHERE id = $1")
                .bind(org_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(created_at)
    }
}
