//! Payment-provider object model
//!
//! Webhook payloads arrive as raw JSON and the provider API returns deeply
//! nested objects with expandable references (a field may be a bare id or a
//! full object). Everything is flattened here into plain structs before any
//! business logic sees it, so reconciliation never pattern-matches on raw
//! JSON shapes.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use time::OffsetDateTime;

use crate::error::{BillingError, BillingResult};

/// A webhook event envelope: provider event id, dotted type string, and the
/// affected object payload.
#[derive(Debug, Clone)]
pub struct BillingEvent {
    pub id: String,
    pub event_type: String,
    pub object: serde_json::Value,
}

impl BillingEvent {
    pub fn from_json(value: &serde_json::Value) -> BillingResult<Self> {
        let raw: RawEvent = serde_json::from_value(value.clone())?;
        Ok(Self {
            id: raw.id,
            event_type: raw.event_type,
            object: raw.data.object,
        })
    }

    /// Parse a raw webhook request body.
    pub fn from_slice(bytes: &[u8]) -> BillingResult<Self> {
        let value: serde_json::Value = serde_json::from_slice(bytes)?;
        Self::from_json(&value)
    }
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    event_type: String,
    data: RawEventData,
}

#[derive(Deserialize)]
struct RawEventData {
    object: serde_json::Value,
}

/// A reference that the provider serializes either as a bare id string or
/// as an expanded object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum Expandable {
    Id(String),
    Object { id: String },
}

impl Expandable {
    fn into_id(self) -> String {
        match self {
            Self::Id(id) | Self::Object { id } => id,
        }
    }
}

fn unix_ts(ts: Option<i64>) -> Option<OffsetDateTime> {
    ts.and_then(|t| OffsetDateTime::from_unix_timestamp(t).ok())
}

// =============================================================================
// Subscription
// =============================================================================

/// Cancellation context the provider attaches when a subscription is
/// cancelled through its own surfaces.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CancellationDetails {
    pub reason: Option<String>,
    pub feedback: Option<String>,
    pub comment: Option<String>,
}

/// Flattened provider subscription.
#[derive(Debug, Clone)]
pub struct ProviderSubscription {
    pub id: String,
    /// Provider-native status string ("active", "past_due", ...).
    pub status: String,
    pub customer_id: Option<String>,
    pub latest_invoice_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub cancel_at_period_end: bool,
    pub current_period_end: Option<OffsetDateTime>,
    pub canceled_at: Option<OffsetDateTime>,
    pub cancellation_details: CancellationDetails,
    pub price_id: Option<String>,
    pub product_id: Option<String>,
    /// Free-text plan identifier, used for keyword tier inference.
    pub plan_id: Option<String>,
    pub quantity: i32,
    pub default_payment_method_id: Option<String>,
}

#[derive(Deserialize)]
struct RawSubscription {
    id: String,
    #[serde(default)]
    status: String,
    customer: Option<Expandable>,
    latest_invoice: Option<Expandable>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    cancel_at_period_end: bool,
    current_period_end: Option<i64>,
    canceled_at: Option<i64>,
    cancellation_details: Option<CancellationDetails>,
    #[serde(default)]
    items: RawItemList,
    plan: Option<RawPlan>,
    quantity: Option<i64>,
    default_payment_method: Option<Expandable>,
}

#[derive(Default, Deserialize)]
struct RawItemList {
    #[serde(default)]
    data: Vec<RawItem>,
}

#[derive(Deserialize)]
struct RawItem {
    price: Option<RawPrice>,
    plan: Option<RawPlan>,
    quantity: Option<i64>,
}

#[derive(Deserialize)]
struct RawPrice {
    id: String,
    product: Option<Expandable>,
}

#[derive(Deserialize)]
struct RawPlan {
    id: String,
    product: Option<Expandable>,
}

impl ProviderSubscription {
    /// Flatten the raw subscription object from a webhook payload or an API
    /// response body.
    pub fn from_object(object: &serde_json::Value) -> BillingResult<Self> {
        let raw: RawSubscription = serde_json::from_value(object.clone())?;

        let first_item = raw.items.data.into_iter().next();
        let (item_price, item_plan, item_quantity) = match first_item {
            Some(item) => (item.price, item.plan, item.quantity),
            None => (None, None, None),
        };

        let price_id = item_price.as_ref().map(|p| p.id.clone());
        let product_id = item_price
            .and_then(|p| p.product)
            .or_else(|| raw.plan.as_ref().and_then(|p| p.product.clone()))
            .or_else(|| item_plan.as_ref().and_then(|p| p.product.clone()))
            .map(Expandable::into_id);
        let plan_id = raw
            .plan
            .map(|p| p.id)
            .or(item_plan.map(|p| p.id));

        let quantity = raw
            .quantity
            .or(item_quantity)
            .map(|q| q.clamp(1, i32::MAX as i64) as i32)
            .unwrap_or(1);

        Ok(Self {
            id: raw.id,
            status: raw.status,
            customer_id: raw.customer.map(Expandable::into_id),
            latest_invoice_id: raw.latest_invoice.map(Expandable::into_id),
            metadata: raw.metadata,
            cancel_at_period_end: raw.cancel_at_period_end,
            current_period_end: unix_ts(raw.current_period_end),
            canceled_at: unix_ts(raw.canceled_at),
            cancellation_details: raw.cancellation_details.unwrap_or_default(),
            price_id,
            product_id,
            plan_id,
            quantity,
            default_payment_method_id: raw.default_payment_method.map(Expandable::into_id),
        })
    }
}

// =============================================================================
// Other provider objects
// =============================================================================

#[derive(Debug, Clone)]
pub struct ProviderInvoice {
    pub id: String,
    pub subscription_id: Option<String>,
    pub payment_intent_id: Option<String>,
    pub metadata: HashMap<String, String>,
}

#[derive(Deserialize)]
struct RawInvoice {
    id: String,
    subscription: Option<Expandable>,
    payment_intent: Option<Expandable>,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl ProviderInvoice {
    pub fn from_object(object: &serde_json::Value) -> BillingResult<Self> {
        let raw: RawInvoice = serde_json::from_value(object.clone())?;
        Ok(Self {
            id: raw.id,
            subscription_id: raw.subscription.map(Expandable::into_id),
            payment_intent_id: raw.payment_intent.map(Expandable::into_id),
            metadata: raw.metadata,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCheckoutSession {
    pub id: String,
    pub client_reference_id: Option<String>,
    pub metadata: HashMap<String, String>,
    pub subscription_id: Option<String>,
    pub customer_id: Option<String>,
}

#[derive(Deserialize)]
struct RawCheckoutSession {
    id: String,
    client_reference_id: Option<String>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    subscription: Option<Expandable>,
    customer: Option<Expandable>,
}

impl ProviderCheckoutSession {
    pub fn from_object(object: &serde_json::Value) -> BillingResult<Self> {
        let raw: RawCheckoutSession = serde_json::from_value(object.clone())?;
        Ok(Self {
            id: raw.id,
            client_reference_id: raw.client_reference_id,
            metadata: raw.metadata,
            subscription_id: raw.subscription.map(Expandable::into_id),
            customer_id: raw.customer.map(Expandable::into_id),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProviderCustomer {
    pub id: String,
    pub metadata: HashMap<String, String>,
}

// =============================================================================
// Provider gateway
// =============================================================================

/// Changes to apply to a live provider subscription.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionUpdate {
    pub price_id: Option<String>,
    pub quantity: Option<u64>,
    pub metadata: Option<HashMap<String, String>>,
}

/// Outbound calls to the payment provider needed by reconciliation, identity
/// resolution, and seat/plan updates. Production wires the Stripe-backed
/// implementation in [`crate::gateway`].
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn subscription(&self, subscription_id: &str) -> BillingResult<ProviderSubscription>;

    async fn update_subscription(
        &self,
        subscription_id: &str,
        update: SubscriptionUpdate,
    ) -> BillingResult<ProviderSubscription>;

    /// Create a fresh subscription under an existing customer. Used when an
    /// existing one can no longer be updated in place.
    async fn create_subscription(
        &self,
        customer_id: &str,
        price_id: &str,
        quantity: u64,
        metadata: HashMap<String, String>,
    ) -> BillingResult<ProviderSubscription>;

    async fn invoice(&self, invoice_id: &str) -> BillingResult<ProviderInvoice>;

    async fn checkout_sessions_for_payment_intent(
        &self,
        payment_intent_id: &str,
    ) -> BillingResult<Vec<ProviderCheckoutSession>>;

    async fn checkout_sessions_for_customer(
        &self,
        customer_id: &str,
        limit: u64,
    ) -> BillingResult<Vec<ProviderCheckoutSession>>;

    async fn customer(&self, customer_id: &str) -> BillingResult<ProviderCustomer>;
}
